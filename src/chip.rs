//! Logical state of the host-side CAN controller.
//!
//! Every transition goes through [`Chip`], which issues the control commands that move the
//! remote chip and only commits the new local state once the host acknowledged them.

use crate::control::CommandSink;
use crate::error::{CommandError, TransitionError};
use crate::proto::command::{ChipOp, CtrlCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipState {
    Disabled,
    Enabled,
    Frozen,
    Running,
    /// Control channel lost. Only a freeze or a soft reset is accepted.
    ErrorActive,
    Sleeping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipEvent {
    Register,
    Open,
    Close,
    Suspend,
    Resume,
    Remove,
    Freeze,
    Unfreeze,
    SoftReset,
}

impl ChipEvent {
    pub const ALL: [ChipEvent; 9] = [
        ChipEvent::Register,
        ChipEvent::Open,
        ChipEvent::Close,
        ChipEvent::Suspend,
        ChipEvent::Resume,
        ChipEvent::Remove,
        ChipEvent::Freeze,
        ChipEvent::Unfreeze,
        ChipEvent::SoftReset,
    ];
}

#[derive(Debug)]
pub struct Chip {
    state: ChipState,
    /// State to return to on unfreeze.
    frozen_from: Option<ChipState>,
    /// State to return to on resume.
    suspended_from: Option<ChipState>,
}

impl Default for Chip {
    fn default() -> Self {
        Self::new()
    }
}

impl Chip {
    pub fn new() -> Self {
        Self {
            state: ChipState::Disabled,
            frozen_from: None,
            suspended_from: None,
        }
    }

    pub fn state(&self) -> ChipState {
        self.state
    }

    /// Command and resulting state for a simple transition, `None` when illegal.
    fn plan(&self, event: ChipEvent) -> Option<(ChipOp, ChipState)> {
        use ChipState::*;
        match (event, self.state) {
            (ChipEvent::Open, Enabled) => Some((ChipOp::Enable, Running)),
            (ChipEvent::Close, Running) => Some((ChipOp::Disable, Enabled)),
            (ChipEvent::Suspend, Enabled | Running) => Some((ChipOp::Disable, Sleeping)),
            (ChipEvent::Resume, Sleeping) => {
                Some((ChipOp::Enable, self.suspended_from.unwrap_or(Enabled)))
            }
            (ChipEvent::Remove, Enabled | Running) => Some((ChipOp::Disable, Disabled)),
            (ChipEvent::Freeze, Frozen) => None,
            (ChipEvent::Freeze, _) => Some((ChipOp::Freeze, Frozen)),
            (ChipEvent::Unfreeze, Frozen) => {
                Some((ChipOp::Unfreeze, self.frozen_from.unwrap_or(Disabled)))
            }
            (ChipEvent::SoftReset, _) => Some((ChipOp::SoftReset, Disabled)),
            _ => None,
        }
    }

    fn invalid(&self, event: ChipEvent) -> TransitionError {
        TransitionError::InvalidTransition {
            from: self.state,
            event,
        }
    }

    fn apply(
        &mut self,
        event: ChipEvent,
        ctrl: &mut impl CommandSink,
    ) -> Result<ChipState, TransitionError> {
        let (op, to) = self.plan(event).ok_or_else(|| self.invalid(event))?;
        ctrl.execute(CtrlCommand::Chip(op))
            .map_err(|source| TransitionError::Command { event, source })?;

        let from = self.state;
        match event {
            ChipEvent::Suspend => self.suspended_from = Some(from),
            ChipEvent::Resume => self.suspended_from = None,
            ChipEvent::Freeze => self.frozen_from = Some(from),
            ChipEvent::Unfreeze => self.frozen_from = None,
            ChipEvent::SoftReset => {
                self.frozen_from = None;
                self.suspended_from = None;
            }
            _ => {}
        }
        self.state = to;
        log::debug!("chip {:?}: {:?} -> {:?}", event, from, to);
        Ok(to)
    }

    /// Bring a freshly attached chip to `Enabled`: disable, then enable. A rejected enable is
    /// unwound with another disable so the host is never left enabled behind an
    /// unregistered interface.
    pub fn register(&mut self, ctrl: &mut impl CommandSink) -> Result<(), TransitionError> {
        let event = ChipEvent::Register;
        if self.state != ChipState::Disabled {
            return Err(self.invalid(event));
        }
        ctrl.execute(CtrlCommand::Chip(ChipOp::Disable))
            .map_err(|source| TransitionError::Command { event, source })?;

        if let Err(source) = ctrl.execute(CtrlCommand::Chip(ChipOp::Enable)) {
            if !matches!(source, CommandError::QueueBroken) {
                if let Err(e) = ctrl.execute(CtrlCommand::Chip(ChipOp::Disable)) {
                    log::warn!("chip register: unwind disable failed: {e}");
                }
            }
            self.state = ChipState::Disabled;
            return Err(TransitionError::Command { event, source });
        }
        self.state = ChipState::Enabled;
        log::debug!("chip {:?}: Disabled -> Enabled", event);
        Ok(())
    }

    pub fn open(&mut self, ctrl: &mut impl CommandSink) -> Result<ChipState, TransitionError> {
        self.apply(ChipEvent::Open, ctrl)
    }

    pub fn close(&mut self, ctrl: &mut impl CommandSink) -> Result<ChipState, TransitionError> {
        self.apply(ChipEvent::Close, ctrl)
    }

    pub fn suspend(&mut self, ctrl: &mut impl CommandSink) -> Result<ChipState, TransitionError> {
        self.apply(ChipEvent::Suspend, ctrl)
    }

    pub fn resume(&mut self, ctrl: &mut impl CommandSink) -> Result<ChipState, TransitionError> {
        self.apply(ChipEvent::Resume, ctrl)
    }

    pub fn remove(&mut self, ctrl: &mut impl CommandSink) -> Result<ChipState, TransitionError> {
        self.apply(ChipEvent::Remove, ctrl)
    }

    pub fn freeze(&mut self, ctrl: &mut impl CommandSink) -> Result<ChipState, TransitionError> {
        self.apply(ChipEvent::Freeze, ctrl)
    }

    pub fn unfreeze(&mut self, ctrl: &mut impl CommandSink) -> Result<ChipState, TransitionError> {
        self.apply(ChipEvent::Unfreeze, ctrl)
    }

    pub fn soft_reset(
        &mut self,
        ctrl: &mut impl CommandSink,
    ) -> Result<ChipState, TransitionError> {
        self.apply(ChipEvent::SoftReset, ctrl)
    }

    /// Dispatch by event.
    pub fn handle(
        &mut self,
        event: ChipEvent,
        ctrl: &mut impl CommandSink,
    ) -> Result<ChipState, TransitionError> {
        match event {
            ChipEvent::Register => self.register(ctrl).map(|()| self.state),
            _ => self.apply(event, ctrl),
        }
    }

    /// The control channel is gone; the local view can no longer be trusted.
    pub fn fail(&mut self) {
        if self.state != ChipState::ErrorActive {
            log::debug!("chip: {:?} -> ErrorActive", self.state);
        }
        self.state = ChipState::ErrorActive;
    }
}
