//! Synchronous command/ack exchanges over the control queue.
//!
//! One exchange is `[header][payload?] -> [response?][ack]`. The caller blocks until the host
//! hands the chain back or the queue breaks; there is no timeout at this level.

use crate::config::PollMode;
use crate::error::CommandError;
use crate::features::Features;
use crate::proto::command::{ACK_SENTINEL, Ack, CtrlCommand};
use crate::transport::{CTRL_QUEUE, Completion, QueueHandle, Token, Transport};

/// Anything that can run a control command to completion.
pub trait CommandSink {
    fn execute(&mut self, cmd: CtrlCommand) -> Result<(), CommandError>;
}

/// Exclusive right to have an exchange in flight on a device's control queue.
///
/// A device owns exactly one, inside its lifecycle lock; [`ControlQueue`] borrows it mutably,
/// so two exchanges on the same device cannot overlap.
#[derive(Debug)]
pub struct CommandLease {
    _priv: (),
}

impl CommandLease {
    pub(crate) fn new() -> Self {
        Self { _priv: () }
    }
}

pub struct ControlQueue<'a, T: Transport + ?Sized> {
    queue: QueueHandle<'a, T>,
    features: Features,
    poll_mode: PollMode,
    _lease: &'a mut CommandLease,
}

impl<'a, T: Transport + ?Sized> ControlQueue<'a, T> {
    pub fn new(
        transport: &'a T,
        lease: &'a mut CommandLease,
        features: Features,
        poll_mode: PollMode,
    ) -> Self {
        Self {
            queue: QueueHandle::new(transport, CTRL_QUEUE),
            features,
            poll_mode,
            _lease: lease,
        }
    }

    /// Run `cmd` with an optional payload.
    pub fn execute_with(
        &mut self,
        cmd: CtrlCommand,
        payload: Option<&[u8]>,
    ) -> Result<(), CommandError> {
        self.exchange(cmd, payload, 0).map(|_| ())
    }

    /// Run `cmd` and return the `response_len` bytes the host wrote before the ack.
    pub fn exchange(
        &mut self,
        cmd: CtrlCommand,
        payload: Option<&[u8]>,
        response_len: usize,
    ) -> Result<Vec<u8>, CommandError> {
        if !self.features.has_ctrl_vq() {
            return Err(CommandError::FeatureUnavailable);
        }
        if self.queue.is_broken() {
            return Err(CommandError::QueueBroken);
        }

        let mut outputs = vec![cmd.header().to_bytes().to_vec()];
        if let Some(p) = payload {
            outputs.push(p.to_vec());
        }
        let mut inputs = Vec::with_capacity(2);
        if response_len > 0 {
            inputs.push(vec![0u8; response_len]);
        }
        inputs.push(vec![ACK_SENTINEL]);

        let token = self.queue.submit(outputs, inputs)?;
        log::trace!("ctrl: submitted {:?} as {:?}", cmd, token);
        self.queue.notify()?;

        let mut done = self.wait_for(token)?;
        let ack = done
            .inputs
            .pop()
            .and_then(|slot| slot.first().copied())
            .unwrap_or(ACK_SENTINEL);
        match Ack::from(ack) {
            Ack::Ok => {
                log::trace!("ctrl: {:?} ok", cmd);
                Ok(done.inputs.pop().unwrap_or_default())
            }
            _ => Err(CommandError::CommandFailed { command: cmd, ack }),
        }
    }

    fn wait_for(&self, token: Token) -> Result<Completion, CommandError> {
        loop {
            if let Some(done) = self.queue.poll() {
                if done.token == token {
                    return Ok(done);
                }
                log::warn!("ctrl: dropping stray completion {:?}", done.token);
                continue;
            }
            if self.queue.is_broken() {
                log::error!("ctrl: queue broke while waiting for {:?}", token);
                return Err(CommandError::QueueBroken);
            }
            self.poll_mode.relax();
        }
    }
}

impl<T: Transport + ?Sized> CommandSink for ControlQueue<'_, T> {
    fn execute(&mut self, cmd: CtrlCommand) -> Result<(), CommandError> {
        self.execute_with(cmd, None)
    }
}
