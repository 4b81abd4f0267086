//! A bound virtio CAN device and everything the network stack can ask of it.
//!
//! Lifecycle calls (`open`, `close`, `freeze`, `restore`, `change_mtu`, `remove`) take the
//! device lock, which also owns the control-queue lease, so chip transitions never overlap.
//! `transmit` and `poll` stay outside the lock and are gated by the gateway's running flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::chip::{Chip, ChipState};
use crate::config::DeviceConfig;
use crate::control::{CommandLease, ControlQueue};
use crate::error::{CommandError, DeviceError, SendError, TransitionError};
use crate::features::Features;
use crate::gateway::{FrameGateway, RxPoll};
use crate::netdev::{DeviceInfo, LinkState, NetStack};
use crate::proto::frame::{CAN_MTU, CANFD_MTU, CanFrame, DescLayout};
use crate::resources::{Resource, ResourceStack};
use crate::stats::{Stats, StatsSnapshot};
use crate::transport::{RX_QUEUE, TX_QUEUE, Transport, TransportError};

/// Config space offset of the controller clock frequency (u32, little-endian).
const CONFIG_CLOCK_FREQ: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unbound,
    Registering,
    /// Registered, interface down.
    Closed,
    Open,
    /// Suspended for power management.
    Frozen,
    Removing,
    /// A queue broke. Only removal is left.
    Failed,
}

impl LifecycleState {
    fn is_live(self) -> bool {
        matches!(
            self,
            LifecycleState::Registering
                | LifecycleState::Closed
                | LifecycleState::Open
                | LifecycleState::Frozen
        )
    }
}

struct Inner {
    state: LifecycleState,
    chip: Chip,
    lease: CommandLease,
    /// Interface was up when frozen.
    was_open: bool,
    resources: ResourceStack,
}

pub struct VirtCanDevice<T: Transport + ?Sized, N: NetStack + ?Sized> {
    transport: Arc<T>,
    net: Arc<N>,
    config: DeviceConfig,
    features: Features,
    clock_freq: u32,
    inner: Mutex<Inner>,
    gateway: FrameGateway,
    failed: AtomicBool,
    stats: Stats,
}

impl<T: Transport + ?Sized, N: NetStack + ?Sized> VirtCanDevice<T, N> {
    /// Bind to a device: read config space, negotiate features, set up the queues, register
    /// the chip and then the interface. Anything acquired is released again on failure.
    pub fn probe(
        transport: Arc<T>,
        net: Arc<N>,
        config: DeviceConfig,
    ) -> Result<Self, DeviceError> {
        let mut raw = [0u8; 4];
        transport
            .read_config(CONFIG_CLOCK_FREQ, &mut raw)
            .map_err(|e| {
                log::error!("probe: config space: {e}");
                DeviceError::ConfigUnavailable
            })?;
        let clock_freq = u32::from_le_bytes(raw);

        let offered = transport.device_features()?;
        let features = Features::negotiate(offered, config.driver_features);
        transport.set_driver_features(features.bits())?;
        log::info!("probe: device offers 0x{offered:x}, using {features:?}");
        if !features.has_ctrl_vq() {
            log::warn!("probe: no control queue, interface cannot be opened");
        }

        let dev = Self {
            transport,
            net,
            features,
            clock_freq,
            inner: Mutex::new(Inner {
                state: LifecycleState::Registering,
                chip: Chip::new(),
                lease: CommandLease::new(),
                was_open: false,
                resources: ResourceStack::new(),
            }),
            gateway: FrameGateway::new(DescLayout::for_features(features)),
            failed: AtomicBool::new(false),
            stats: Stats::new(),
            config,
        };

        let res = {
            let mut inner = dev.lock();
            inner.resources.push(Resource::Queues);
            match dev.bring_up(&mut inner) {
                Ok(()) => {
                    inner.state = LifecycleState::Closed;
                    log::info!(
                        "probe: registered, clock {} Hz, {:?} frames",
                        dev.clock_freq,
                        dev.gateway.layout()
                    );
                    Ok(())
                }
                Err(e) => {
                    log::error!("probe failed: {e}");
                    dev.teardown(&mut inner);
                    Err(e)
                }
            }
        };
        res.map(|()| dev)
    }

    fn bring_up(&self, inner: &mut Inner) -> Result<(), DeviceError> {
        self.transport.set_ready();

        let rx_size = self.transport.queue_size(RX_QUEUE)?;
        let want = self.config.rx_buffers.unwrap_or(rx_size).min(rx_size);
        inner.resources.push(Resource::RxBuffers);
        self.gateway.fill_rx(&*self.transport, want)?;

        if self.features.has_ctrl_vq() {
            self.register_chip(inner)?;
        }

        if let Err(e) = self.net.register(&self.info()) {
            self.disable_chip(inner);
            return Err(e.into());
        }
        inner.resources.push(Resource::NetRegistration);
        Ok(())
    }

    fn register_chip(&self, inner: &mut Inner) -> Result<(), TransitionError> {
        let retries = self.config.registration_retries;
        let mut attempt = 0;
        loop {
            let Inner { chip, lease, .. } = &mut *inner;
            let res = chip.register(&mut self.control(lease));
            match res {
                Ok(()) => return Ok(()),
                Err(e) if attempt < retries && Self::retryable(&e) => {
                    attempt += 1;
                    log::warn!("probe: chip registration failed ({e}), retry {attempt}/{retries}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn retryable(err: &TransitionError) -> bool {
        matches!(
            err.command_error(),
            Some(CommandError::CommandFailed { .. })
        )
    }

    fn control<'a>(&'a self, lease: &'a mut CommandLease) -> ControlQueue<'a, T> {
        ControlQueue::new(&*self.transport, lease, self.features, self.config.poll_mode)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if self.failed.load(Ordering::Acquire) {
            Self::enter_failed(&mut inner);
        }
        inner
    }

    fn enter_failed(inner: &mut Inner) {
        if inner.state.is_live() {
            log::error!("lifecycle: {:?} -> Failed", inner.state);
            inner.chip.fail();
            inner.state = LifecycleState::Failed;
        }
    }

    /// A queue is gone. Stops the data path and tells the stack once, unless the interface
    /// never got registered.
    fn mark_failed(&self, registered: bool) {
        self.gateway.set_running(false);
        if !self.failed.swap(true, Ordering::AcqRel) {
            log::error!("device failed: transport queue broken");
            if registered {
                self.net.link_state_changed(LinkState::Down);
            }
        }
    }

    fn transition_failed(&self, inner: &mut Inner, err: TransitionError) -> DeviceError {
        if err.is_queue_broken() {
            self.mark_failed(inner.state != LifecycleState::Registering);
            Self::enter_failed(inner);
        }
        err.into()
    }

    fn expect_state(inner: &Inner, want: LifecycleState) -> Result<(), DeviceError> {
        match inner.state {
            s if s == want => Ok(()),
            LifecycleState::Failed => Err(DeviceError::Failed),
            s => Err(DeviceError::WrongState(s)),
        }
    }

    /// Best-effort disable ahead of teardown.
    fn disable_chip(&self, inner: &mut Inner) {
        if !self.features.has_ctrl_vq()
            || !matches!(inner.chip.state(), ChipState::Enabled | ChipState::Running)
        {
            return;
        }
        let registered = inner.state != LifecycleState::Registering;
        let Inner { chip, lease, .. } = inner;
        if let Err(e) = chip.remove(&mut self.control(lease)) {
            log::warn!("chip disable failed, tearing down anyway: {e}");
            if e.is_queue_broken() {
                self.mark_failed(registered);
            }
        }
    }

    fn release(&self, res: Resource) {
        match res {
            Resource::NetRegistration => self.net.unregister(),
            Resource::RxBuffers => {
                let n = self.transport.detach_unused(RX_QUEUE).len();
                log::debug!("teardown: detached {n} rx buffers");
            }
            Resource::Queues => {
                self.gateway.reclaim_tx(&*self.transport);
                let n = self.transport.detach_unused(TX_QUEUE).len();
                if n > 0 {
                    log::debug!("teardown: dropped {n} unsent frames");
                }
                self.transport.reset();
            }
        }
    }

    fn teardown(&self, inner: &mut Inner) {
        self.gateway.set_running(false);
        inner.resources.unwind(|res| self.release(res));
        inner.state = LifecycleState::Unbound;
    }

    /// Bring the interface up: chip to Running, start the data path.
    pub fn open(&self) -> Result<(), DeviceError> {
        let mut inner = self.lock();
        Self::expect_state(&inner, LifecycleState::Closed)?;
        if !self.features.has_ctrl_vq() {
            return Err(DeviceError::FeatureUnavailable);
        }

        let Inner { chip, lease, .. } = &mut *inner;
        let res = chip.open(&mut self.control(lease));
        if let Err(e) = res {
            return Err(self.transition_failed(&mut inner, e));
        }
        self.gateway.set_running(true);
        self.net.link_state_changed(LinkState::Up);
        inner.state = LifecycleState::Open;
        log::info!("lifecycle: Closed -> Open");
        Ok(())
    }

    pub fn close(&self) -> Result<(), DeviceError> {
        let mut inner = self.lock();
        Self::expect_state(&inner, LifecycleState::Open)?;

        self.gateway.set_running(false);
        let Inner { chip, lease, .. } = &mut *inner;
        let res = chip.close(&mut self.control(lease));
        if let Err(e) = res {
            if !e.is_queue_broken() {
                self.gateway.set_running(true);
            }
            return Err(self.transition_failed(&mut inner, e));
        }
        self.gateway.reclaim_tx(&*self.transport);
        self.net.link_state_changed(LinkState::Down);
        inner.state = LifecycleState::Closed;
        log::info!("lifecycle: Open -> Closed");
        Ok(())
    }

    /// Power management suspend: disable the chip and detach from the stack, keeping queues
    /// and registration.
    pub fn freeze(&self) -> Result<(), DeviceError> {
        let mut inner = self.lock();
        let was_open = match inner.state {
            LifecycleState::Open => true,
            LifecycleState::Closed => false,
            LifecycleState::Failed => return Err(DeviceError::Failed),
            s => return Err(DeviceError::WrongState(s)),
        };

        self.gateway.set_running(false);
        self.net.detach();
        if self.features.has_ctrl_vq() {
            let Inner { chip, lease, .. } = &mut *inner;
            let res = chip.suspend(&mut self.control(lease));
            if let Err(e) = res {
                if !e.is_queue_broken() {
                    self.net.attach();
                    self.gateway.set_running(was_open);
                }
                return Err(self.transition_failed(&mut inner, e));
            }
        }
        inner.was_open = was_open;
        inner.state = LifecycleState::Frozen;
        log::info!("lifecycle: frozen (was open: {was_open})");
        Ok(())
    }

    /// Undo [`freeze`](Self::freeze), returning to whatever open/closed state came before.
    pub fn restore(&self) -> Result<(), DeviceError> {
        let mut inner = self.lock();
        Self::expect_state(&inner, LifecycleState::Frozen)?;

        if self.features.has_ctrl_vq() {
            let Inner { chip, lease, .. } = &mut *inner;
            let res = chip.resume(&mut self.control(lease));
            if let Err(e) = res {
                return Err(self.transition_failed(&mut inner, e));
            }
        }
        self.net.attach();
        inner.state = if inner.was_open {
            self.gateway.set_running(true);
            LifecycleState::Open
        } else {
            LifecycleState::Closed
        };
        log::info!("lifecycle: Frozen -> {:?}", inner.state);
        Ok(())
    }

    /// Disable the chip if possible, then release everything in reverse order of acquisition.
    /// Never fails; calling it again is a no-op.
    pub fn remove(&self) {
        let mut inner = self.lock();
        let from = inner.state;
        if matches!(from, LifecycleState::Unbound | LifecycleState::Removing) {
            log::debug!("remove: already {:?}", from);
            return;
        }
        inner.state = LifecycleState::Removing;
        self.gateway.set_running(false);
        if from != LifecycleState::Failed {
            self.disable_chip(&mut inner);
        }
        self.teardown(&mut inner);
        self.stats.log_summary("virtcan");
        log::info!("lifecycle: {:?} -> Unbound", from);
    }

    pub fn transmit(&self, frame: &CanFrame) -> Result<(), SendError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(SendError::DeviceFailed);
        }
        let res = self
            .gateway
            .send(&*self.transport, &*self.net, &self.stats, frame);
        if matches!(res, Err(SendError::QueueBroken)) {
            self.mark_failed(true);
        }
        res
    }

    /// One receive cycle with the configured budget.
    pub fn poll(&self) -> Result<RxPoll, DeviceError> {
        self.poll_budget(self.config.rx_budget)
    }

    /// One receive cycle draining at most `budget` descriptors. A zero budget still drains
    /// one, so a backlog always makes progress.
    pub fn poll_budget(&self, budget: usize) -> Result<RxPoll, DeviceError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(DeviceError::Failed);
        }
        self.gateway
            .poll_rx(&*self.transport, &*self.net, &self.stats, budget.max(1))
            .map_err(|e| {
                if matches!(e, TransportError::Broken(_)) {
                    self.mark_failed(true);
                }
                DeviceError::Transport(e)
            })
    }

    pub fn change_mtu(&self, mtu: usize) -> Result<(), DeviceError> {
        let inner = self.lock();
        match inner.state {
            LifecycleState::Frozen if inner.was_open => return Err(DeviceError::Busy),
            LifecycleState::Closed | LifecycleState::Frozen => {}
            LifecycleState::Open => return Err(DeviceError::Busy),
            LifecycleState::Failed => return Err(DeviceError::Failed),
            s => return Err(DeviceError::WrongState(s)),
        }
        let fd_ok = self.gateway.layout() == DescLayout::Fd;
        if mtu != CAN_MTU && !(mtu == CANFD_MTU && fd_ok) {
            return Err(DeviceError::InvalidMtu(mtu));
        }
        self.gateway.set_mtu(mtu);
        log::info!("mtu set to {mtu}");
        Ok(())
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    pub fn chip_state(&self) -> ChipState {
        self.lock().chip.state()
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            clock_freq: self.clock_freq,
            fd: self.gateway.layout() == DescLayout::Fd,
            mtu: self.gateway.mtu(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl<T: Transport + ?Sized, N: NetStack + ?Sized> Drop for VirtCanDevice<T, N> {
    fn drop(&mut self) {
        if self.lock().state != LifecycleState::Unbound {
            self.remove();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollMode;
    use crate::error::RegisterError;
    use crate::netdev::mock::{MockNet, NetEvent};
    use crate::proto::command::{ChipOp, CtrlCommand};
    use crate::sim::{HostAck, SimHost, SimHostBuilder};
    use crate::transport::CTRL_QUEUE;
    use embedded_can::StandardId;

    const ENABLE: CtrlCommand = CtrlCommand::Chip(ChipOp::Enable);
    const DISABLE: CtrlCommand = CtrlCommand::Chip(ChipOp::Disable);

    type Device = VirtCanDevice<SimHost, MockNet>;

    fn config() -> DeviceConfig {
        DeviceConfig {
            poll_mode: PollMode::Spin,
            ..DeviceConfig::default()
        }
    }

    fn try_probe(
        host: SimHost,
        net: MockNet,
    ) -> (Arc<SimHost>, Arc<MockNet>, Result<Device, DeviceError>) {
        let host = Arc::new(host);
        let net = Arc::new(net);
        let dev = VirtCanDevice::probe(host.clone(), net.clone(), config());
        (host, net, dev)
    }

    fn probe(builder: SimHostBuilder) -> (Arc<SimHost>, Arc<MockNet>, Device) {
        let (host, net, dev) = try_probe(builder.build(), MockNet::default());
        (host, net, dev.unwrap())
    }

    fn frame(id: u16, data: &[u8]) -> CanFrame {
        CanFrame::new(StandardId::new(id).unwrap(), data).unwrap()
    }

    #[test]
    fn probe_registers_chip_then_interface() {
        let (host, net, dev) = probe(SimHost::builder().clock_freq(40_000_000));
        assert_eq!(dev.state(), LifecycleState::Closed);
        assert_eq!(dev.chip_state(), ChipState::Enabled);
        assert_eq!(host.commands(), vec![DISABLE, ENABLE]);
        assert_eq!(net.events(), vec![NetEvent::Register]);
        assert_eq!(dev.info().clock_freq, 40_000_000);
        assert!(dev.info().fd);
        assert!(host.is_ready());
        assert_eq!(host.driver_features(), Some(Features::all()));
        assert_eq!(host.rx_outstanding(), 16);
    }

    #[test]
    fn probe_needs_config_space() {
        let (host, net, dev) = try_probe(SimHost::builder().no_config().build(), MockNet::default());
        assert!(matches!(dev, Err(DeviceError::ConfigUnavailable)));
        assert_eq!(host.submissions(CTRL_QUEUE), 0);
        assert_eq!(host.driver_features(), None);
        assert!(net.events().is_empty());
    }

    #[test]
    fn probe_posts_configured_rx_buffers() {
        let host = Arc::new(SimHost::builder().build());
        let net = Arc::new(MockNet::default());
        let cfg = DeviceConfig {
            rx_buffers: Some(4),
            ..config()
        };
        let _dev = VirtCanDevice::probe(host.clone(), net, cfg).unwrap();
        assert_eq!(host.rx_outstanding(), 4);
    }

    #[test]
    fn registration_retries_rejected_enable_once() {
        let host = SimHost::builder().build();
        host.script_ack(ENABLE, HostAck::Write(1));
        let (host, _net, dev) = try_probe(host, MockNet::default());
        assert!(dev.is_ok());
        assert_eq!(
            host.commands(),
            vec![DISABLE, ENABLE, DISABLE, DISABLE, ENABLE]
        );
    }

    #[test]
    fn registration_gives_up_and_unwinds() {
        let host = SimHost::builder().build();
        host.script_ack(ENABLE, HostAck::Write(1));
        host.script_ack(ENABLE, HostAck::Write(1));
        let (host, net, dev) = try_probe(host, MockNet::default());
        let err = dev.err().unwrap();
        assert!(matches!(
            err,
            DeviceError::Transition(TransitionError::Command {
                source: CommandError::CommandFailed { .. },
                ..
            })
        ));
        assert_eq!(
            host.commands(),
            vec![DISABLE, ENABLE, DISABLE, DISABLE, ENABLE, DISABLE]
        );
        assert!(net.events().is_empty());
        assert_eq!(host.resets(), 1);
        assert!(!host.is_ready());
    }

    #[test]
    fn registration_does_not_retry_broken_queue() {
        let host = SimHost::builder().build();
        host.script_ack(ENABLE, HostAck::Break);
        let (host, _net, dev) = try_probe(host, MockNet::default());
        match dev {
            Err(DeviceError::Transition(e)) => assert!(e.is_queue_broken()),
            other => panic!("unexpected probe result: {:?}", other.err()),
        }
        assert_eq!(host.commands(), vec![DISABLE, ENABLE]);
        assert_eq!(host.resets(), 1);
    }

    #[test]
    fn refused_interface_disables_chip() {
        let net = MockNet {
            refuse_register: true,
            ..MockNet::default()
        };
        let (host, _net, dev) = try_probe(SimHost::builder().build(), net);
        assert!(matches!(
            dev,
            Err(DeviceError::Registration(RegisterError::NameInUse(_)))
        ));
        assert_eq!(host.commands(), vec![DISABLE, ENABLE, DISABLE]);
        assert_eq!(host.resets(), 1);
    }

    #[test]
    fn unregistered_interface_gets_no_link_notice() {
        let host = SimHost::builder().build();
        host.script_ack(DISABLE, HostAck::Write(0));
        host.script_ack(DISABLE, HostAck::Break);
        let net = MockNet {
            refuse_register: true,
            ..MockNet::default()
        };
        let (host, net, dev) = try_probe(host, net);
        assert!(matches!(dev, Err(DeviceError::Registration(_))));
        assert_eq!(host.commands(), vec![DISABLE, ENABLE, DISABLE]);
        assert!(net.events().is_empty());
        assert_eq!(host.resets(), 1);
    }

    #[test]
    fn open_and_close_drive_the_chip() {
        let (host, net, dev) = probe(SimHost::builder());
        dev.open().unwrap();
        assert_eq!(dev.state(), LifecycleState::Open);
        assert_eq!(dev.chip_state(), ChipState::Running);
        assert!(matches!(
            dev.open(),
            Err(DeviceError::WrongState(LifecycleState::Open))
        ));

        dev.close().unwrap();
        assert_eq!(dev.state(), LifecycleState::Closed);
        assert_eq!(dev.chip_state(), ChipState::Enabled);
        assert_eq!(host.commands(), vec![DISABLE, ENABLE, ENABLE, DISABLE]);
        assert_eq!(
            net.events(),
            vec![
                NetEvent::Register,
                NetEvent::Link(LinkState::Up),
                NetEvent::Link(LinkState::Down)
            ]
        );
        assert_eq!(dev.transmit(&frame(1, &[])), Err(SendError::NotRunning));
    }

    #[test]
    fn rejected_open_keeps_device_closed() {
        let (host, _net, dev) = probe(SimHost::builder());
        host.script_ack(ENABLE, HostAck::Write(1));
        assert!(matches!(dev.open(), Err(DeviceError::Transition(_))));
        assert_eq!(dev.state(), LifecycleState::Closed);
        assert_eq!(dev.chip_state(), ChipState::Enabled);
        dev.open().unwrap();
    }

    #[test]
    fn open_without_control_queue_submits_nothing() {
        let builder = SimHost::builder().features(Features::GUEST_CANFD | Features::HOST_CANFD);
        let (host, net, dev) = probe(builder);
        assert_eq!(dev.state(), LifecycleState::Closed);
        assert!(matches!(dev.open(), Err(DeviceError::FeatureUnavailable)));
        assert_eq!(host.submissions(CTRL_QUEUE), 0);
        assert_eq!(dev.chip_state(), ChipState::Disabled);
        assert_eq!(net.events(), vec![NetEvent::Register]);
    }

    #[test]
    fn freeze_restore_returns_to_running() {
        let (host, net, dev) = probe(SimHost::builder());
        dev.open().unwrap();
        dev.freeze().unwrap();
        assert_eq!(dev.state(), LifecycleState::Frozen);
        assert_eq!(dev.chip_state(), ChipState::Sleeping);
        assert_eq!(dev.transmit(&frame(1, &[])), Err(SendError::NotRunning));

        dev.restore().unwrap();
        assert_eq!(dev.state(), LifecycleState::Open);
        assert_eq!(dev.chip_state(), ChipState::Running);
        assert_eq!(
            host.commands(),
            vec![DISABLE, ENABLE, ENABLE, DISABLE, ENABLE]
        );
        assert!(net.events().ends_with(&[NetEvent::Detach, NetEvent::Attach]));
        dev.transmit(&frame(1, &[])).unwrap();
    }

    #[test]
    fn freeze_restore_returns_to_enabled() {
        let (host, _net, dev) = probe(SimHost::builder());
        dev.freeze().unwrap();
        dev.restore().unwrap();
        assert_eq!(dev.state(), LifecycleState::Closed);
        assert_eq!(dev.chip_state(), ChipState::Enabled);
        assert_eq!(host.commands(), vec![DISABLE, ENABLE, DISABLE, ENABLE]);
    }

    #[test]
    fn broken_control_queue_fails_device() {
        let (host, net, dev) = probe(SimHost::builder());
        host.script_ack(ENABLE, HostAck::Break);
        let err = dev.open().unwrap_err();
        assert!(matches!(&err, DeviceError::Transition(e) if e.is_queue_broken()));
        assert_eq!(dev.state(), LifecycleState::Failed);
        assert_eq!(dev.chip_state(), ChipState::ErrorActive);
        assert_eq!(net.events().last(), Some(&NetEvent::Link(LinkState::Down)));

        assert_eq!(dev.transmit(&frame(1, &[])), Err(SendError::DeviceFailed));
        assert!(matches!(dev.open(), Err(DeviceError::Failed)));
        assert!(matches!(dev.freeze(), Err(DeviceError::Failed)));

        let sent = host.submissions(CTRL_QUEUE);
        dev.remove();
        assert_eq!(host.submissions(CTRL_QUEUE), sent);
        assert_eq!(net.events().last(), Some(&NetEvent::Unregister));
        assert_eq!(host.resets(), 1);
        assert_eq!(dev.state(), LifecycleState::Unbound);
    }

    #[test]
    fn broken_tx_queue_fails_device_once() {
        let (host, net, dev) = probe(SimHost::builder());
        dev.open().unwrap();
        host.break_queue(TX_QUEUE);
        assert_eq!(dev.transmit(&frame(1, &[])), Err(SendError::QueueBroken));
        assert_eq!(dev.transmit(&frame(2, &[])), Err(SendError::DeviceFailed));
        assert_eq!(dev.state(), LifecycleState::Failed);
        assert_eq!(dev.chip_state(), ChipState::ErrorActive);
        let downs = net
            .events()
            .iter()
            .filter(|e| **e == NetEvent::Link(LinkState::Down))
            .count();
        assert_eq!(downs, 1);
        assert!(matches!(dev.poll(), Err(DeviceError::Failed)));
    }

    #[test]
    fn remove_disables_then_tears_down() {
        let (host, net, dev) = probe(SimHost::builder());
        dev.open().unwrap();
        dev.remove();
        assert_eq!(host.commands().last(), Some(&DISABLE));
        assert_eq!(net.events().last(), Some(&NetEvent::Unregister));
        assert_eq!(host.resets(), 1);
        assert_eq!(host.rx_outstanding(), 0);
        assert_eq!(dev.state(), LifecycleState::Unbound);

        dev.remove();
        drop(dev);
        assert_eq!(host.resets(), 1);
    }

    #[test]
    fn remove_survives_failing_disable() {
        let (host, net, dev) = probe(SimHost::builder());
        host.script_ack(DISABLE, HostAck::Write(1));
        dev.remove();
        assert_eq!(dev.state(), LifecycleState::Unbound);
        assert_eq!(net.events().last(), Some(&NetEvent::Unregister));
        assert_eq!(host.resets(), 1);
    }

    #[test]
    fn dropping_bound_device_removes_it() {
        let (host, net, dev) = probe(SimHost::builder());
        drop(dev);
        assert_eq!(host.commands().last(), Some(&DISABLE));
        assert_eq!(net.events().last(), Some(&NetEvent::Unregister));
        assert_eq!(host.resets(), 1);
    }

    #[test]
    fn frames_loop_back_through_host() {
        let (_host, net, dev) = probe(SimHost::builder().loopback(true));
        dev.open().unwrap();
        let frames: Vec<CanFrame> = (0..5u16).map(|i| frame(0x100 + i, &[i as u8; 4])).collect();
        for f in &frames {
            dev.transmit(f).unwrap();
        }
        let cycle = dev.poll().unwrap();
        assert_eq!(cycle.forwarded, 5);
        assert!(!cycle.reschedule);
        assert_eq!(net.received(), frames);
        assert_eq!(net.echoed(), frames);

        let stats = dev.stats();
        assert_eq!((stats.tx_frames, stats.rx_frames), (5, 5));
        assert_eq!((stats.tx_bytes, stats.rx_bytes), (20, 20));
    }

    #[test]
    fn mtu_changes_only_while_down() {
        let (_host, _net, dev) = probe(SimHost::builder());
        assert_eq!(dev.info().mtu, CANFD_MTU);
        dev.open().unwrap();
        assert!(matches!(dev.change_mtu(CAN_MTU), Err(DeviceError::Busy)));
        dev.close().unwrap();

        dev.change_mtu(CAN_MTU).unwrap();
        assert_eq!(dev.info().mtu, CAN_MTU);
        assert!(matches!(dev.change_mtu(100), Err(DeviceError::InvalidMtu(100))));
        dev.change_mtu(CANFD_MTU).unwrap();

        let (_host, _net, classic) = probe(SimHost::builder().features(Features::CTRL_VQ));
        assert_eq!(classic.info().mtu, CAN_MTU);
        assert!(matches!(
            classic.change_mtu(CANFD_MTU),
            Err(DeviceError::InvalidMtu(CANFD_MTU))
        ));
    }

    #[test]
    fn mtu_is_busy_while_frozen_open() {
        let (_host, _net, dev) = probe(SimHost::builder());
        dev.open().unwrap();
        dev.freeze().unwrap();
        assert!(matches!(dev.change_mtu(CAN_MTU), Err(DeviceError::Busy)));
        dev.restore().unwrap();
        assert_eq!(dev.state(), LifecycleState::Open);
        assert_eq!(dev.info().mtu, CANFD_MTU);

        dev.close().unwrap();
        dev.freeze().unwrap();
        dev.change_mtu(CAN_MTU).unwrap();
        dev.restore().unwrap();
        assert_eq!(dev.info().mtu, CAN_MTU);
    }

    #[test]
    fn zero_budget_still_drains() {
        let host = Arc::new(SimHost::builder().loopback(true).build());
        let net = Arc::new(MockNet::default());
        let cfg = DeviceConfig {
            rx_budget: 0,
            ..config()
        };
        let dev = VirtCanDevice::probe(host, net.clone(), cfg).unwrap();
        dev.open().unwrap();
        dev.transmit(&frame(1, &[1])).unwrap();
        dev.transmit(&frame(2, &[2])).unwrap();

        let first = dev.poll().unwrap();
        assert_eq!((first.forwarded, first.reschedule), (1, true));
        assert_eq!(dev.poll().unwrap().forwarded, 1);
        assert_eq!(net.received(), vec![frame(1, &[1]), frame(2, &[2])]);
    }

    #[test]
    fn lifecycle_calls_serialize_alongside_transmit() {
        let host = Arc::new(SimHost::builder().ctrl_delay(3).build());
        let net = Arc::new(MockNet::default());
        let cfg = DeviceConfig {
            poll_mode: PollMode::Yield,
            ..DeviceConfig::default()
        };
        let dev = VirtCanDevice::probe(host.clone(), net.clone(), cfg).unwrap();

        let (opens, closes) = std::thread::scope(|s| {
            let opener = s.spawn(|| {
                (0..20)
                    .filter(|_| match dev.open() {
                        Ok(()) => true,
                        Err(DeviceError::WrongState(_)) => false,
                        Err(e) => panic!("open: {e}"),
                    })
                    .count()
            });
            let closer = s.spawn(|| {
                (0..20)
                    .filter(|_| match dev.close() {
                        Ok(()) => true,
                        Err(DeviceError::WrongState(_)) => false,
                        Err(e) => panic!("close: {e}"),
                    })
                    .count()
            });
            s.spawn(|| {
                for i in 0..200u16 {
                    match dev.transmit(&frame(i, &[i as u8])) {
                        Ok(()) | Err(SendError::NotRunning) => {}
                        Err(e) => panic!("transmit: {e}"),
                    }
                }
            });
            (opener.join().unwrap(), closer.join().unwrap())
        });
        assert!(opens > 0);

        // Every transition completes before the next one starts.
        let cmds = host.commands();
        assert_eq!(cmds[..2], [DISABLE, ENABLE]);
        for (i, cmd) in cmds[2..].iter().enumerate() {
            let want = if i % 2 == 0 { ENABLE } else { DISABLE };
            assert_eq!(*cmd, want, "command {} of {:?}", i + 2, cmds);
        }
        assert_eq!(cmds.len() - 2, opens + closes);

        let links: Vec<NetEvent> = net.events()[1..].to_vec();
        for (i, ev) in links.iter().enumerate() {
            let want = if i % 2 == 0 { LinkState::Up } else { LinkState::Down };
            assert_eq!(*ev, NetEvent::Link(want));
        }

        let want = if opens == closes {
            LifecycleState::Closed
        } else {
            LifecycleState::Open
        };
        assert_eq!(dev.state(), want);
        assert_eq!(dev.stats().tx_frames, host.transmitted().len() as u64);
    }
}
