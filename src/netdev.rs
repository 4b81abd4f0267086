//! Hooks into the network stack that owns the CAN interface.

use crate::error::RegisterError;
use crate::proto::frame::CanFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

/// What the driver tells the network stack when it registers the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Controller clock in Hz, from device config space.
    pub clock_freq: u32,
    /// CAN FD frames can be exchanged.
    pub fd: bool,
    pub mtu: usize,
}

/// The interface side of the driver.
///
/// Called from the transmit path and the receive poll cycle, possibly at the same time, so all
/// methods take `&self`.
pub trait NetStack: Send + Sync {
    /// Make the interface visible. An error leaves the device unregistered.
    fn register(&self, info: &DeviceInfo) -> Result<(), RegisterError>;

    fn unregister(&self);

    /// Power management: hide the interface without tearing it down.
    fn detach(&self);

    fn attach(&self);

    fn frame_received(&self, frame: CanFrame);

    /// A transmitted frame is on its way; loop it back to local listeners.
    fn echo(&self, frame: &CanFrame);

    fn link_state_changed(&self, state: LinkState);
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum NetEvent {
        Register,
        Unregister,
        Detach,
        Attach,
        Link(LinkState),
    }

    #[derive(Default)]
    pub struct MockNet {
        pub refuse_register: bool,
        pub events: Mutex<Vec<NetEvent>>,
        pub received: Mutex<Vec<CanFrame>>,
        pub echoed: Mutex<Vec<CanFrame>>,
    }

    impl MockNet {
        pub fn events(&self) -> Vec<NetEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn received(&self) -> Vec<CanFrame> {
            self.received.lock().unwrap().clone()
        }

        pub fn echoed(&self) -> Vec<CanFrame> {
            self.echoed.lock().unwrap().clone()
        }
    }

    impl NetStack for MockNet {
        fn register(&self, _info: &DeviceInfo) -> Result<(), RegisterError> {
            if self.refuse_register {
                return Err(RegisterError::NameInUse("can0".into()));
            }
            self.events.lock().unwrap().push(NetEvent::Register);
            Ok(())
        }

        fn unregister(&self) {
            self.events.lock().unwrap().push(NetEvent::Unregister);
        }

        fn detach(&self) {
            self.events.lock().unwrap().push(NetEvent::Detach);
        }

        fn attach(&self) {
            self.events.lock().unwrap().push(NetEvent::Attach);
        }

        fn frame_received(&self, frame: CanFrame) {
            self.received.lock().unwrap().push(frame);
        }

        fn echo(&self, frame: &CanFrame) {
            self.echoed.lock().unwrap().push(*frame);
        }

        fn link_state_changed(&self, state: LinkState) {
            self.events.lock().unwrap().push(NetEvent::Link(state));
        }
    }
}
