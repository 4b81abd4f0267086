use std::sync::{Mutex, PoisonError};

use virtcan::error::RegisterError;
use virtcan::{CanFrame, DeviceInfo, LinkState, NetStack};

/// Network stack stand-in for the CLI: logs every callback and keeps received frames.
#[derive(Default)]
pub struct ConsoleNet {
    received: Mutex<Vec<CanFrame>>,
}

impl ConsoleNet {
    pub fn take_received(&self) -> Vec<CanFrame> {
        std::mem::take(&mut *self.received.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl NetStack for ConsoleNet {
    fn register(&self, info: &DeviceInfo) -> Result<(), RegisterError> {
        log::info!(
            "net: register can0 (clock {} Hz, fd={}, mtu {})",
            info.clock_freq,
            info.fd,
            info.mtu
        );
        Ok(())
    }

    fn unregister(&self) {
        log::info!("net: unregister can0");
    }

    fn detach(&self) {
        log::info!("net: detach can0");
    }

    fn attach(&self) {
        log::info!("net: attach can0");
    }

    fn frame_received(&self, frame: CanFrame) {
        log::trace!("net: rx {:?}", frame.id());
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);
    }

    fn echo(&self, frame: &CanFrame) {
        log::trace!("net: echo {:?}", frame.id());
    }

    fn link_state_changed(&self, state: LinkState) {
        log::info!("net: link {:?}", state);
    }
}
