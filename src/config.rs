use std::str::FromStr;

use crate::features::Features;

/// What the command engine does between completion polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollMode {
    /// Pure busy-wait; right when the doorbell traps straight into the host.
    Spin,
    /// Give the processor away between polls.
    #[default]
    Yield,
}

impl PollMode {
    pub fn relax(self) {
        match self {
            PollMode::Spin => std::hint::spin_loop(),
            PollMode::Yield => std::thread::yield_now(),
        }
    }
}

impl FromStr for PollMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("spin") {
            Ok(PollMode::Spin)
        } else if s.eq_ignore_ascii_case("yield") {
            Ok(PollMode::Yield)
        } else {
            Err(format!("poll mode must be 'spin' or 'yield', got '{s}'"))
        }
    }
}

/// Per-device driver settings.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub poll_mode: PollMode,
    /// Receive descriptors handled per poll cycle. Zero is treated as one.
    pub rx_budget: usize,
    /// Receive buffers to post; `None` fills the whole queue.
    pub rx_buffers: Option<u16>,
    /// Extra registration attempts after a rejected command.
    pub registration_retries: u32,
    /// Features the driver asks for; the device may offer fewer.
    pub driver_features: Features,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            poll_mode: PollMode::default(),
            rx_budget: 64,
            rx_buffers: None,
            registration_retries: 1,
            driver_features: Features::supported(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_mode_from_str() {
        assert_eq!("spin".parse::<PollMode>(), Ok(PollMode::Spin));
        assert_eq!("YIELD".parse::<PollMode>(), Ok(PollMode::Yield));
        assert!("sleep".parse::<PollMode>().is_err());
    }
}
