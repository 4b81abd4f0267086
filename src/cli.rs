use anyhow::anyhow;
use clap::{Args, Parser, Subcommand};

use virtcan::{DeviceConfig, Features, PollMode};

#[derive(Parser, Debug, Clone)]
#[command(name = "virtcan", about = "virtio CAN driver core, run against a simulated host")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Probe, open, freeze, restore, close and remove a device
    Lifecycle(LifecycleOpts),
    /// Send frames through a host that echoes them back, verify what comes in
    Loopback(LoopbackOpts),
}

#[derive(Args, Debug, Clone)]
pub struct DeviceOpts {
    /// Host offers CAN FD
    #[arg(long, default_value_t = false)]
    pub fd: bool,
    /// Wait between control completion polls: "spin" or "yield"
    #[arg(long, default_value = "yield")]
    pub poll: String,
    /// Receive descriptors handled per poll cycle
    #[arg(long, default_value_t = 64)]
    pub budget: usize,
    /// Descriptors per virtqueue
    #[arg(long, default_value_t = 64)]
    pub queue_size: u16,
}

impl DeviceOpts {
    pub fn config(&self) -> anyhow::Result<DeviceConfig> {
        let poll_mode: PollMode = self.poll.parse().map_err(|e: String| anyhow!(e))?;
        if self.budget == 0 {
            return Err(anyhow!("budget must be at least 1"));
        }
        Ok(DeviceConfig {
            poll_mode,
            rx_budget: self.budget,
            ..DeviceConfig::default()
        })
    }

    /// Feature bits the simulated host offers.
    pub fn host_features(&self) -> Features {
        if self.fd {
            Features::all()
        } else {
            Features::CTRL_VQ
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LifecycleOpts {
    #[command(flatten)]
    pub dev: DeviceOpts,
    /// Host offers no control queue
    #[arg(long, default_value_t = false)]
    pub no_ctrl_vq: bool,
    /// Host rejects the first N enable commands
    #[arg(long, default_value_t = 0)]
    pub fail_enable: u32,
}

#[derive(Args, Debug, Clone)]
pub struct LoopbackOpts {
    #[command(flatten)]
    pub dev: DeviceOpts,
    /// Frames to send
    #[arg(long, default_value_t = 1000)]
    pub frames: u32,
    /// Payload size in bytes (up to 8, or a valid FD length with --fd)
    #[arg(long, default_value_t = 8)]
    pub len: usize,
    /// Log each BAD/LOST frame
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}
