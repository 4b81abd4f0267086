//! Driver core for paravirtualized (virtio) CAN controllers.
//!
//! The host owns the bus. This crate speaks to it over three queues: a control queue carrying
//! synchronous chip commands, and a transmit and a receive queue carrying frame descriptors.
//! [`device::VirtCanDevice`] ties them together behind the operations a network stack needs.

pub mod chip;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod features;
pub mod gateway;
pub mod netdev;
pub mod proto;
pub mod resources;
pub mod sim;
pub mod stats;
pub mod transport;

pub use config::{DeviceConfig, PollMode};
pub use device::{LifecycleState, VirtCanDevice};
pub use features::Features;
pub use netdev::{DeviceInfo, LinkState, NetStack};
pub use proto::frame::CanFrame;

/// Virtio device id assigned to CAN controllers.
pub const VIRTIO_ID_CAN: u32 = 36;
