//! Boundary to the descriptor-ring transport.
//!
//! The ring implementation itself belongs to the platform. The driver only needs to hand over
//! scatter-gather chains, ring the doorbell and collect completions, so that is all the
//! [`Transport`] trait asks for, plus the handful of device-level calls probe needs
//! (features, config space, ready/reset).

use thiserror::Error;

pub mod queue;
pub mod ring;

pub use queue::QueueHandle;

/// Index of a virtqueue on the device.
pub type QueueIndex = u16;

/// Receive queue, host → guest frames.
pub const RX_QUEUE: QueueIndex = 0;
/// Transmit queue, guest → host frames.
pub const TX_QUEUE: QueueIndex = 1;
/// Control queue, command/ack exchanges.
pub const CTRL_QUEUE: QueueIndex = 2;

/// Identifies one submitted chain until its completion is collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u16);

/// A chain handed back by the peer.
///
/// `len` is the number of bytes the peer wrote into the inbound buffers.
#[derive(Debug)]
pub struct Completion {
    pub token: Token,
    pub len: u32,
    pub outputs: Vec<Vec<u8>>,
    pub inputs: Vec<Vec<u8>>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("queue {0} is broken")]
    Broken(QueueIndex),
    #[error("queue {0} has no free descriptors")]
    QueueFull(QueueIndex),
    #[error("no such queue: {0}")]
    NoSuchQueue(QueueIndex),
    #[error("empty scatter-gather chain")]
    EmptyChain,
    #[error("device config space unavailable")]
    ConfigUnavailable,
}

/// The ring-buffer primitive, per device.
///
/// All calls take `&self`: queues are independent channels and the data path may use one
/// queue while a control exchange is waiting on another.
pub trait Transport: Send + Sync {
    /// Feature bits offered by the device.
    fn device_features(&self) -> Result<u64, TransportError>;

    /// Acknowledge the subset of features the driver will use.
    fn set_driver_features(&self, features: u64) -> Result<(), TransportError>;

    /// Read from device-specific config space.
    fn read_config(&self, offset: usize, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Number of descriptors in a queue.
    fn queue_size(&self, queue: QueueIndex) -> Result<u16, TransportError>;

    /// Tell the device the driver is set up.
    fn set_ready(&self);

    /// Reset the device; all queues are discarded.
    fn reset(&self);

    /// Post a chain: outbound buffers first, then inbound buffers for the peer to fill.
    fn submit(
        &self,
        queue: QueueIndex,
        outputs: Vec<Vec<u8>>,
        inputs: Vec<Vec<u8>>,
    ) -> Result<Token, TransportError>;

    /// Ring the doorbell. May trap to the host.
    fn notify(&self, queue: QueueIndex) -> Result<(), TransportError>;

    /// Collect one completed chain, if any.
    fn poll_completion(&self, queue: QueueIndex) -> Option<Completion>;

    /// Once true, stays true.
    fn is_broken(&self, queue: QueueIndex) -> bool;

    /// Take back every chain still posted and not yet used by the peer.
    fn detach_unused(&self, queue: QueueIndex) -> Vec<Completion>;
}
