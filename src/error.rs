use thiserror::Error;

use crate::chip::{ChipEvent, ChipState};
use crate::device::LifecycleState;
use crate::proto::command::CtrlCommand;
use crate::transport::TransportError;

/// Raw control bytes that do not name a known command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("control header must be 2 bytes, got {0}")]
    HeaderLength(usize),
    #[error("unknown control class: {0}")]
    UnknownClass(u8),
    #[error("unknown command {cmd} in class {class}")]
    UnknownCommand { class: u8, cmd: u8 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("CAN FD frame but FD was not negotiated")]
    FdUnavailable,
    #[error("CAN FD frame on an interface with classic MTU")]
    FdDisabled,
}

/// A receive descriptor the host filled with something that is not a valid frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("descriptor truncated: {got} bytes, need {need}")]
    Truncated { got: usize, need: usize },
    #[error("reserved control bits set: 0x{0:08X}")]
    ReservedBits(u32),
    #[error("invalid data length {len} (fd={fd})")]
    BadLength { len: usize, fd: bool },
    #[error("FD frame received but FD was not negotiated")]
    FdNotNegotiated,
    #[error("BRS/ESI set on a classic frame")]
    FdFlagsWithoutFd,
    #[error("remote request cannot be an FD frame")]
    RemoteFd,
    #[error("malformed error frame id 0x{0:08X}")]
    BadErrorFrame(u32),
    #[error("identifier out of range: 0x{0:08X}")]
    IdOutOfRange(u32),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("control queue not negotiated")]
    FeatureUnavailable,
    #[error("control queue broken")]
    QueueBroken,
    #[error("{command:?} failed on host (ack=0x{ack:02X})")]
    CommandFailed { command: CtrlCommand, ack: u8 },
    #[error("control queue: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for CommandError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Broken(_) => CommandError::QueueBroken,
            other => CommandError::Transport(other),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid chip transition: {event:?} from {from:?}")]
    InvalidTransition { from: ChipState, event: ChipEvent },
    #[error("chip {event:?} aborted: {source}")]
    Command {
        event: ChipEvent,
        source: CommandError,
    },
}

impl TransitionError {
    pub fn command_error(&self) -> Option<&CommandError> {
        match self {
            TransitionError::Command { source, .. } => Some(source),
            TransitionError::InvalidTransition { .. } => None,
        }
    }

    pub fn is_queue_broken(&self) -> bool {
        matches!(self.command_error(), Some(CommandError::QueueBroken))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("interface is not running")]
    NotRunning,
    #[error("device failed")]
    DeviceFailed,
    #[error("transmit queue broken")]
    QueueBroken,
    #[error("transmit queue full")]
    QueueFull,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("transmit queue: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for SendError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Broken(_) => SendError::QueueBroken,
            TransportError::QueueFull(_) => SendError::QueueFull,
            other => SendError::Transport(other),
        }
    }
}

/// Why the network stack would not take the interface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("interface name {0} already in use")]
    NameInUse(String),
    #[error("mtu {0} not supported")]
    UnsupportedMtu(usize),
    #[error("network stack is shutting down")]
    Unavailable,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device config space unavailable")]
    ConfigUnavailable,
    #[error("control queue not negotiated")]
    FeatureUnavailable,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("network stack refused the device: {0}")]
    Registration(#[from] RegisterError),
    #[error("not allowed while device is {0:?}")]
    WrongState(LifecycleState),
    #[error("device failed")]
    Failed,
    #[error("interface is up")]
    Busy,
    #[error("invalid mtu {0}")]
    InvalidMtu(usize),
}
