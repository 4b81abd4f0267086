use crate::error::ProtoError;

/// Ack byte: command executed.
pub const VIRTIO_CAN_OK: u8 = 0;
/// Ack byte: command rejected.
pub const VIRTIO_CAN_ERR: u8 = 1;
/// Written into the ack slot before submission. The peer never sends it.
pub const ACK_SENTINEL: u8 = 0xFF;

/// Size of the control header on the wire.
pub const CTRL_HDR_LEN: usize = 2;

/// Control command classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CtrlClass {
    /// CAN controller management on the host.
    Chip = 0,
}

/// Operations of the chip class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChipOp {
    Enable = 0,
    Disable = 1,
    Freeze = 2,
    Unfreeze = 3,
    SoftReset = 4,
}

impl ChipOp {
    pub const ALL: [ChipOp; 5] = [
        ChipOp::Enable,
        ChipOp::Disable,
        ChipOp::Freeze,
        ChipOp::Unfreeze,
        ChipOp::SoftReset,
    ];

    fn from_u8(cmd: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|op| *op as u8 == cmd)
    }
}

/// Every command the control channel can carry.
///
/// Only valid (class, command) pairs are representable; raw bytes go through
/// [`CtrlCommand::from_raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CtrlCommand {
    Chip(ChipOp),
}

impl CtrlCommand {
    pub fn class(self) -> CtrlClass {
        match self {
            CtrlCommand::Chip(_) => CtrlClass::Chip,
        }
    }

    pub fn command(self) -> u8 {
        match self {
            CtrlCommand::Chip(op) => op as u8,
        }
    }

    pub fn from_raw(class: u8, cmd: u8) -> Result<Self, ProtoError> {
        match class {
            c if c == CtrlClass::Chip as u8 => ChipOp::from_u8(cmd)
                .map(CtrlCommand::Chip)
                .ok_or(ProtoError::UnknownCommand { class, cmd }),
            _ => Err(ProtoError::UnknownClass(class)),
        }
    }

    pub fn header(self) -> CtrlHeader {
        CtrlHeader {
            class: self.class() as u8,
            cmd: self.command(),
        }
    }
}

/// Control header as sent: `[class, cmd]`, no padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtrlHeader {
    class: u8,
    cmd: u8,
}

impl CtrlHeader {
    pub fn to_bytes(self) -> [u8; CTRL_HDR_LEN] {
        [self.class, self.cmd]
    }

    pub fn parse(bytes: &[u8]) -> Result<CtrlCommand, ProtoError> {
        match bytes {
            [class, cmd] => CtrlCommand::from_raw(*class, *cmd),
            _ => Err(ProtoError::HeaderLength(bytes.len())),
        }
    }
}

/// Decoded acknowledgement byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ok,
    Err,
    /// Anything else, including an untouched sentinel.
    Invalid(u8),
}

impl From<u8> for Ack {
    fn from(b: u8) -> Self {
        match b {
            VIRTIO_CAN_OK => Ack::Ok,
            VIRTIO_CAN_ERR => Ack::Err,
            other => Ack::Invalid(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let hdr = CtrlCommand::Chip(ChipOp::Disable).header();
        assert_eq!(hdr.to_bytes(), [0, 1]);
        assert_eq!(
            CtrlCommand::Chip(ChipOp::SoftReset).header().to_bytes(),
            [0, 4]
        );
    }

    #[test]
    fn parse_known_commands() {
        for op in ChipOp::ALL {
            let bytes = CtrlCommand::Chip(op).header().to_bytes();
            assert_eq!(CtrlHeader::parse(&bytes).unwrap(), CtrlCommand::Chip(op));
        }
    }

    #[test]
    fn unknown_pairs_rejected() {
        assert!(matches!(
            CtrlCommand::from_raw(0, 5),
            Err(ProtoError::UnknownCommand { class: 0, cmd: 5 })
        ));
        assert!(matches!(
            CtrlCommand::from_raw(1, 0),
            Err(ProtoError::UnknownClass(1))
        ));
        assert!(matches!(
            CtrlHeader::parse(&[0]),
            Err(ProtoError::HeaderLength(1))
        ));
    }

    #[test]
    fn ack_values() {
        assert_eq!(Ack::from(0x00), Ack::Ok);
        assert_eq!(Ack::from(0x01), Ack::Err);
        assert_eq!(Ack::from(ACK_SENTINEL), Ack::Invalid(0xFF));
    }
}
