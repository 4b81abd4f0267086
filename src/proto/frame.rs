//! CAN frames and their descriptor layout on the data queues.
//!
//! Descriptor, little-endian, no padding:
//!
//! ```text
//! 0..4   control     bits 0-6 data length, bit 8 FD, bit 9 BRS, bit 10 ESI
//! 4..8   identifier  can_id: bit 31 EFF, bit 30 RTR, bit 29 ERR, bits 0-28 id
//! 8..    payload     8 bytes, or 64 once FD is negotiated on both sides
//! ```

use bytes::{Buf, BufMut};
use embedded_can::{ExtendedId, Id, StandardId};

use crate::error::{DecodeError, FrameError};
use crate::features::Features;

pub const CAN_MAX_DLEN: usize = 8;
pub const CANFD_MAX_DLEN: usize = 64;

/// Interface MTU for classic frames.
pub const CAN_MTU: usize = 16;
/// Interface MTU for FD frames.
pub const CANFD_MTU: usize = 72;

pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
pub const CAN_RTR_FLAG: u32 = 0x4000_0000;
pub const CAN_ERR_FLAG: u32 = 0x2000_0000;
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

const CTRL_LEN_MASK: u32 = 0x7F;
const CTRL_FD: u32 = 1 << 8;
const CTRL_BRS: u32 = 1 << 9;
const CTRL_ESI: u32 = 1 << 10;
const CTRL_VALID_MASK: u32 = CTRL_LEN_MASK | CTRL_FD | CTRL_BRS | CTRL_ESI;

/// Control word plus identifier.
pub const DESC_HDR_LEN: usize = 8;

const CANFD_VALID_LENGTHS: [usize; 7] = [12, 16, 20, 24, 32, 48, 64];

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FdFlags: u8 {
        /// Bit rate switch for the data phase.
        const BRS = 0x01;
        /// Error state indicator of the transmitting node.
        const ESI = 0x02;
    }
}

/// Descriptor size in use on a device, fixed by feature negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescLayout {
    Classic,
    Fd,
}

impl DescLayout {
    pub fn for_features(features: Features) -> Self {
        if features.fd_enabled() {
            DescLayout::Fd
        } else {
            DescLayout::Classic
        }
    }

    pub fn payload_len(self) -> usize {
        match self {
            DescLayout::Classic => CAN_MAX_DLEN,
            DescLayout::Fd => CANFD_MAX_DLEN,
        }
    }

    pub fn desc_len(self) -> usize {
        DESC_HDR_LEN + self.payload_len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Remote,
    /// Controller error report; the identifier carries the error class bits.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: Id,
    kind: FrameKind,
    fd: Option<FdFlags>,
    len: u8,
    data: [u8; CANFD_MAX_DLEN],
}

impl CanFrame {
    fn with_data(id: Id, kind: FrameKind, fd: Option<FdFlags>, data: &[u8]) -> Self {
        let mut buf = [0u8; CANFD_MAX_DLEN];
        buf[..data.len()].copy_from_slice(data);
        Self {
            id,
            kind,
            fd,
            len: data.len() as u8,
            data: buf,
        }
    }

    /// Classic data frame, up to 8 bytes.
    pub fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > CAN_MAX_DLEN {
            return None;
        }
        Some(Self::with_data(id.into(), FrameKind::Data, None, data))
    }

    pub fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > CAN_MAX_DLEN {
            return None;
        }
        let mut frame = Self::with_data(id.into(), FrameKind::Remote, None, &[]);
        frame.len = dlc as u8;
        Some(frame)
    }

    /// FD data frame; the length must be one the FD DLC can express.
    pub fn new_fd(id: impl Into<Id>, data: &[u8], flags: FdFlags) -> Option<Self> {
        if !is_valid_fd_len(data.len()) {
            return None;
        }
        Some(Self::with_data(id.into(), FrameKind::Data, Some(flags), data))
    }

    /// Error report with the given 29-bit class mask.
    pub fn new_error(class: u32, data: &[u8]) -> Option<Self> {
        let id = ExtendedId::new(class)?;
        if data.len() > CAN_MAX_DLEN {
            return None;
        }
        Some(Self::with_data(Id::Extended(id), FrameKind::Error, None, data))
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn is_fd(&self) -> bool {
        self.fd.is_some()
    }

    pub fn fd_flags(&self) -> Option<FdFlags> {
        self.fd
    }

    /// Payload length, or the requested length for a remote frame.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn data(&self) -> &[u8] {
        match self.kind {
            FrameKind::Remote => &[],
            _ => &self.data[..self.len as usize],
        }
    }

    fn can_id(&self) -> u32 {
        let mut raw = match (self.kind, self.id) {
            (FrameKind::Error, Id::Extended(class)) => return CAN_ERR_FLAG | class.as_raw(),
            (FrameKind::Error, Id::Standard(class)) => return CAN_ERR_FLAG | class.as_raw() as u32,
            (_, Id::Standard(id)) => id.as_raw() as u32,
            (_, Id::Extended(id)) => CAN_EFF_FLAG | id.as_raw(),
        };
        if self.kind == FrameKind::Remote {
            raw |= CAN_RTR_FLAG;
        }
        raw
    }

    fn control(&self) -> u32 {
        let mut ctrl = self.len as u32 & CTRL_LEN_MASK;
        if let Some(flags) = self.fd {
            ctrl |= CTRL_FD;
            if flags.contains(FdFlags::BRS) {
                ctrl |= CTRL_BRS;
            }
            if flags.contains(FdFlags::ESI) {
                ctrl |= CTRL_ESI;
            }
        }
        ctrl
    }

    /// Encode into a full-size descriptor for `layout`.
    pub fn encode(&self, layout: DescLayout) -> Result<Vec<u8>, FrameError> {
        if self.is_fd() && layout != DescLayout::Fd {
            return Err(FrameError::FdUnavailable);
        }
        let mut buf = Vec::with_capacity(layout.desc_len());
        buf.put_u32_le(self.control());
        buf.put_u32_le(self.can_id());
        let data = self.data();
        buf.put_slice(data);
        buf.put_bytes(0, layout.payload_len() - data.len());
        Ok(buf)
    }

    /// Decode and validate a descriptor the host wrote. `desc` is the written part only.
    pub fn decode(desc: &[u8], layout: DescLayout) -> Result<Self, DecodeError> {
        if desc.len() < DESC_HDR_LEN {
            return Err(DecodeError::Truncated {
                got: desc.len(),
                need: DESC_HDR_LEN,
            });
        }
        let mut rd = desc;
        let ctrl = rd.get_u32_le();
        let can_id = rd.get_u32_le();

        if ctrl & !CTRL_VALID_MASK != 0 {
            return Err(DecodeError::ReservedBits(ctrl));
        }
        let len = (ctrl & CTRL_LEN_MASK) as usize;
        let fd = if ctrl & CTRL_FD != 0 {
            if layout != DescLayout::Fd {
                return Err(DecodeError::FdNotNegotiated);
            }
            let mut flags = FdFlags::empty();
            flags.set(FdFlags::BRS, ctrl & CTRL_BRS != 0);
            flags.set(FdFlags::ESI, ctrl & CTRL_ESI != 0);
            Some(flags)
        } else {
            if ctrl & (CTRL_BRS | CTRL_ESI) != 0 {
                return Err(DecodeError::FdFlagsWithoutFd);
            }
            None
        };

        let valid_len = match fd {
            Some(_) => is_valid_fd_len(len),
            None => len <= CAN_MAX_DLEN,
        };
        if !valid_len {
            return Err(DecodeError::BadLength { len, fd: fd.is_some() });
        }

        let kind = match (can_id & CAN_ERR_FLAG != 0, can_id & CAN_RTR_FLAG != 0) {
            (true, false) if fd.is_none() && can_id & CAN_EFF_FLAG == 0 => FrameKind::Error,
            (true, _) => return Err(DecodeError::BadErrorFrame(can_id)),
            (false, true) if fd.is_some() => return Err(DecodeError::RemoteFd),
            (false, true) => FrameKind::Remote,
            (false, false) => FrameKind::Data,
        };

        let raw = can_id & CAN_EFF_MASK;
        let id = if kind == FrameKind::Error || can_id & CAN_EFF_FLAG != 0 {
            ExtendedId::new(raw).map(Id::Extended)
        } else {
            StandardId::new(raw as u16)
                .filter(|_| raw <= CAN_SFF_MASK)
                .map(Id::Standard)
        }
        .ok_or(DecodeError::IdOutOfRange(can_id))?;

        if kind == FrameKind::Remote {
            return Self::new_remote(id, len).ok_or(DecodeError::BadLength { len, fd: false });
        }
        if rd.remaining() < len {
            return Err(DecodeError::Truncated {
                got: desc.len(),
                need: DESC_HDR_LEN + len,
            });
        }
        Ok(Self::with_data(id, kind, fd, &rd[..len]))
    }
}

impl embedded_can::Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        CanFrame::new(id, data)
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        CanFrame::new_remote(id, dlc)
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        self.kind == FrameKind::Remote
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        len_to_dlc(self.len as usize)
    }

    fn data(&self) -> &[u8] {
        CanFrame::data(self)
    }
}

pub fn is_valid_fd_len(len: usize) -> bool {
    len <= CAN_MAX_DLEN || CANFD_VALID_LENGTHS.contains(&len)
}

/// Payload length to DLC code (identity up to 8).
pub fn len_to_dlc(len: usize) -> usize {
    if len <= CAN_MAX_DLEN {
        return len;
    }
    CANFD_VALID_LENGTHS
        .iter()
        .position(|&l| len <= l)
        .map_or(15, |i| 9 + i)
}
