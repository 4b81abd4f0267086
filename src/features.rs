bitflags::bitflags! {
    /// Feature bits of the virtio CAN device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct Features: u64 {
        /// Control channel available.
        const CTRL_VQ = 1 << 0;
        /// Guest can handle CAN FD frames.
        const GUEST_CANFD = 1 << 10;
        /// Host can handle CAN FD frames.
        const HOST_CANFD = 1 << 20;
    }
}

impl Features {
    /// Everything this driver knows how to use.
    pub const fn supported() -> Self {
        Self::all()
    }

    /// Intersect what the device offers with what the driver wants. Unknown device bits are
    /// dropped.
    pub fn negotiate(offered: u64, wanted: Features) -> Features {
        Features::from_bits_truncate(offered) & wanted
    }

    pub fn has_ctrl_vq(self) -> bool {
        self.contains(Features::CTRL_VQ)
    }

    /// FD framing needs both ends.
    pub fn fd_enabled(self) -> bool {
        self.contains(Features::GUEST_CANFD | Features::HOST_CANFD)
    }
}

impl Default for Features {
    fn default() -> Self {
        Self::supported()
    }
}
