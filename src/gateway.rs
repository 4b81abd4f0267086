//! Data plane between the network stack and the two frame queues.
//!
//! Transmit is fire-and-forget: one descriptor per frame, posted in call order, echoed to the
//! stack as soon as the host has it. Receive runs in bounded poll cycles; every drained buffer
//! is handed straight back to the device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::error::{FrameError, SendError};
use crate::netdev::NetStack;
use crate::proto::frame::{CAN_MTU, CANFD_MTU, CanFrame, DescLayout};
use crate::stats::Stats;
use crate::transport::{QueueHandle, RX_QUEUE, TX_QUEUE, Transport, TransportError};

/// Outcome of one receive poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxPoll {
    pub forwarded: usize,
    pub dropped: usize,
    /// Budget used up; more completions may be waiting.
    pub reschedule: bool,
}

#[derive(Debug)]
pub struct FrameGateway {
    layout: DescLayout,
    running: AtomicBool,
    /// Interface MTU is CANFD_MTU.
    fd_mtu: AtomicBool,
    rx_cycle: Mutex<()>,
}

impl FrameGateway {
    pub fn new(layout: DescLayout) -> Self {
        Self {
            layout,
            running: AtomicBool::new(false),
            fd_mtu: AtomicBool::new(layout == DescLayout::Fd),
            rx_cycle: Mutex::new(()),
        }
    }

    pub fn layout(&self) -> DescLayout {
        self.layout
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, on: bool) {
        self.running.store(on, Ordering::Release);
    }

    pub fn mtu(&self) -> usize {
        if self.fd_mtu.load(Ordering::Relaxed) {
            CANFD_MTU
        } else {
            CAN_MTU
        }
    }

    /// Caller validated `mtu` against the layout.
    pub fn set_mtu(&self, mtu: usize) {
        self.fd_mtu.store(mtu == CANFD_MTU, Ordering::Relaxed);
    }

    /// Post up to `count` empty receive buffers. Stops early when the ring is full.
    pub fn fill_rx<T: Transport + ?Sized>(
        &self,
        transport: &T,
        count: u16,
    ) -> Result<u16, TransportError> {
        let rx = QueueHandle::new(transport, RX_QUEUE);
        let mut posted = 0;
        while posted < count {
            match rx.submit(Vec::new(), vec![vec![0u8; self.layout.desc_len()]]) {
                Ok(_) => posted += 1,
                Err(TransportError::QueueFull(_)) => break,
                Err(e) => return Err(e),
            }
        }
        if posted > 0 {
            rx.notify()?;
        }
        log::debug!("rx: posted {} buffers of {} bytes", posted, self.layout.desc_len());
        Ok(posted)
    }

    /// Collect transmit descriptors the host is done with.
    pub fn reclaim_tx<T: Transport + ?Sized>(&self, transport: &T) -> usize {
        let tx = QueueHandle::new(transport, TX_QUEUE);
        let mut n = 0;
        while tx.poll().is_some() {
            n += 1;
        }
        n
    }

    pub fn send<T, N>(
        &self,
        transport: &T,
        net: &N,
        stats: &Stats,
        frame: &CanFrame,
    ) -> Result<(), SendError>
    where
        T: Transport + ?Sized,
        N: NetStack + ?Sized,
    {
        if !self.is_running() {
            return Err(SendError::NotRunning);
        }
        let result = self.submit_tx(transport, frame);
        match &result {
            Ok(()) => {
                stats.inc_tx(frame.data().len());
                net.echo(frame);
            }
            Err(SendError::QueueBroken) => log::error!("tx: queue broken"),
            // Back-pressure: the caller holds on to the frame and retries.
            Err(SendError::QueueFull) => log::debug!("tx: queue full"),
            Err(e) => {
                log::debug!("tx: dropped frame: {e}");
                stats.inc_tx_dropped();
            }
        }
        result
    }

    fn submit_tx<T: Transport + ?Sized>(
        &self,
        transport: &T,
        frame: &CanFrame,
    ) -> Result<(), SendError> {
        if frame.is_fd() && self.layout == DescLayout::Fd && self.mtu() != CANFD_MTU {
            return Err(FrameError::FdDisabled.into());
        }
        let desc = frame.encode(self.layout)?;

        let tx = QueueHandle::new(transport, TX_QUEUE);
        self.reclaim_tx(transport);
        tx.submit(vec![desc], Vec::new())?;
        tx.notify()?;
        Ok(())
    }

    /// Run one receive cycle of at most `budget` descriptors.
    ///
    /// Frames drained before a transport error are still delivered.
    pub fn poll_rx<T, N>(
        &self,
        transport: &T,
        net: &N,
        stats: &Stats,
        budget: usize,
    ) -> Result<RxPoll, TransportError>
    where
        T: Transport + ?Sized,
        N: NetStack + ?Sized,
    {
        let _cycle = self.rx_cycle.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = RxPoll::default();
        if !self.is_running() {
            return Ok(out);
        }

        let rx = QueueHandle::new(transport, RX_QUEUE);
        let mut drained = 0;
        while drained < budget {
            let Some(done) = rx.poll() else {
                break;
            };
            drained += 1;

            let mut buf = done.inputs.into_iter().next().unwrap_or_default();
            let written = (done.len as usize).min(buf.len());
            match CanFrame::decode(&buf[..written], self.layout) {
                Ok(frame) => {
                    stats.inc_rx(frame.data().len());
                    net.frame_received(frame);
                    out.forwarded += 1;
                }
                Err(e) => {
                    log::warn!("rx: dropping descriptor ({} bytes): {e}", written);
                    stats.inc_rx_dropped();
                    out.dropped += 1;
                }
            }

            buf.clear();
            buf.resize(self.layout.desc_len(), 0);
            rx.submit(Vec::new(), vec![buf])?;
        }
        if drained > 0 {
            rx.notify()?;
        }
        out.reschedule = budget > 0 && drained == budget;
        Ok(out)
    }
}
