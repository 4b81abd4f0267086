//! In-process host peer.
//!
//! Plays the device side of a virtio CAN link over [`SplitRing`]s: answers control commands
//! (OK unless scripted otherwise), takes frames off the transmit queue, optionally loops them
//! back into the receive queue, and lets a test inject receive traffic or break a queue. It is
//! what the CLI drives and what the lifecycle and gateway tests run against.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::ProtoError;
use crate::features::Features;
use crate::proto::command::{CtrlCommand, CtrlHeader, VIRTIO_CAN_ERR, VIRTIO_CAN_OK};
use crate::proto::frame::{CanFrame, DescLayout};
use crate::transport::ring::SplitRing;
use crate::transport::{
    CTRL_QUEUE, Completion, QueueIndex, RX_QUEUE, TX_QUEUE, Token, Transport, TransportError,
};

/// How the host answers one control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAck {
    Write(u8),
    /// Complete the chain without touching the ack slot.
    Untouched,
    /// The control queue dies instead of answering.
    Break,
}

pub struct SimHostBuilder {
    features: u64,
    queue_size: u16,
    clock_freq: u32,
    config_ok: bool,
    ctrl_delay: u32,
    loopback: bool,
}

impl SimHostBuilder {
    pub fn features(mut self, features: Features) -> Self {
        self.features = features.bits();
        self
    }

    pub fn queue_size(mut self, num: u16) -> Self {
        self.queue_size = num;
        self
    }

    pub fn clock_freq(mut self, hz: u32) -> Self {
        self.clock_freq = hz;
        self
    }

    /// Config space reads fail.
    pub fn no_config(mut self) -> Self {
        self.config_ok = false;
        self
    }

    /// Answer control commands only after this many completion polls.
    pub fn ctrl_delay(mut self, polls: u32) -> Self {
        self.ctrl_delay = polls;
        self
    }

    /// Echo every transmitted frame into the receive queue.
    pub fn loopback(mut self, on: bool) -> Self {
        self.loopback = on;
        self
    }

    pub fn build(self) -> SimHost {
        let rings = [RX_QUEUE, TX_QUEUE, CTRL_QUEUE]
            .into_iter()
            .map(|q| SplitRing::new(q, self.queue_size))
            .collect();
        SimHost {
            state: Mutex::new(SimState {
                offered: self.features,
                driver_features: None,
                clock_freq: self.clock_freq,
                config_ok: self.config_ok,
                ready: false,
                resets: 0,
                rings,
                submissions: [0; 3],
                ctrl_delay: self.ctrl_delay,
                ctrl_pending: 0,
                acks: HashMap::new(),
                response: None,
                commands: Vec::new(),
                last_payload: None,
                loopback: self.loopback,
                transmitted: Vec::new(),
                tx_undeliverable: 0,
                tx_stalled: false,
            }),
        }
    }
}

struct SimState {
    offered: u64,
    driver_features: Option<u64>,
    clock_freq: u32,
    config_ok: bool,
    ready: bool,
    resets: u32,
    rings: Vec<SplitRing>,
    submissions: [usize; 3],
    ctrl_delay: u32,
    /// Polls left before pending control chains are answered.
    ctrl_pending: u32,
    acks: HashMap<CtrlCommand, VecDeque<HostAck>>,
    response: Option<Vec<u8>>,
    commands: Vec<CtrlCommand>,
    last_payload: Option<Vec<u8>>,
    loopback: bool,
    transmitted: Vec<CanFrame>,
    tx_undeliverable: usize,
    /// Leave transmit chains on the available ring.
    tx_stalled: bool,
}

impl SimState {
    fn ring(&mut self, queue: QueueIndex) -> Result<&mut SplitRing, TransportError> {
        self.rings
            .get_mut(queue as usize)
            .ok_or(TransportError::NoSuchQueue(queue))
    }

    fn layout(&self) -> DescLayout {
        let negotiated = Features::from_bits_truncate(self.driver_features.unwrap_or(0));
        DescLayout::for_features(negotiated)
    }

    fn process_ctrl(&mut self) {
        while let Some(head) = self.rings[CTRL_QUEUE as usize].pop_avail() {
            let ring = &mut self.rings[CTRL_QUEUE as usize];
            let outputs = ring.outputs(head).to_vec();
            let parsed = outputs
                .first()
                .map(|hdr| CtrlHeader::parse(hdr))
                .unwrap_or(Err(ProtoError::HeaderLength(0)));

            let answer = match parsed {
                Ok(cmd) => {
                    self.commands.push(cmd);
                    self.last_payload = outputs.get(1).cloned();
                    self.acks
                        .get_mut(&cmd)
                        .and_then(|q| q.pop_front())
                        .unwrap_or(HostAck::Write(VIRTIO_CAN_OK))
                }
                Err(e) => {
                    log::warn!("sim: bad control header: {e}");
                    HostAck::Write(VIRTIO_CAN_ERR)
                }
            };

            let ring = &mut self.rings[CTRL_QUEUE as usize];
            let mut written = 0u32;
            match answer {
                HostAck::Break => {
                    ring.set_broken();
                    return;
                }
                HostAck::Untouched => {}
                HostAck::Write(ack) => {
                    let inputs = ring.inputs_mut(head);
                    let n = inputs.len();
                    if n >= 2
                        && let Some(resp) = self.response.take()
                    {
                        let dst = &mut inputs[0];
                        let len = resp.len().min(dst.len());
                        dst[..len].copy_from_slice(&resp[..len]);
                        written += len as u32;
                    }
                    if let Some(slot) = inputs.last_mut().and_then(|b| b.first_mut()) {
                        *slot = ack;
                        written += 1;
                    }
                }
            }
            ring.put_used(head, written);
        }
    }

    fn process_tx(&mut self) {
        let layout = self.layout();
        while let Some(head) = self.rings[TX_QUEUE as usize].pop_avail() {
            let desc = self.rings[TX_QUEUE as usize]
                .outputs(head)
                .first()
                .cloned()
                .unwrap_or_default();
            match CanFrame::decode(&desc, layout) {
                Ok(frame) => {
                    self.transmitted.push(frame);
                    if self.loopback && !self.deliver(&desc) {
                        self.tx_undeliverable += 1;
                    }
                }
                Err(e) => log::warn!("sim: bad tx descriptor: {e}"),
            }
            self.rings[TX_QUEUE as usize].put_used(head, 0);
        }
    }

    /// Write raw descriptor bytes into the next posted receive buffer.
    fn deliver(&mut self, desc: &[u8]) -> bool {
        let ring = &mut self.rings[RX_QUEUE as usize];
        let Some(head) = ring.pop_avail() else {
            return false;
        };
        let mut written = 0;
        if let Some(buf) = ring.inputs_mut(head).first_mut() {
            let len = desc.len().min(buf.len());
            buf[..len].copy_from_slice(&desc[..len]);
            written = len as u32;
        }
        ring.put_used(head, written);
        true
    }
}

/// Simulated virtio CAN device.
pub struct SimHost {
    state: Mutex<SimState>,
}

impl SimHost {
    pub fn builder() -> SimHostBuilder {
        SimHostBuilder {
            features: Features::all().bits(),
            queue_size: 16,
            clock_freq: 80_000_000,
            config_ok: true,
            ctrl_delay: 0,
            loopback: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an answer for the next occurrence of `cmd`.
    pub fn script_ack(&self, cmd: CtrlCommand, ack: HostAck) {
        self.lock().acks.entry(cmd).or_default().push_back(ack);
    }

    /// Bytes to write into the response buffer of the next command that has one.
    pub fn script_response(&self, resp: Vec<u8>) {
        self.lock().response = Some(resp);
    }

    pub fn break_queue(&self, queue: QueueIndex) {
        if let Ok(ring) = self.lock().ring(queue) {
            ring.set_broken();
        }
    }

    pub fn set_loopback(&self, on: bool) {
        self.lock().loopback = on;
    }

    /// Stop consuming the transmit queue. Clearing the stall drains whatever piled up.
    pub fn stall_tx(&self, on: bool) {
        let mut st = self.lock();
        st.tx_stalled = on;
        if !on {
            st.process_tx();
        }
    }

    /// Every control command received, in order.
    pub fn commands(&self) -> Vec<CtrlCommand> {
        self.lock().commands.clone()
    }

    pub fn last_ctrl_payload(&self) -> Option<Vec<u8>> {
        self.lock().last_payload.clone()
    }

    /// Chains the driver posted on `queue` since creation.
    pub fn submissions(&self, queue: QueueIndex) -> usize {
        self.lock()
            .submissions
            .get(queue as usize)
            .copied()
            .unwrap_or(0)
    }

    pub fn transmitted(&self) -> Vec<CanFrame> {
        self.lock().transmitted.clone()
    }

    /// Loopback frames dropped because no receive buffer was posted.
    pub fn tx_undeliverable(&self) -> usize {
        self.lock().tx_undeliverable
    }

    /// Receive buffers handed to the device and not yet reaped by the driver.
    pub fn rx_outstanding(&self) -> usize {
        let st = self.lock();
        let ring = &st.rings[RX_QUEUE as usize];
        ring.size() as usize - ring.num_free()
    }

    pub fn inject_rx(&self, frame: &CanFrame) -> bool {
        let mut st = self.lock();
        let layout = st.layout();
        match frame.encode(layout) {
            Ok(desc) => st.deliver(&desc),
            Err(_) => false,
        }
    }

    pub fn inject_raw(&self, desc: &[u8]) -> bool {
        self.lock().deliver(desc)
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    pub fn resets(&self) -> u32 {
        self.lock().resets
    }

    pub fn driver_features(&self) -> Option<Features> {
        self.lock().driver_features.map(Features::from_bits_truncate)
    }
}

impl Transport for SimHost {
    fn device_features(&self) -> Result<u64, TransportError> {
        Ok(self.lock().offered)
    }

    fn set_driver_features(&self, features: u64) -> Result<(), TransportError> {
        let mut st = self.lock();
        if features & !st.offered != 0 {
            return Err(TransportError::ConfigUnavailable);
        }
        st.driver_features = Some(features);
        Ok(())
    }

    fn read_config(&self, offset: usize, buf: &mut [u8]) -> Result<(), TransportError> {
        let st = self.lock();
        if !st.config_ok {
            return Err(TransportError::ConfigUnavailable);
        }
        let space = st.clock_freq.to_le_bytes();
        let end = offset + buf.len();
        if end > space.len() {
            return Err(TransportError::ConfigUnavailable);
        }
        buf.copy_from_slice(&space[offset..end]);
        Ok(())
    }

    fn queue_size(&self, queue: QueueIndex) -> Result<u16, TransportError> {
        Ok(self.lock().ring(queue)?.size())
    }

    fn set_ready(&self) {
        self.lock().ready = true;
    }

    fn reset(&self) {
        let mut st = self.lock();
        st.ready = false;
        st.resets += 1;
        st.driver_features = None;
        for ring in st.rings.iter_mut() {
            ring.reset();
        }
    }

    fn submit(
        &self,
        queue: QueueIndex,
        outputs: Vec<Vec<u8>>,
        inputs: Vec<Vec<u8>>,
    ) -> Result<Token, TransportError> {
        let mut st = self.lock();
        let token = st.ring(queue)?.add(outputs, inputs)?;
        st.submissions[queue as usize] += 1;
        Ok(token)
    }

    fn notify(&self, queue: QueueIndex) -> Result<(), TransportError> {
        let mut st = self.lock();
        if st.ring(queue)?.is_broken() {
            return Err(TransportError::Broken(queue));
        }
        match queue {
            CTRL_QUEUE if st.ctrl_delay > 0 => st.ctrl_pending = st.ctrl_delay,
            CTRL_QUEUE => st.process_ctrl(),
            TX_QUEUE if !st.tx_stalled => st.process_tx(),
            _ => {}
        }
        Ok(())
    }

    fn poll_completion(&self, queue: QueueIndex) -> Option<Completion> {
        let mut st = self.lock();
        if queue == CTRL_QUEUE && st.ctrl_pending > 0 {
            st.ctrl_pending -= 1;
            if st.ctrl_pending == 0 {
                st.process_ctrl();
            }
        }
        st.ring(queue).ok()?.pop_used()
    }

    fn is_broken(&self, queue: QueueIndex) -> bool {
        let mut st = self.lock();
        st.ring(queue).map(|r| r.is_broken()).unwrap_or(true)
    }

    fn detach_unused(&self, queue: QueueIndex) -> Vec<Completion> {
        let mut st = self.lock();
        st.ring(queue)
            .map(|r| r.detach_unused())
            .unwrap_or_default()
    }
}
