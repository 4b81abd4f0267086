//! In-memory split virtqueue.
//!
//! Models the descriptor table, the available ring and the used ring of one queue with owned
//! buffers instead of guest-physical addresses. The driver side posts chains and reaps used
//! elements; the device side walks the available ring, fills inbound buffers and returns the
//! chain on the used ring. Used by [`crate::sim::SimHost`].

use std::collections::VecDeque;

use super::{Completion, QueueIndex, Token, TransportError};

/// Descriptors a posted chain occupies, keyed by its head index.
#[derive(Debug)]
struct DescChain {
    descs: Vec<u16>,
    outputs: Vec<Vec<u8>>,
    inputs: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy)]
struct UsedElem {
    id: u16,
    len: u32,
}

#[derive(Debug)]
pub struct SplitRing {
    index: QueueIndex,
    /// Queue size (number of descriptors)
    num: u16,
    free: Vec<u16>,
    table: Vec<Option<DescChain>>,
    avail: VecDeque<u16>,
    used: VecDeque<UsedElem>,
    broken: bool,
}

impl SplitRing {
    pub fn new(index: QueueIndex, num: u16) -> Self {
        Self {
            index,
            num,
            // pop() hands out low indices first
            free: (0..num).rev().collect(),
            table: (0..num).map(|_| None).collect(),
            avail: VecDeque::new(),
            used: VecDeque::new(),
            broken: false,
        }
    }

    pub fn size(&self) -> u16 {
        self.num
    }

    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn set_broken(&mut self) {
        self.broken = true;
    }

    /* ---------- driver side ---------- */

    pub fn add(
        &mut self,
        outputs: Vec<Vec<u8>>,
        inputs: Vec<Vec<u8>>,
    ) -> Result<Token, TransportError> {
        if self.broken {
            return Err(TransportError::Broken(self.index));
        }
        let needed = outputs.len() + inputs.len();
        if needed == 0 {
            return Err(TransportError::EmptyChain);
        }
        if needed > self.free.len() {
            return Err(TransportError::QueueFull(self.index));
        }
        let descs: Vec<u16> = (0..needed).filter_map(|_| self.free.pop()).collect();
        let head = descs[0];
        self.table[head as usize] = Some(DescChain {
            descs,
            outputs,
            inputs,
        });
        self.avail.push_back(head);
        Ok(Token(head))
    }

    pub fn pop_used(&mut self) -> Option<Completion> {
        let elem = self.used.pop_front()?;
        let chain = self.release(elem.id)?;
        Some(Completion {
            token: Token(elem.id),
            len: elem.len,
            outputs: chain.outputs,
            inputs: chain.inputs,
        })
    }

    pub fn detach_unused(&mut self) -> Vec<Completion> {
        let heads: Vec<u16> = self.avail.drain(..).collect();
        heads
            .into_iter()
            .filter_map(|head| {
                self.release(head).map(|chain| Completion {
                    token: Token(head),
                    len: 0,
                    outputs: chain.outputs,
                    inputs: chain.inputs,
                })
            })
            .collect()
    }

    fn release(&mut self, head: u16) -> Option<DescChain> {
        let chain = self.table.get_mut(head as usize)?.take()?;
        self.free.extend(chain.descs.iter().rev());
        Some(chain)
    }

    /* ---------- device side ---------- */

    pub fn has_avail(&self) -> bool {
        !self.broken && !self.avail.is_empty()
    }

    /// Take the next available chain head.
    pub fn pop_avail(&mut self) -> Option<u16> {
        if self.broken {
            return None;
        }
        self.avail.pop_front()
    }

    pub fn outputs(&self, head: u16) -> &[Vec<u8>] {
        match self.table.get(head as usize) {
            Some(Some(chain)) => &chain.outputs,
            _ => &[],
        }
    }

    pub fn inputs_mut(&mut self, head: u16) -> &mut [Vec<u8>] {
        match self.table.get_mut(head as usize) {
            Some(Some(chain)) => &mut chain.inputs,
            _ => &mut [],
        }
    }

    /// Put a chain on the used ring; `len` is the number of bytes written into its inbound
    /// buffers.
    pub fn put_used(&mut self, head: u16, len: u32) {
        if self.broken {
            return;
        }
        self.used.push_back(UsedElem { id: head, len });
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.index, self.num);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_reap_returns_buffers() {
        let mut ring = SplitRing::new(0, 4);
        let tok = ring.add(vec![vec![1, 2]], vec![vec![0xFF]]).unwrap();
        assert_eq!(ring.num_free(), 2);

        let head = ring.pop_avail().unwrap();
        assert_eq!(head, tok.0);
        assert_eq!(ring.outputs(head), &[vec![1, 2]]);
        ring.inputs_mut(head)[0][0] = 0;
        ring.put_used(head, 1);

        let done = ring.pop_used().unwrap();
        assert_eq!(done.token, tok);
        assert_eq!(done.len, 1);
        assert_eq!(done.inputs, vec![vec![0]]);
        assert_eq!(ring.num_free(), 4);
    }

    #[test]
    fn full_ring_rejects_chain() {
        let mut ring = SplitRing::new(1, 2);
        ring.add(vec![vec![0]], vec![]).unwrap();
        ring.add(vec![vec![0]], vec![]).unwrap();
        assert_eq!(
            ring.add(vec![vec![0]], vec![]),
            Err(TransportError::QueueFull(1))
        );
    }

    #[test]
    fn broken_ring_refuses_everything() {
        let mut ring = SplitRing::new(2, 4);
        ring.set_broken();
        assert_eq!(ring.add(vec![vec![0]], vec![]), Err(TransportError::Broken(2)));
        assert!(ring.pop_avail().is_none());
    }

    #[test]
    fn detach_unused_only_takes_untouched_chains() {
        let mut ring = SplitRing::new(0, 8);
        ring.add(vec![], vec![vec![0; 4]]).unwrap();
        ring.add(vec![], vec![vec![0; 4]]).unwrap();
        let head = ring.pop_avail().unwrap();
        let detached = ring.detach_unused();
        assert_eq!(detached.len(), 1);
        assert_ne!(detached[0].token.0, head);
    }
}
