//! What a bound device holds, in the order it was taken.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Negotiated features, live queues, driver-ready status.
    Queues,
    /// Empty buffers posted on the receive queue.
    RxBuffers,
    /// Interface registered with the network stack.
    NetRegistration,
}

/// Teardown is the exact reverse of acquisition and never skips an entry.
#[derive(Debug, Default)]
pub struct ResourceStack {
    held: Vec<Resource>,
}

impl ResourceStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, res: Resource) {
        log::trace!("acquired {:?}", res);
        self.held.push(res);
    }

    pub fn held(&self) -> &[Resource] {
        &self.held
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Pop and release everything, most recent first.
    pub fn unwind(&mut self, mut release: impl FnMut(Resource)) {
        while let Some(res) = self.held.pop() {
            log::debug!("teardown: releasing {:?}", res);
            release(res);
        }
    }
}
