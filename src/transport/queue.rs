use super::{Completion, QueueIndex, Token, Transport, TransportError};

/// A borrowed view of one queue on a transport.
///
/// Every operation checks for breakage first, so a dead queue fails fast and nothing new is
/// ever posted to it.
pub struct QueueHandle<'a, T: Transport + ?Sized> {
    transport: &'a T,
    index: QueueIndex,
}

impl<'a, T: Transport + ?Sized> QueueHandle<'a, T> {
    pub fn new(transport: &'a T, index: QueueIndex) -> Self {
        Self { transport, index }
    }

    pub fn index(&self) -> QueueIndex {
        self.index
    }

    pub fn is_broken(&self) -> bool {
        self.transport.is_broken(self.index)
    }

    pub fn submit(
        &self,
        outputs: Vec<Vec<u8>>,
        inputs: Vec<Vec<u8>>,
    ) -> Result<Token, TransportError> {
        if self.is_broken() {
            return Err(TransportError::Broken(self.index));
        }
        if outputs.is_empty() && inputs.is_empty() {
            return Err(TransportError::EmptyChain);
        }
        self.transport.submit(self.index, outputs, inputs)
    }

    pub fn notify(&self) -> Result<(), TransportError> {
        if self.is_broken() {
            return Err(TransportError::Broken(self.index));
        }
        self.transport.notify(self.index)
    }

    pub fn poll(&self) -> Option<Completion> {
        self.transport.poll_completion(self.index)
    }

    pub fn detach_unused(&self) -> Vec<Completion> {
        self.transport.detach_unused(self.index)
    }
}
