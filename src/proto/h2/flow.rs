//! Send-side flow control windows.

use crate::error::Reason;

const MAX_WINDOW: i64 = (1 << 31) - 1;

/// A flow-control window. Can go negative when the peer shrinks
/// `INITIAL_WINDOW_SIZE` below what streams already consumed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlowControl {
    window: i64,
}

impl FlowControl {
    pub(crate) fn new(initial: u32) -> Self {
        Self {
            window: i64::from(initial),
        }
    }

    /// Bytes currently available to send.
    pub(crate) fn available(&self) -> usize {
        self.window.max(0) as usize
    }

    pub(crate) fn consume(&mut self, len: usize) {
        self.window -= len as i64;
    }

    /// Apply a WINDOW_UPDATE or a positive settings delta.
    pub(crate) fn expand(&mut self, increment: u32) -> crate::Result<()> {
        let next = self.window + i64::from(increment);
        if next > MAX_WINDOW {
            return Err(crate::Error::new_proto(Reason::FLOW_CONTROL_ERROR));
        }
        self.window = next;
        Ok(())
    }

    /// Apply an `INITIAL_WINDOW_SIZE` change to an existing stream window.
    pub(crate) fn adjust(&mut self, delta: i64) {
        self.window += delta;
    }
}
