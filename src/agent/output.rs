//! Append-only output buffer with a bounded in-memory window

/// In-memory cap per agent; overflow is truncated at the head. Full
/// history lives in the store's output_chunks log.
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// Append-only byte buffer holding the tail of an agent's output.
///
/// `total_written` counts every byte ever appended, so readers can ask
/// for the delta since an offset even after head truncation.
pub struct OutputBuffer {
    buf: Vec<u8>,
    capacity: usize,
    total_written: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::new(),
            capacity,
            total_written: 0,
        }
    }

    pub fn append(&mut self, chunk: &[u8]) {
        self.total_written += chunk.len() as u64;

        if chunk.len() >= self.capacity {
            // Chunk alone fills the window; keep its tail
            self.buf.clear();
            self.buf.extend_from_slice(&chunk[chunk.len() - self.capacity..]);
            return;
        }

        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.capacity {
            let excess = self.buf.len() - self.capacity;
            self.buf.drain(..excess);
        }
    }

    /// Point-in-time copy of the buffered window
    pub fn contents(&self) -> Vec<u8> {
        self.buf.clone()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total bytes ever appended, including truncated ones
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Bytes appended after `offset` that are still buffered
    pub fn since(&self, offset: u64) -> Vec<u8> {
        if offset >= self.total_written {
            return Vec::new();
        }
        let wanted = (self.total_written - offset) as usize;
        let available = wanted.min(self.buf.len());
        self.buf[self.buf.len() - available..].to_vec()
    }

    /// Explicit reset ahead of a full re-derivation
    pub fn reset(&mut self) {
        self.buf.clear();
        self.total_written = 0;
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
