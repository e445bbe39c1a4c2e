// reprap_host_rust/src/output_buffer.rs

// Pooled buffers for reply data. Large replies (file lists, JSON status)
// are built as a chain of fixed-size buffers; the same chain can be handed
// to several sinks at once by raising its reference count. The pool is a
// fixed array addressed by index, so exhaustion is visible and bounded.

pub const OUTPUT_BUFFER_SIZE: usize = 256;
pub const NUM_OUTPUT_BUFFERS: usize = 16;

pub type BufferIndex = usize;

#[derive(Debug)]
struct Slot {
    data: Vec<u8>,
    next: Option<BufferIndex>,
    references: usize,
}

impl Slot {
    fn new() -> Self {
        Slot { data: Vec::with_capacity(OUTPUT_BUFFER_SIZE), next: None, references: 0 }
    }

    fn free(&self) -> bool {
        self.references == 0
    }
}

pub struct OutputBufferPool {
    slots: Vec<Slot>,
    max_used: usize,
}

impl OutputBufferPool {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(NUM_OUTPUT_BUFFERS);
        for _ in 0..NUM_OUTPUT_BUFFERS {
            slots.push(Slot::new());
        }
        OutputBufferPool { slots, max_used: 0 }
    }

    pub fn used(&self) -> usize {
        self.slots.iter().filter(|s| !s.free()).count()
    }

    pub fn max_used(&self) -> usize {
        self.max_used
    }

    /// Allocate one buffer. Returns None when the pool is exhausted; the
    /// caller retries on a later tick rather than blocking.
    pub fn allocate(&mut self) -> Option<BufferIndex> {
        let idx = self.slots.iter().position(|s| s.free())?;
        let slot = &mut self.slots[idx];
        slot.data.clear();
        slot.next = None;
        slot.references = 1;
        self.max_used = self.max_used.max(self.used());
        Some(idx)
    }

    /// Append text to a chain, allocating continuation buffers as needed.
    /// Returns false (with the chain truncated) if the pool runs out.
    pub fn cat(&mut self, head: BufferIndex, text: &str) -> bool {
        let mut idx = self.tail_of(head);
        for &b in text.as_bytes() {
            if self.slots[idx].data.len() >= OUTPUT_BUFFER_SIZE {
                match self.allocate() {
                    Some(next) => {
                        self.slots[next].references = self.slots[head].references;
                        self.slots[idx].next = Some(next);
                        idx = next;
                    }
                    None => {
                        log::warn!("output buffer pool exhausted, reply truncated");
                        return false;
                    }
                }
            }
            self.slots[idx].data.push(b);
        }
        true
    }

    /// Replace the chain contents with `text`.
    pub fn copy(&mut self, head: BufferIndex, text: &str) -> bool {
        if let Some(next) = self.slots[head].next.take() {
            self.release_all(next);
        }
        self.slots[head].data.clear();
        self.cat(head, text)
    }

    /// Link `tail` onto the end of `head`'s chain.
    pub fn append(&mut self, head: BufferIndex, tail: BufferIndex) {
        let end = self.tail_of(head);
        self.slots[end].next = Some(tail);
    }

    fn tail_of(&self, head: BufferIndex) -> BufferIndex {
        let mut idx = head;
        while let Some(next) = self.slots[idx].next {
            idx = next;
        }
        idx
    }

    /// Total bytes in the chain.
    pub fn length(&self, head: BufferIndex) -> usize {
        let mut idx = Some(head);
        let mut len = 0;
        while let Some(i) = idx {
            len += self.slots[i].data.len();
            idx = self.slots[i].next;
        }
        len
    }

    /// Flatten the chain to a string (sinks consume replies this way).
    pub fn collect(&self, head: BufferIndex) -> String {
        let mut out = Vec::new();
        let mut idx = Some(head);
        while let Some(i) = idx {
            out.extend_from_slice(&self.slots[i].data);
            idx = self.slots[i].next;
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Share the chain with one more consumer.
    pub fn increase_references(&mut self, head: BufferIndex) {
        let mut idx = Some(head);
        while let Some(i) = idx {
            self.slots[i].references += 1;
            idx = self.slots[i].next;
        }
    }

    /// Drop one reference to every buffer in the chain, freeing the slots
    /// when the last consumer is done.
    pub fn release_all(&mut self, head: BufferIndex) {
        let mut idx = Some(head);
        while let Some(i) = idx {
            idx = self.slots[i].next;
            let slot = &mut self.slots[i];
            slot.references = slot.references.saturating_sub(1);
            if slot.free() {
                slot.data.clear();
                slot.next = None;
            }
        }
    }
}

impl Default for OutputBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_collect() {
        let mut pool = OutputBufferPool::new();
        let b = pool.allocate().unwrap();
        assert!(pool.cat(b, "T:210.0 B:60.0\n"));
        assert_eq!(pool.collect(b), "T:210.0 B:60.0\n");
        pool.release_all(b);
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn long_reply_spans_buffers() {
        let mut pool = OutputBufferPool::new();
        let b = pool.allocate().unwrap();
        let text = "x".repeat(OUTPUT_BUFFER_SIZE * 2 + 10);
        assert!(pool.cat(b, &text));
        assert_eq!(pool.length(b), text.len());
        assert_eq!(pool.used(), 3);
        pool.release_all(b);
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn shared_chain_survives_first_release() {
        let mut pool = OutputBufferPool::new();
        let b = pool.allocate().unwrap();
        pool.cat(b, "shared");
        pool.increase_references(b); // fanned out to a second sink
        pool.release_all(b);
        assert_eq!(pool.collect(b), "shared");
        pool.release_all(b);
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let mut pool = OutputBufferPool::new();
        let mut held = Vec::new();
        while let Some(b) = pool.allocate() {
            held.push(b);
        }
        assert_eq!(held.len(), NUM_OUTPUT_BUFFERS);
        let head = held[0];
        // No free continuation buffers left.
        assert!(!pool.cat(head, &"y".repeat(OUTPUT_BUFFER_SIZE + 1)));
    }

    #[test]
    fn copy_replaces_previous_chain() {
        let mut pool = OutputBufferPool::new();
        let b = pool.allocate().unwrap();
        pool.cat(b, &"a".repeat(OUTPUT_BUFFER_SIZE + 1));
        assert_eq!(pool.used(), 2);
        pool.copy(b, "short");
        assert_eq!(pool.collect(b), "short");
        assert_eq!(pool.used(), 1);
    }
}
