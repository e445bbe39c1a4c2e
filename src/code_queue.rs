// reprap_host_rust/src/code_queue.rs

// Deferred command queue. Codes that are time-sensitive but not
// position-sensitive (fan speed, heater targets, display messages...) are
// stored here with the total-moves counter at the time they were read, and
// released once the planner has completed that many moves. That keeps them
// in sync with the motion stream instead of running hundreds of buffered
// moves early.

use std::collections::VecDeque;

use crate::gcode_buffer::CodeSource;
use crate::CODE_QUEUE_LENGTH;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCode {
    pub code: String,
    /// Channel that issued the code; replies pretend to come from it.
    pub source: CodeSource,
    /// Released when the completed-moves counter reaches this value.
    pub execute_at_move: u32,
}

pub struct CodeQueue {
    items: VecDeque<QueuedCode>,
}

impl CodeQueue {
    pub fn new() -> Self {
        CodeQueue { items: VecDeque::with_capacity(CODE_QUEUE_LENGTH) }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= CODE_QUEUE_LENGTH
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Store a code for execution at `execute_at_move`. Fails when all
    /// queue entries are in use.
    pub fn push(&mut self, code: &str, source: CodeSource, execute_at_move: u32) -> bool {
        if self.is_full() {
            return false;
        }
        log::debug!("queued '{}' for move {}", code, execute_at_move);
        self.items.push_back(QueuedCode {
            code: code.to_string(),
            source,
            execute_at_move,
        });
        true
    }

    /// Release the head entry if its scheduled move has completed.
    pub fn pop_ready(&mut self, completed_moves: u32) -> Option<QueuedCode> {
        if self.items.front()?.execute_at_move <= completed_moves {
            self.items.pop_front()
        } else {
            None
        }
    }

    /// Release the head entry regardless of the move counter. Used when the
    /// queue is full and space must be made for the next code.
    pub fn pop_front(&mut self) -> Option<QueuedCode> {
        self.items.pop_front()
    }

    /// Drop entries from `source` scheduled after `total_moves`. A pause
    /// rewinds the file past the moves those codes were waiting on, so they
    /// must never run.
    pub fn purge_after(&mut self, source: CodeSource, total_moves: u32) {
        self.items
            .retain(|item| item.source != source || item.execute_at_move <= total_moves);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedCode> {
        self.items.iter()
    }
}

impl Default for CodeQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_in_order_when_moves_complete() {
        let mut q = CodeQueue::new();
        assert!(q.push("M106 S255", CodeSource::File, 5));
        assert!(q.push("M107", CodeSource::File, 9));

        assert!(q.pop_ready(4).is_none());
        let first = q.pop_ready(5).unwrap();
        assert_eq!(first.code, "M106 S255");
        // Second entry still waits for its own tag.
        assert!(q.pop_ready(5).is_none());
        assert_eq!(q.pop_ready(20).unwrap().code, "M107");
        assert!(q.is_empty());
    }

    #[test]
    fn bounded_capacity() {
        let mut q = CodeQueue::new();
        for i in 0..CODE_QUEUE_LENGTH {
            assert!(q.push("M117 hi", CodeSource::File, i as u32));
        }
        assert!(q.is_full());
        assert!(!q.push("M117 overflow", CodeSource::File, 99));
    }

    #[test]
    fn pause_purge_drops_only_abandoned_file_entries() {
        let mut q = CodeQueue::new();
        q.push("M106 S10", CodeSource::File, 3);
        q.push("M106 S20", CodeSource::File, 8);
        q.push("M117 msg", CodeSource::Usb, 9);

        // The pause rewinds the file so that only 5 moves stand.
        q.purge_after(CodeSource::File, 5);

        let remaining: Vec<_> = q.iter().map(|i| i.code.clone()).collect();
        assert_eq!(remaining, vec!["M106 S10", "M117 msg"]);
    }
}
