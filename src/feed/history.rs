use crate::feed::types::CanonicalBlock;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A decoded record took the slot of a synthesized one with the same key.
    Replaced,
    Duplicate,
}

/// Bounded, newest-first window of one feed's blocks.
#[derive(Debug, Clone)]
pub struct BlockHistory {
    capacity: usize,
    blocks: VecDeque<CanonicalBlock>,
    total_seen: u64,
}

impl BlockHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            blocks: VecDeque::with_capacity(capacity + 1),
            total_seen: 0,
        }
    }

    /// Rejects a record whose `(number, child_index)` is already in the window,
    /// unless the stored one is synthesized and the new one is not.
    pub fn insert(&mut self, block: CanonicalBlock) -> InsertOutcome {
        let key = block.dedup_key();
        let Some(position) = self
            .blocks
            .iter()
            .position(|existing| existing.dedup_key() == key)
        else {
            self.blocks.push_front(block);
            self.blocks.truncate(self.capacity);
            self.total_seen = self.total_seen.saturating_add(1);
            return InsertOutcome::Inserted;
        };

        let stored_is_synthesized = self.blocks[position].synthesized;
        if !stored_is_synthesized || block.synthesized {
            return InsertOutcome::Duplicate;
        }

        // Same slot count, so total_seen is unchanged.
        self.blocks.remove(position);
        self.blocks.push_front(block);
        InsertOutcome::Replaced
    }

    pub fn latest(&self) -> Option<&CanonicalBlock> {
        self.blocks.front()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &CanonicalBlock> {
        self.blocks.iter()
    }

    pub fn to_vec(&self) -> Vec<CanonicalBlock> {
        self.blocks.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_seen(&self) -> u64 {
        self.total_seen
    }
}
