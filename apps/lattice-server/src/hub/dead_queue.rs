//! Fixed-size ring of previously-sent frames, used for reconnect replay.

/// Number of slots in a connection's dead queue. A resume is only
/// possible while the wanted sequence is still within this window.
pub const DEAD_QUEUE_SIZE: usize = 128;

/// One previously-written event: its stamped sequence and the exact text
/// frame that went on the wire.
#[derive(Debug, Clone)]
pub struct DeadQueueItem {
    pub seq: i64,
    pub frame: String,
}

/// Circular buffer of the last `DEAD_QUEUE_SIZE` written events, in
/// insertion order. The pointer names the next insert slot; entries are
/// overwritten cyclically and never explicitly freed.
#[derive(Debug, Default)]
pub struct DeadQueue {
    items: Vec<Option<DeadQueueItem>>,
    pointer: usize,
}

impl DeadQueue {
    pub fn new() -> Self {
        DeadQueue {
            items: (0..DEAD_QUEUE_SIZE).map(|_| None).collect(),
            pointer: 0,
        }
    }

    pub fn push(&mut self, seq: i64, frame: String) {
        if self.items.len() != DEAD_QUEUE_SIZE {
            *self = DeadQueue::new();
        }
        self.items[self.pointer] = Some(DeadQueueItem { seq, frame });
        self.pointer = (self.pointer + 1) % DEAD_QUEUE_SIZE;
    }

    /// True when nothing has ever been written (or the queue was cleared).
    pub fn is_empty(&self) -> bool {
        self.last_written().is_none()
    }

    fn last_written(&self) -> Option<&DeadQueueItem> {
        if self.items.len() != DEAD_QUEUE_SIZE {
            return None;
        }
        let prev = (self.pointer + DEAD_QUEUE_SIZE - 1) % DEAD_QUEUE_SIZE;
        self.items[prev].as_ref()
    }

    /// Sequence of the most recently written event, if any.
    pub fn last_seq(&self) -> Option<i64> {
        self.last_written().map(|item| item.seq)
    }

    /// Whether a client resuming at `wanted_seq` missed anything. No loss
    /// iff the slot immediately before the pointer holds `wanted_seq - 1`;
    /// the slot arithmetic covers both the wrapped and unwrapped cases.
    pub fn has_msg_loss(&self, wanted_seq: i64) -> bool {
        match self.last_seq() {
            None => false,
            Some(last) => last != wanted_seq - 1,
        }
    }

    /// Index of the slot holding `seq`, if it is still in the window.
    pub fn index_of(&self, seq: i64) -> Option<usize> {
        self.items
            .iter()
            .position(|item| item.as_ref().is_some_and(|i| i.seq == seq))
    }

    /// Visit every item from `index` forward through the wrap point,
    /// stopping when the next slot is empty (not yet wrapped) or its
    /// sequence decreases (wrap detected).
    pub fn drain_from<F: FnMut(&DeadQueueItem)>(&self, index: usize, mut f: F) {
        let mut idx = index % DEAD_QUEUE_SIZE.max(1);
        let mut prev_seq = i64::MIN;
        for _ in 0..self.items.len() {
            let Some(item) = self.items[idx].as_ref() else {
                return;
            };
            if item.seq < prev_seq {
                return;
            }
            f(item);
            prev_seq = item.seq;
            idx = (idx + 1) % DEAD_QUEUE_SIZE;
        }
    }

    pub fn clear(&mut self) {
        *self = DeadQueue::new();
    }

    /// Sequences currently held, in insertion order. Diagnostic only.
    pub fn seqs(&self) -> Vec<i64> {
        let mut out = Vec::new();
        if let Some(first) = self
            .items
            .iter()
            .filter_map(|i| i.as_ref().map(|i| i.seq))
            .min()
        {
            if let Some(idx) = self.index_of(first) {
                self.drain_from(idx, |item| out.push(item.seq));
            }
        }
        out
    }
}
