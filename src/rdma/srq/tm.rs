//! Tag-matching bookkeeping of a TM SRQ.

/// Tag-matching capabilities requested at creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TmCap {
    /// Tags the hardware list can hold.
    pub max_num_tags: u32,
    /// Outstanding list operations.
    pub max_ops: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TagEntry {
    next: Option<u32>,
    pub wr_id: u64,
}

/// An outstanding list operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SrqOp {
    pub tag: Option<u32>,
    pub wr_id: u64,
    /// Send queue head of the command QP when the operation was posted.
    pub wqe_head: u32,
}

/// Free list of tag entries plus the ring of outstanding operations.
///
/// The list always keeps one entry as the tail anchor, so `max_num_tags`
/// entries out of `max_num_tags + 1` can be in use.
#[derive(Debug)]
pub(crate) struct TmState {
    tags: Vec<TagEntry>,
    head: u32,
    tail: u32,
    ops: Vec<SrqOp>,
    op_head: u32,
    op_tail: u32,
}

impl TmState {
    pub fn new(max_num_tags: u32, op_slots: u32) -> Self {
        let n = max_num_tags as usize + 1;
        let mut tags = vec![TagEntry::default(); n];
        for (i, tag) in tags.iter_mut().enumerate().take(n - 1) {
            tag.next = Some(i as u32 + 1);
        }
        Self {
            tags,
            head: 0,
            tail: max_num_tags,
            ops: vec![SrqOp::default(); op_slots as usize],
            op_head: 0,
            op_tail: 0,
        }
    }

    /// Number of tag entries, the anchor included.
    #[inline]
    pub fn num_tags(&self) -> usize {
        self.tags.len()
    }

    #[inline]
    pub fn op_slots(&self) -> usize {
        self.ops.len()
    }

    /// Take a free tag entry.
    pub fn alloc_tag(&mut self) -> Option<u32> {
        if self.head == self.tail {
            return None;
        }
        let idx = self.head;
        let entry = &mut self.tags[idx as usize];
        self.head = entry.next.take()?;
        Some(idx)
    }

    /// Return a tag entry to the tail of the free list.
    pub fn free_tag(&mut self, idx: u32) {
        if idx as usize >= self.tags.len() {
            return;
        }
        self.tags[idx as usize] = TagEntry::default();
        self.tags[self.tail as usize].next = Some(idx);
        self.tail = idx;
    }

    pub fn tag_mut(&mut self, idx: u32) -> Option<&mut TagEntry> {
        self.tags.get_mut(idx as usize)
    }

    /// Number of operations posted and not yet completed.
    #[inline]
    pub fn outstanding_ops(&self) -> u32 {
        self.op_tail.wrapping_sub(self.op_head)
    }

    /// Record a posted operation. Fails when the ring is full.
    pub fn push_op(&mut self, op: SrqOp) -> Option<()> {
        let slots = self.ops.len() as u32;
        if slots == 0 || self.outstanding_ops() >= slots {
            return None;
        }
        self.ops[(self.op_tail % slots) as usize] = op;
        self.op_tail = self.op_tail.wrapping_add(1);
        Some(())
    }

    /// Retire the oldest operation.
    pub fn pop_op(&mut self) -> Option<SrqOp> {
        if self.outstanding_ops() == 0 {
            return None;
        }
        let slots = self.ops.len() as u32;
        let op = self.ops[(self.op_head % slots) as usize];
        self.op_head = self.op_head.wrapping_add(1);
        Some(op)
    }
}
