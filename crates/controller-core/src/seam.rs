//! Snapshot/tail seam helpers.
//!
//! Streaming RPCs emit a historical snapshot followed by the live tail. The
//! seam between the two is deduplicated with a high-watermark guard: an
//! event already reflected in the snapshot carries an id at or below the
//! watermark and is suppressed.

use crate::types::EventOp;

/// Which live mutations a streaming request asked for.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamFlags {
    pub creates: bool,
    pub updates: bool,
}

impl StreamFlags {
    /// A request asking for neither creates nor updates is a plain paged
    /// query: one response, then the RPC ends.
    #[must_use]
    pub fn is_unary(self) -> bool {
        !(self.creates || self.updates)
    }

    /// Whether a live event with this op should be forwarded.
    #[must_use]
    pub fn admits(self, op: EventOp) -> bool {
        match op {
            EventOp::Create => self.creates,
            EventOp::Update => self.updates,
        }
    }
}

/// High-watermark deduplication for the snapshot/tail seam.
///
/// `admit` rejects any id at or below the watermark and advances it
/// otherwise, which also makes re-delivered events (the log is
/// at-least-once) idempotent.
#[derive(Debug, Default)]
pub struct SeamGuard {
    curr_id: i64,
}

impl SeamGuard {
    /// Starts the guard at the highest id reflected in the snapshot.
    #[must_use]
    pub fn new(watermark: i64) -> Self {
        Self { curr_id: watermark }
    }

    /// Advances the watermark without admitting (snapshot phase).
    pub fn advance(&mut self, id: i64) {
        self.curr_id = self.curr_id.max(id);
    }

    /// Returns whether the event is new, advancing the watermark if so.
    pub fn admit(&mut self, id: i64) -> bool {
        if id <= self.curr_id {
            return false;
        }
        self.curr_id = id;
        true
    }

    #[must_use]
    pub fn watermark(&self) -> i64 {
        self.curr_id
    }
}
