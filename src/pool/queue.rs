use std::collections::VecDeque;

use super::RequestId;

/// Requests waiting for a connection to one destination, in arrival order.
#[derive(Debug, Default)]
pub(super) struct RequestQueue {
    pending: VecDeque<RequestId>,
}

impl RequestQueue {
    pub(super) fn push_back(&mut self, id: RequestId) {
        debug_assert!(!self.pending.contains(&id), "{id:?} queued twice");
        self.pending.push_back(id);
    }

    pub(super) fn pop_front(&mut self) -> Option<RequestId> {
        self.pending.pop_front()
    }

    /// Removes `id` wherever it sits. Returns false if it was not queued.
    pub(super) fn remove(&mut self, id: RequestId) -> bool {
        match self.pending.iter().position(|queued| *queued == id) {
            Some(idx) => self.pending.remove(idx).is_some(),
            None => false,
        }
    }

    pub(super) fn drain(&mut self) -> impl Iterator<Item = RequestId> + '_ {
        self.pending.drain(..)
    }

    pub(super) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
