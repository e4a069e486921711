//! A JPIP channel: a server-assigned id plus an ordered queue of
//! in-flight requests bounded by the configured maximum.

use std::collections::VecDeque;

use crate::protocol::request::RequestId;

pub struct Channel {
    channel_id: Option<String>,
    dedicated: bool,
    max_in_flight: usize,
    in_flight: VecDeque<RequestId>,
    queued: VecDeque<RequestId>,
}

impl Channel {
    pub fn new(max_in_flight: usize, dedicated: bool) -> Self {
        Self {
            channel_id: None,
            dedicated,
            max_in_flight: max_in_flight.max(1),
            in_flight: VecDeque::new(),
            queued: VecDeque::new(),
        }
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.channel_id.as_deref()
    }

    pub fn set_channel_id(&mut self, id: String) {
        self.channel_id = Some(id);
    }

    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    pub fn is_open(&self) -> bool {
        self.channel_id.is_some()
    }

    /// Queues a request; it is released to the transport only when an
    /// in-flight slot frees up (backpressure).
    pub fn enqueue(&mut self, id: RequestId) {
        self.queued.push_back(id);
    }

    /// Removes a request that was queued but never issued.
    pub fn dequeue(&mut self, id: RequestId) -> bool {
        let before = self.queued.len();
        self.queued.retain(|q| *q != id);
        self.queued.len() != before
    }

    /// Moves the next queued request into the in-flight window if a slot
    /// is free.
    pub fn try_release(&mut self) -> Option<RequestId> {
        if self.in_flight.len() >= self.max_in_flight {
            return None;
        }
        let id = self.queued.pop_front()?;
        self.in_flight.push_back(id);
        Some(id)
    }

    /// Marks an in-flight request as answered, freeing its slot.
    pub fn complete(&mut self, id: RequestId) -> bool {
        let before = self.in_flight.len();
        self.in_flight.retain(|r| *r != id);
        self.in_flight.len() != before
    }

    pub fn load(&self) -> usize {
        self.in_flight.len() + self.queued.len()
    }

    /// All requests awaiting an answer or still queued, in issue order.
    pub fn pending(&self) -> Vec<RequestId> {
        self.in_flight
            .iter()
            .chain(self.queued.iter())
            .copied()
            .collect()
    }

    /// Drops the server binding and returns every pending request so the
    /// session can requeue or invalidate them after a reconnect.
    pub fn reset_for_reconnect(&mut self) -> Vec<RequestId> {
        self.channel_id = None;
        let pending = self.pending();
        self.in_flight.clear();
        self.queued.clear();
        pending
    }
}
