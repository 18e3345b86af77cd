//! Outbound messages for routers we have no established session with yet.
//! Bounded per router; flushed when the session comes up, dropped with a
//! congestion note when it overflows or goes stale.

use std::collections::{HashMap, VecDeque};

use umbra_core::wire::LinkMessage;
use umbra_core::{Error, RouterId};

pub const QUEUE_CAP: usize = 32;
const MAX_AGE_MS: u64 = 30_000;

#[derive(Default)]
pub struct PendingQueues {
    queues: HashMap<RouterId, VecDeque<(LinkMessage, u64)>>,
}

impl PendingQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, router: RouterId, msg: LinkMessage, now_ms: u64) -> Result<(), Error> {
        let queue = self.queues.entry(router).or_default();
        if queue.len() >= QUEUE_CAP {
            return Err(Error::Congested);
        }
        queue.push_back((msg, now_ms));
        Ok(())
    }

    pub fn drain(&mut self, router: &RouterId) -> Vec<LinkMessage> {
        self.queues
            .remove(router)
            .map(|q| q.into_iter().map(|(msg, _)| msg).collect())
            .unwrap_or_default()
    }

    pub fn queued_for(&self, router: &RouterId) -> usize {
        self.queues.get(router).map(|q| q.len()).unwrap_or(0)
    }

    /// Drop messages that waited longer than the session-dial horizon.
    pub fn expire(&mut self, now_ms: u64) -> usize {
        let mut dropped = 0;
        self.queues.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|(_, queued_at)| now_ms.saturating_sub(*queued_at) < MAX_AGE_MS);
            dropped += before - queue.len();
            !queue.is_empty()
        });
        dropped
    }
}
