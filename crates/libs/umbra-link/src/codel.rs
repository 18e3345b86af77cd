//! CoDel-managed outbound queue. Per-queue soft cap; overflow drops the
//! oldest entry, since the transport above retransmits anyway.

use std::collections::VecDeque;

use tokio::time::{Duration, Instant};

pub const DEFAULT_TARGET: Duration = Duration::from_millis(5);
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_CAP: usize = 1024;

pub struct CodelQueue<T> {
    items: VecDeque<(Instant, T)>,
    cap: usize,
    target: Duration,
    interval: Duration,
    /// Set once the head has been above target; drops begin when it lapses.
    first_above: Option<Instant>,
    dropped: u64,
}

impl<T> CodelQueue<T> {
    pub fn new() -> Self {
        Self::with_params(DEFAULT_CAP, DEFAULT_TARGET, DEFAULT_INTERVAL)
    }

    pub fn with_params(cap: usize, target: Duration, interval: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            cap,
            target,
            interval,
            first_above: None,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn push(&mut self, item: T, now: Instant) {
        if self.items.len() >= self.cap {
            self.items.pop_front();
            self.dropped += 1;
        }
        self.items.push_back((now, item));
    }

    /// Pop the next item, shedding head-of-line entries whose sojourn has
    /// stayed above target for a whole interval.
    pub fn pop(&mut self, now: Instant) -> Option<T> {
        loop {
            let (queued_at, item) = self.items.pop_front()?;
            let sojourn = now.duration_since(queued_at);
            if sojourn < self.target {
                self.first_above = None;
                return Some(item);
            }
            match self.first_above {
                None => {
                    self.first_above = Some(now + self.interval);
                    return Some(item);
                }
                Some(deadline) if now >= deadline => {
                    // shed and try the next entry
                    self.dropped += 1;
                    self.first_above = Some(now + self.interval);
                }
                Some(_) => return Some(item),
            }
        }
    }

    pub fn drain_all(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..).map(|(_, item)| item)
    }
}

impl<T> Default for CodelQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
