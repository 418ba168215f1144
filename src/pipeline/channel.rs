use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// What `try_push` does when the channel is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the item being pushed; queued items stay.
    DropNewest,
    /// Discard the oldest queued item so the consumer always sees the freshest.
    #[default]
    DropOldest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The pushed item was discarded.
    DroppedNewest,
    /// The oldest queued item was discarded to make room.
    DroppedOldest,
}

/// Fixed-capacity, non-blocking hand-off between producer and consumer.
///
/// Neither side ever waits: `try_push` applies the overflow policy and
/// `try_pop` returns `None` when empty.
pub struct FrameChannel<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl<T> FrameChannel<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Result<Self> {
        if capacity == 0 {
            return Err(anyhow!("channel capacity must be at least 1"));
        }
        Ok(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn try_push(&self, item: T) -> Result<PushOutcome> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| anyhow!("frame channel lock poisoned"))?;
        if queue.len() < self.capacity {
            queue.push_back(item);
            return Ok(PushOutcome::Queued);
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        match self.policy {
            OverflowPolicy::DropNewest => Ok(PushOutcome::DroppedNewest),
            OverflowPolicy::DropOldest => {
                queue.pop_front();
                queue.push_back(item);
                Ok(PushOutcome::DroppedOldest)
            }
        }
    }

    pub fn try_pop(&self) -> Result<Option<T>> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| anyhow!("frame channel lock poisoned"))?;
        Ok(queue.pop_front())
    }

    /// Take everything queued, oldest first.
    pub fn drain(&self) -> Result<Vec<T>> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| anyhow!("frame channel lock poisoned"))?;
        Ok(queue.drain(..).collect())
    }

    /// Discard everything queued; returns how many items were dropped.
    pub fn clear(&self) -> Result<usize> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| anyhow!("frame channel lock poisoned"))?;
        let n = queue.len();
        queue.clear();
        Ok(n)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Items lost to overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_oldest_keeps_freshest_frame() -> Result<()> {
        let channel = FrameChannel::new(1, OverflowPolicy::DropOldest)?;
        assert_eq!(channel.try_push("F1")?, PushOutcome::Queued);
        assert_eq!(channel.try_push("F2")?, PushOutcome::DroppedOldest);
        assert_eq!(channel.try_pop()?, Some("F2"));
        assert_eq!(channel.try_pop()?, None);
        assert_eq!(channel.dropped(), 1);
        Ok(())
    }

    #[test]
    fn drop_newest_keeps_queued_frame() -> Result<()> {
        let channel = FrameChannel::new(1, OverflowPolicy::DropNewest)?;
        channel.try_push(1)?;
        assert_eq!(channel.try_push(2)?, PushOutcome::DroppedNewest);
        assert_eq!(channel.drain()?, vec![1]);
        assert!(channel.is_empty());
        Ok(())
    }

    #[test]
    fn never_exceeds_capacity() -> Result<()> {
        let channel = FrameChannel::new(4, OverflowPolicy::default())?;
        for i in 0..10 {
            channel.try_push(i)?;
            assert!(channel.len() <= 4);
        }
        assert_eq!(channel.drain()?, vec![6, 7, 8, 9]);
        assert_eq!(channel.clear()?, 0);
        assert!(FrameChannel::<u8>::new(0, OverflowPolicy::DropNewest).is_err());
        Ok(())
    }
}
