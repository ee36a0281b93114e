//! In-process message bus. Backs tests and single-host development runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::channel::{ChannelError, MessageBus};

#[derive(Debug, Default)]
pub struct MemoryBus {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    pushed: Notify,
    pending_failures: AtomicU32,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` bus operations fail as if the connection dropped
    pub fn fail_next(&self, n: u32) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> Result<(), ChannelError> {
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(ChannelError::Delivery("connection reset by peer".to_string()))
        } else {
            Ok(())
        }
    }

    fn pop_now(&self, queue: &str) -> Result<Option<String>, ChannelError> {
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| ChannelError::Delivery("memory bus poisoned".to_string()))?;
        Ok(queues.get_mut(queue).and_then(VecDeque::pop_front))
    }

    pub fn len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .map(|queues| queues.get(queue).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    /// Remove and return everything queued on `queue`
    pub fn drain(&self, queue: &str) -> Vec<String> {
        self.queues
            .lock()
            .map(|mut queues| queues.remove(queue).map(Vec::from).unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn push(&self, queue: &str, payload: String) -> Result<(), ChannelError> {
        self.take_failure()?;
        self.queues
            .lock()
            .map_err(|_| ChannelError::Delivery("memory bus poisoned".to_string()))?
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, ChannelError> {
        self.take_failure()?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // register before checking so a push in between is not missed
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.pop_now(queue)? {
                return Ok(Some(payload));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn clear(&self, queue: &str) -> Result<usize, ChannelError> {
        self.take_failure()?;
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| ChannelError::Delivery("memory bus poisoned".to_string()))?;
        Ok(queues.remove(queue).map_or(0, |q| q.len()))
    }
}
