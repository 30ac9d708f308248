//! Per-order mutual exclusion with a bounded wait and a lease.
//!
//! The lock keeps two scheduler instances from remediating the same
//! order at once. The lease only bounds staleness when a holder dies
//! mid-remediation; expiry lets the next sweep reclaim the order, it is
//! not an ordering mechanism. Failing to take the lock is not an error,
//! the order is simply skipped until the next sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::EngineError;

#[async_trait]
pub trait OrderLock: Send + Sync {
    /// Try to take the lock for `order_no`, retrying until `wait` has
    /// elapsed. Returns `false` if somebody else still holds it.
    async fn try_lock(
        &self,
        order_no: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<bool, EngineError>;

    async fn unlock(&self, order_no: &str) -> Result<(), EngineError>;

    async fn is_locked(&self, order_no: &str) -> Result<bool, EngineError>;
}

/// Process-local lock table.
///
/// Correct for a single scheduler process. Scaling out requires an
/// implementation over a shared coordination store, which is why the
/// engine only ever sees the trait.
#[derive(Clone, Debug)]
pub struct InMemoryOrderLock {
    held: Arc<Mutex<HashMap<String, Instant>>>,
    poll_interval: Duration,
}

impl Default for InMemoryOrderLock {
    fn default() -> Self {
        Self {
            held: Arc::new(Mutex::new(HashMap::new())),
            poll_interval: Duration::from_millis(25),
        }
    }
}

impl InMemoryOrderLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn acquire(&self, order_no: &str, lease: Duration) -> Result<bool, EngineError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| EngineError::Lock("lock table poisoned".to_string()))?;
        let now = Instant::now();
        match held.get(order_no) {
            Some(expiry) if *expiry > now => Ok(false),
            _ => {
                held.insert(order_no.to_string(), now + lease);
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl OrderLock for InMemoryOrderLock {
    async fn try_lock(
        &self,
        order_no: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<bool, EngineError> {
        let deadline = Instant::now() + wait;
        loop {
            if self.acquire(order_no, lease)? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn unlock(&self, order_no: &str) -> Result<(), EngineError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| EngineError::Lock("lock table poisoned".to_string()))?;
        held.remove(order_no);
        Ok(())
    }

    async fn is_locked(&self, order_no: &str) -> Result<bool, EngineError> {
        let held = self
            .held
            .lock()
            .map_err(|_| EngineError::Lock("lock table poisoned".to_string()))?;
        Ok(held
            .get(order_no)
            .is_some_and(|expiry| *expiry > Instant::now()))
    }
}
