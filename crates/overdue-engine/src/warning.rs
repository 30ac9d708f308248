//! Last-warning markers used to deduplicate repeated warnings.
//!
//! One record is kept per order, holding the last warned status and when
//! it was sent. Recording a warning for a different status supersedes
//! the old marker. A periodic purge, independent of the sweep interval,
//! drops markers older than the retention window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use overdue_core::{OrderKind, TimeoutState};

use crate::error::EngineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WarningRecord {
    pub state: TimeoutState,
    pub recorded_at: DateTime<Utc>,
}

pub trait WarningStore: Send + Sync {
    fn last_warning(
        &self,
        kind: OrderKind,
        order_id: i64,
    ) -> Result<Option<WarningRecord>, EngineError>;

    fn record_warning(
        &self,
        kind: OrderKind,
        order_id: i64,
        state: TimeoutState,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    /// Drop records older than `retention`, returning how many went.
    fn purge_expired(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize, EngineError>;
}

/// Thread-safe in-process marker store.
///
/// Suppression stays consistent only within one process. Running several
/// scheduler instances requires an externalized implementation of
/// [`WarningStore`], otherwise each instance warns independently.
#[derive(Clone, Debug, Default)]
pub struct InMemoryWarningStore {
    records: Arc<Mutex<HashMap<(OrderKind, i64), WarningRecord>>>,
}

impl InMemoryWarningStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WarningStore for InMemoryWarningStore {
    fn last_warning(
        &self,
        kind: OrderKind,
        order_id: i64,
    ) -> Result<Option<WarningRecord>, EngineError> {
        let records = self
            .records
            .lock()
            .map_err(|_| EngineError::Store("warning cache poisoned".to_string()))?;
        Ok(records.get(&(kind, order_id)).copied())
    }

    fn record_warning(
        &self,
        kind: OrderKind,
        order_id: i64,
        state: TimeoutState,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| EngineError::Store("warning cache poisoned".to_string()))?;
        records.insert(
            (kind, order_id),
            WarningRecord {
                state,
                recorded_at: now,
            },
        );
        Ok(())
    }

    fn purge_expired(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize, EngineError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| EngineError::Store("warning cache poisoned".to_string()))?;
        let before = records.len();
        records.retain(|_, record| now - record.recorded_at < retention);
        Ok(before - records.len())
    }
}
