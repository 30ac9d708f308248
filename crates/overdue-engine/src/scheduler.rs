//! The periodic sweep driver.
//!
//! On every tick the scheduler loads all open orders, sorts them so
//! higher-priority kinds go first, and runs classify plus remediate per
//! order inside its own unit of work behind the order lock. One order's
//! failure is logged and counted, never propagated; the sweep always
//! finishes the list. A second, slower tick purges stale warning
//! markers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use overdue_core::{classify, OrderKind, TimeoutRules};

use crate::error::EngineError;
use crate::lock::OrderLock;
use crate::ports::{NotifyPort, TimeoutEventSink};
use crate::remediation::{RemediationHandler, RemediationOutcome};
use crate::store::{MarketStore, UnitOfWork, UnitReceipt};
use crate::warning::WarningStore;

const ENV_SWEEP_INTERVAL_SECS: &str = "OVERDUE_SWEEP_INTERVAL_SECS";
const ENV_LOCK_WAIT_MS: &str = "OVERDUE_LOCK_WAIT_MS";
const ENV_LOCK_LEASE_SECS: &str = "OVERDUE_LOCK_LEASE_SECS";
const ENV_PURGE_INTERVAL_SECS: &str = "OVERDUE_WARNING_PURGE_INTERVAL_SECS";
const ENV_RETENTION_HOURS: &str = "OVERDUE_WARNING_RETENTION_HOURS";

/// Operational knobs of the sweep loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SweepConfig {
    pub sweep_interval: Duration,
    /// How long to wait on a contended order lock before skipping.
    pub lock_wait: Duration,
    pub lock_lease: Duration,
    pub purge_interval: Duration,
    pub warning_retention: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            lock_wait: Duration::from_millis(500),
            lock_lease: Duration::from_secs(30),
            purge_interval: Duration::from_secs(3600),
            warning_retention: Duration::from_secs(24 * 3600),
        }
    }
}

impl SweepConfig {
    /// Defaults plus environment overrides.
    pub fn from_env_map(env: &HashMap<String, String>) -> Result<Self, String> {
        let mut config = Self::default();
        if let Some(raw) = env.get(ENV_SWEEP_INTERVAL_SECS) {
            config.sweep_interval = Duration::from_secs(parse_env(ENV_SWEEP_INTERVAL_SECS, raw)?);
        }
        if let Some(raw) = env.get(ENV_LOCK_WAIT_MS) {
            config.lock_wait = Duration::from_millis(parse_env(ENV_LOCK_WAIT_MS, raw)?);
        }
        if let Some(raw) = env.get(ENV_LOCK_LEASE_SECS) {
            config.lock_lease = Duration::from_secs(parse_env(ENV_LOCK_LEASE_SECS, raw)?);
        }
        if let Some(raw) = env.get(ENV_PURGE_INTERVAL_SECS) {
            config.purge_interval = Duration::from_secs(parse_env(ENV_PURGE_INTERVAL_SECS, raw)?);
        }
        if let Some(raw) = env.get(ENV_RETENTION_HOURS) {
            let hours: u64 = parse_env(ENV_RETENTION_HOURS, raw)?;
            config.warning_retention = Duration::from_secs(hours * 3600);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.sweep_interval.is_zero() {
            return Err("sweep interval must be positive".to_string());
        }
        if self.purge_interval.is_zero() {
            return Err("warning purge interval must be positive".to_string());
        }
        if self.lock_lease.is_zero() {
            return Err("lock lease must be positive".to_string());
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, String> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| format!("invalid value for {key}: {raw:?}"))
}

/// Tally of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub normal: usize,
    pub warned: usize,
    pub remediated: usize,
    pub skipped_locked: usize,
    pub failed: usize,
}

enum SweepOutcome {
    Normal,
    Warned,
    Remediated,
    SkippedLocked,
}

pub struct SweepScheduler {
    store: Arc<dyn MarketStore>,
    lock: Arc<dyn OrderLock>,
    handler: RemediationHandler,
    warnings: Arc<dyn WarningStore>,
    notifier: Arc<dyn NotifyPort>,
    events: Arc<dyn TimeoutEventSink>,
    rules: Arc<TimeoutRules>,
    config: SweepConfig,
}

impl SweepScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn MarketStore>,
        lock: Arc<dyn OrderLock>,
        handler: RemediationHandler,
        warnings: Arc<dyn WarningStore>,
        notifier: Arc<dyn NotifyPort>,
        events: Arc<dyn TimeoutEventSink>,
        rules: Arc<TimeoutRules>,
        config: SweepConfig,
    ) -> Self {
        Self {
            store,
            lock,
            handler,
            warnings,
            notifier,
            events,
            rules,
            config,
        }
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// One full pass over the open orders.
    pub async fn run_sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let sweep_id = format!("sweep-{}", uuid::Uuid::new_v4());
        let mut report = SweepReport::default();
        let mut orders = match self.store.load_open_orders() {
            Ok(orders) => orders,
            Err(err) => {
                warn!(sweep_id = %sweep_id, error = %err, "failed to load open orders, skipping sweep");
                return report;
            }
        };
        orders.sort_by(|a, b| {
            b.kind()
                .priority()
                .cmp(&a.kind().priority())
                .then_with(|| a.created_at().cmp(&b.created_at()))
        });
        report.examined = orders.len();

        for order in orders {
            let order_no = order.order_no().to_string();
            match self.process_order(order.kind(), &order_no, now).await {
                Ok(SweepOutcome::Normal) => report.normal += 1,
                Ok(SweepOutcome::Warned) => report.warned += 1,
                Ok(SweepOutcome::Remediated) => report.remediated += 1,
                Ok(SweepOutcome::SkippedLocked) => report.skipped_locked += 1,
                Err(err) => {
                    warn!(sweep_id = %sweep_id, order_no = %order_no, error = %err, "order sweep failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            sweep_id = %sweep_id,
            examined = report.examined,
            normal = report.normal,
            warned = report.warned,
            remediated = report.remediated,
            skipped_locked = report.skipped_locked,
            failed = report.failed,
            "sweep complete"
        );
        report
    }

    async fn process_order(
        &self,
        kind: OrderKind,
        order_no: &str,
        now: DateTime<Utc>,
    ) -> Result<SweepOutcome, EngineError> {
        if !self
            .lock
            .try_lock(order_no, self.config.lock_wait, self.config.lock_lease)
            .await?
        {
            debug!(order_no = %order_no, "order locked elsewhere, skipping");
            return Ok(SweepOutcome::SkippedLocked);
        }
        let result = self.remediate_locked(kind, order_no, now).await;
        if let Err(err) = self.lock.unlock(order_no).await {
            warn!(order_no = %order_no, error = %err, "failed to release order lock");
        }
        result
    }

    async fn remediate_locked(
        &self,
        kind: OrderKind,
        order_no: &str,
        now: DateTime<Utc>,
    ) -> Result<SweepOutcome, EngineError> {
        // Re-read under the lock; the listing snapshot may be stale.
        let Some(mut order) = self.store.find_order(kind, order_no)? else {
            return Ok(SweepOutcome::Normal);
        };
        if !order.status().is_open() {
            return Ok(SweepOutcome::Normal);
        }

        let verdict = classify(order.as_ref(), &self.rules, now)?;
        if !verdict.is_actionable() {
            return Ok(SweepOutcome::Normal);
        }

        let mut unit = UnitOfWork::new(order_no);
        let outcome = self
            .handler
            .remediate(&mut unit, order.as_mut(), &verdict, now)?;
        let receipt = unit.commit(self.store.as_ref())?;
        self.deliver(receipt).await;

        Ok(match outcome {
            RemediationOutcome::Noop | RemediationOutcome::WarningSuppressed => SweepOutcome::Normal,
            RemediationOutcome::WarningSent => SweepOutcome::Warned,
            _ => SweepOutcome::Remediated,
        })
    }

    /// Deliver what a committed unit still owes. Push failures are
    /// logged and dropped; the committed state is already final.
    async fn deliver(&self, receipt: UnitReceipt) {
        for notice in &receipt.notices {
            if let Err(err) = self.notifier.notify(notice).await {
                warn!(error = %err, "notice delivery failed");
            }
        }
        for event in receipt.events {
            self.events.emit(event);
        }
    }

    /// Drop warning markers older than the retention window.
    pub fn purge_warnings(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.config.warning_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        match self.warnings.purge_expired(now, retention) {
            Ok(purged) => {
                if purged > 0 {
                    debug!(purged, "stale warning markers purged");
                }
                purged
            }
            Err(err) => {
                warn!(error = %err, "warning purge failed");
                0
            }
        }
    }

    /// Drive sweeps and purges until `shutdown` turns true or its
    /// sender goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut purge = tokio::time::interval(self.config.purge_interval);
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    self.run_sweep(Utc::now()).await;
                }
                _ = purge.tick() => {
                    self.purge_warnings(Utc::now());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("sweep scheduler stopping");
                        return;
                    }
                }
            }
        }
    }
}
