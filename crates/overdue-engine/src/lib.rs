//! Timeout sweep engine: storage, locking, remediation, and the
//! scheduler loop.
//!
//! The engine wires the pure classifier from `overdue-core` into a
//! periodic sweep over every open order. Each overdue order is
//! remediated under a per-order lock, with all of its writes staged on
//! one [`UnitOfWork`] and committed atomically through the
//! [`MarketStore`]; notices and timeout events only leave the process
//! after the commit lands.

pub mod archive;
pub mod error;
pub mod lock;
pub mod ports;
pub mod remediation;
pub mod scheduler;
pub mod services;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_store;
pub mod store;
pub mod warning;

pub use archive::{
    AbandonedOrder, ArchiveService, NoRegionLookup, RegionLookup, StaticRegionTable, TimeBand,
    ABANDON_REASON,
};
pub use error::EngineError;
pub use lock::{InMemoryOrderLock, OrderLock};
pub use ports::{
    FeePort, FlatFeeSchedule, KindService, Notice, NoticeCategory, NotifyPort, Recipient,
    RecordingEventSink, RecordingNotifier, TimeoutEvent, TimeoutEventSink, TracingEventSink,
    TracingNotifier,
};
pub use remediation::{RemediationHandler, RemediationOutcome};
pub use scheduler::{SweepConfig, SweepReport, SweepScheduler};
pub use services::{standard_registry, ErrandService, PurchaseService, ShoppingService};
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_store::SqliteMarketStore;
pub use store::{
    FundsMove, InMemoryMarketStore, MarketStore, StagedWrite, UnitOfWork, UnitReceipt,
};
pub use warning::{InMemoryWarningStore, WarningRecord, WarningStore};
