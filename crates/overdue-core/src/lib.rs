//! Domain model and pure timeout classification for marketplace orders.
//!
//! This crate owns everything the sweep engine can reason about without
//! I/O: the three concrete order kinds behind the [`Timeoutable`]
//! capability trait, the configured timeout rules, and the pure
//! classifier that turns an order plus a clock reading into a
//! [`TimeoutVerdict`]. Storage, locking, and remediation live in the
//! engine crate.

pub mod classify;
pub mod identity;
pub mod order;
pub mod orders;
pub mod rules;
pub mod status;

pub use classify::{classify, ClassifyError, TimeoutVerdict};
pub use identity::{Address, CourierId, GeoPoint, OrderNo, UserId};
pub use order::{OrderCore, Timeoutable};
pub use orders::{errand_tier, ErrandOrder, PurchaseOrder, ShoppingOrder};
pub use rules::{
    ArchiveThresholds, ExpressErrandRules, PurchaseRules, ShoppingRules, StandardErrandRules,
    TimeoutRules,
};
pub use status::{
    ConfirmationPolicy, ErrandTier, OrderKind, OrderStatus, TimeoutPhase, TimeoutState,
};
