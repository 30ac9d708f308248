//! Timeout budgets, archive thresholds, and remediation policy knobs.
//!
//! Rules are plain data. Deployments load them from a JSON document or
//! take the defaults, then apply targeted environment overrides for the
//! operational knobs. Everything is validated before the engine sees it.

use std::collections::HashMap;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::status::{ConfirmationPolicy, ErrandTier, OrderKind};

const ENV_THRESHOLD_ERRAND: &str = "OVERDUE_ARCHIVE_THRESHOLD_ERRAND";
const ENV_THRESHOLD_SHOPPING: &str = "OVERDUE_ARCHIVE_THRESHOLD_SHOPPING";
const ENV_THRESHOLD_PURCHASE: &str = "OVERDUE_ARCHIVE_THRESHOLD_PURCHASE";
const ENV_SUPPRESSION_MINUTES: &str = "OVERDUE_WARNING_SUPPRESSION_MIN";

/// Budgets for the standard errand tier. Standard orders get a fixed
/// grace period past the promised delivery time and no advance warnings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StandardErrandRules {
    pub pickup_minutes: i64,
    pub delivery_minutes: i64,
    pub delivery_grace_minutes: i64,
}

impl Default for StandardErrandRules {
    fn default() -> Self {
        Self {
            pickup_minutes: 30,
            delivery_minutes: 90,
            delivery_grace_minutes: 60,
        }
    }
}

/// Budgets for the express errand tier. Express orders warn once a
/// fraction of the budget is spent and time out with no grace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpressErrandRules {
    pub pickup_minutes: i64,
    pub delivery_minutes: i64,
    pub confirm_minutes: i64,
    /// Fraction of a budget after which a warning fires, exclusive 0..1.
    pub warn_fraction: f64,
}

impl Default for ExpressErrandRules {
    fn default() -> Self {
        Self {
            pickup_minutes: 20,
            delivery_minutes: 90,
            confirm_minutes: 120,
            warn_fraction: 0.8,
        }
    }
}

/// Budgets for merchant shopping orders. The pickup budget is derived as
/// half of `default_minutes`; delivery uses the promised time directly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShoppingRules {
    pub default_minutes: i64,
    pub confirm_minutes: i64,
}

impl Default for ShoppingRules {
    fn default() -> Self {
        Self {
            default_minutes: 60,
            confirm_minutes: 24 * 60,
        }
    }
}

/// Budgets for proxy purchase orders. The pickup budget is derived as a
/// third of `default_minutes`; the requester-chosen deadline applies
/// before assignment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurchaseRules {
    pub default_minutes: i64,
}

impl Default for PurchaseRules {
    fn default() -> Self {
        Self {
            default_minutes: 90,
        }
    }
}

/// Confirmed-timeout counts at which an order is archived as abandoned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveThresholds {
    pub errand: u32,
    pub shopping: u32,
    pub purchase: u32,
}

impl Default for ArchiveThresholds {
    fn default() -> Self {
        Self {
            errand: 8,
            shopping: 10,
            purchase: 5,
        }
    }
}

/// The full rule set the engine runs under.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutRules {
    pub errand_standard: StandardErrandRules,
    pub errand_express: ExpressErrandRules,
    pub shopping: ShoppingRules,
    pub purchase: PurchaseRules,
    pub archive_thresholds: ArchiveThresholds,
    pub warning_suppression_minutes: i64,
}

impl Default for TimeoutRules {
    fn default() -> Self {
        Self {
            errand_standard: StandardErrandRules::default(),
            errand_express: ExpressErrandRules::default(),
            shopping: ShoppingRules::default(),
            purchase: PurchaseRules::default(),
            archive_thresholds: ArchiveThresholds::default(),
            warning_suppression_minutes: 30,
        }
    }
}

impl TimeoutRules {
    /// Parse rules from a JSON document. Absent fields keep their
    /// defaults; the result is validated before it is returned.
    pub fn from_json_str(raw: &str) -> Result<Self, String> {
        let rules: Self =
            serde_json::from_str(raw).map_err(|e| format!("invalid timeout rules JSON: {e}"))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Defaults plus environment overrides for the operational knobs.
    pub fn from_env_map(env: &HashMap<String, String>) -> Result<Self, String> {
        let mut rules = Self::default();
        if let Some(raw) = env.get(ENV_THRESHOLD_ERRAND) {
            rules.archive_thresholds.errand = parse_env(ENV_THRESHOLD_ERRAND, raw)?;
        }
        if let Some(raw) = env.get(ENV_THRESHOLD_SHOPPING) {
            rules.archive_thresholds.shopping = parse_env(ENV_THRESHOLD_SHOPPING, raw)?;
        }
        if let Some(raw) = env.get(ENV_THRESHOLD_PURCHASE) {
            rules.archive_thresholds.purchase = parse_env(ENV_THRESHOLD_PURCHASE, raw)?;
        }
        if let Some(raw) = env.get(ENV_SUPPRESSION_MINUTES) {
            rules.warning_suppression_minutes = parse_env(ENV_SUPPRESSION_MINUTES, raw)?;
        }
        rules.validate()?;
        Ok(rules)
    }

    pub fn validate(&self) -> Result<(), String> {
        let budgets = [
            ("errand_standard.pickup_minutes", self.errand_standard.pickup_minutes),
            ("errand_standard.delivery_minutes", self.errand_standard.delivery_minutes),
            ("errand_express.pickup_minutes", self.errand_express.pickup_minutes),
            ("errand_express.delivery_minutes", self.errand_express.delivery_minutes),
            ("errand_express.confirm_minutes", self.errand_express.confirm_minutes),
            ("shopping.default_minutes", self.shopping.default_minutes),
            ("shopping.confirm_minutes", self.shopping.confirm_minutes),
            ("purchase.default_minutes", self.purchase.default_minutes),
        ];
        for (name, minutes) in budgets {
            if minutes < 1 {
                return Err(format!("{name} must be at least 1, got {minutes}"));
            }
        }
        if self.errand_standard.delivery_grace_minutes < 0 {
            return Err(format!(
                "errand_standard.delivery_grace_minutes must not be negative, got {}",
                self.errand_standard.delivery_grace_minutes
            ));
        }
        let fraction = self.errand_express.warn_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(format!(
                "errand_express.warn_fraction must be between 0 and 1 exclusive, got {fraction}"
            ));
        }
        let thresholds = [
            ("archive_thresholds.errand", self.archive_thresholds.errand),
            ("archive_thresholds.shopping", self.archive_thresholds.shopping),
            ("archive_thresholds.purchase", self.archive_thresholds.purchase),
        ];
        for (name, value) in thresholds {
            if value < 1 {
                return Err(format!("{name} must be at least 1"));
            }
        }
        if self.warning_suppression_minutes < 0 {
            return Err(format!(
                "warning_suppression_minutes must not be negative, got {}",
                self.warning_suppression_minutes
            ));
        }
        Ok(())
    }

    /// Confirmed-timeout count at which orders of `kind` are archived.
    pub fn archive_threshold(&self, kind: OrderKind) -> u32 {
        match kind {
            OrderKind::Errand => self.archive_thresholds.errand,
            OrderKind::Shopping => self.archive_thresholds.shopping,
            OrderKind::Purchase => self.archive_thresholds.purchase,
        }
    }

    /// Whether a delivery timeout escalates to platform intervention on
    /// the first strike instead of accumulating toward the threshold.
    pub fn escalates_immediately(&self, kind: OrderKind, tier: Option<ErrandTier>) -> bool {
        kind == OrderKind::Errand && tier == Some(ErrandTier::Express)
    }

    /// What to do when a delivered order is never confirmed.
    pub fn confirmation_policy(&self, kind: OrderKind) -> ConfirmationPolicy {
        match kind {
            OrderKind::Errand | OrderKind::Shopping => ConfirmationPolicy::AutoComplete,
            OrderKind::Purchase => ConfirmationPolicy::RequireReview,
        }
    }

    /// Minimum spacing between repeated warnings for one order status.
    pub fn suppression_window(&self) -> Duration {
        Duration::minutes(self.warning_suppression_minutes)
    }

    /// Delivery window promised to a requester when an order re-enters
    /// the pool after a pickup timeout.
    pub fn redelivery_window(&self, kind: OrderKind, tier: Option<ErrandTier>) -> Duration {
        let minutes = match (kind, tier) {
            (OrderKind::Errand, Some(ErrandTier::Express)) => self.errand_express.delivery_minutes,
            (OrderKind::Errand, _) => self.errand_standard.delivery_minutes,
            (OrderKind::Shopping, _) => self.shopping.default_minutes,
            (OrderKind::Purchase, _) => self.purchase.default_minutes,
        };
        Duration::minutes(minutes)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, String> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| format!("invalid value for {key}: {raw:?}"))
}
