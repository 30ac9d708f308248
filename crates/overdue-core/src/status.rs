//! Order kinds, lifecycle statuses, and the timeout state machine.

use serde::{Deserialize, Serialize};

/// The three order kinds the sweep understands.
///
/// Kinds carry a fixed sweep priority so that time-critical work is
/// examined first when a sweep walks the open set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    /// Courier pass-along delivery, standard or express tier.
    Errand,
    /// Merchant shopping order picked and delivered by a courier.
    Shopping,
    /// Proxy purchase carried out on the requester's behalf.
    Purchase,
}

impl OrderKind {
    /// Sweep priority. Higher is examined earlier.
    pub fn priority(self) -> u8 {
        match self {
            OrderKind::Errand => 3,
            OrderKind::Shopping => 2,
            OrderKind::Purchase => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderKind::Errand => "errand",
            OrderKind::Shopping => "shopping",
            OrderKind::Purchase => "purchase",
        }
    }
}

/// Service tier of an errand order. Express tiers run on tighter
/// budgets and warn before they time out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrandTier {
    Standard,
    Express,
}

/// Lifecycle status shared by every order kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created, not yet picked up. May or may not have a courier.
    Pending,
    /// A courier accepted the order but has not collected it.
    Assigned,
    /// Goods collected, delivery underway.
    InTransit,
    /// Delivered, awaiting requester confirmation.
    Delivered,
    /// Confirmed complete. Terminal.
    Completed,
    /// Cancelled, with a reason recorded. Terminal.
    Cancelled,
    /// Escalated to manual platform review. Parked until staff act.
    PlatformIntervention,
}

impl OrderStatus {
    /// Whether a sweep should examine an order in this status.
    pub fn is_open(self) -> bool {
        !matches!(
            self,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::PlatformIntervention
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Assigned => "assigned",
            OrderStatus::InTransit => "in_transit",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::PlatformIntervention => "platform_intervention",
        }
    }
}

/// The phase of an order's life a deadline belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPhase {
    Pickup,
    Delivery,
    Confirmation,
}

impl TimeoutPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeoutPhase::Pickup => "pickup",
            TimeoutPhase::Delivery => "delivery",
            TimeoutPhase::Confirmation => "confirmation",
        }
    }
}

/// Timeout standing recorded on an order row.
///
/// Warnings are advisory and precede the matching timeout. A timeout
/// state is only written once the deadline has actually passed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutState {
    Normal,
    PickupWarning,
    PickupTimeout,
    DeliveryWarning,
    DeliveryTimeout,
    ConfirmWarning,
    ConfirmTimeout,
}

impl TimeoutState {
    pub fn is_warning(self) -> bool {
        matches!(
            self,
            TimeoutState::PickupWarning | TimeoutState::DeliveryWarning | TimeoutState::ConfirmWarning
        )
    }

    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            TimeoutState::PickupTimeout | TimeoutState::DeliveryTimeout | TimeoutState::ConfirmTimeout
        )
    }

    /// The phase this state belongs to, `None` for `Normal`.
    pub fn phase(self) -> Option<TimeoutPhase> {
        match self {
            TimeoutState::Normal => None,
            TimeoutState::PickupWarning | TimeoutState::PickupTimeout => Some(TimeoutPhase::Pickup),
            TimeoutState::DeliveryWarning | TimeoutState::DeliveryTimeout => {
                Some(TimeoutPhase::Delivery)
            }
            TimeoutState::ConfirmWarning | TimeoutState::ConfirmTimeout => {
                Some(TimeoutPhase::Confirmation)
            }
        }
    }

    pub fn warning_for(phase: TimeoutPhase) -> Self {
        match phase {
            TimeoutPhase::Pickup => TimeoutState::PickupWarning,
            TimeoutPhase::Delivery => TimeoutState::DeliveryWarning,
            TimeoutPhase::Confirmation => TimeoutState::ConfirmWarning,
        }
    }

    pub fn timeout_for(phase: TimeoutPhase) -> Self {
        match phase {
            TimeoutPhase::Pickup => TimeoutState::PickupTimeout,
            TimeoutPhase::Delivery => TimeoutState::DeliveryTimeout,
            TimeoutPhase::Confirmation => TimeoutState::ConfirmTimeout,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeoutState::Normal => "normal",
            TimeoutState::PickupWarning => "pickup_warning",
            TimeoutState::PickupTimeout => "pickup_timeout",
            TimeoutState::DeliveryWarning => "delivery_warning",
            TimeoutState::DeliveryTimeout => "delivery_timeout",
            TimeoutState::ConfirmWarning => "confirm_warning",
            TimeoutState::ConfirmTimeout => "confirm_timeout",
        }
    }
}

/// What happens when a requester never confirms a delivered order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationPolicy {
    /// Settle the order as completed on the requester's behalf.
    AutoComplete,
    /// Park the order for manual review instead of settling funds.
    RequireReview,
}
