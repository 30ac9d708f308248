//! Concrete order kinds: errand, shopping, and purchase.
//!
//! Each type embeds an [`OrderCore`] and adds the fields its kind needs.
//! Delegation of the shared accessors is generated by `impl_order!` so the
//! three implementations cannot drift apart.

use std::any::Any;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::identity::{Address, CourierId, OrderNo, UserId};
use crate::order::{OrderCore, Timeoutable};
use crate::status::{ErrandTier, OrderKind, OrderStatus, TimeoutState};

macro_rules! impl_order {
    ($ty:ty, $kind:expr) => {
        impl Timeoutable for $ty {
            fn id(&self) -> i64 {
                self.core.id
            }
            fn order_no(&self) -> &str {
                &self.core.order_no
            }
            fn kind(&self) -> OrderKind {
                $kind
            }
            fn requester(&self) -> &str {
                &self.core.requester
            }
            fn courier(&self) -> Option<&str> {
                self.core.courier.as_deref()
            }
            fn status(&self) -> OrderStatus {
                self.core.status
            }
            fn created_at(&self) -> DateTime<Utc> {
                self.core.created_at
            }
            fn expected_delivery_at(&self) -> Option<DateTime<Utc>> {
                self.core.expected_delivery_at
            }
            fn delivered_at(&self) -> Option<DateTime<Utc>> {
                self.core.delivered_at
            }
            fn completed_at(&self) -> Option<DateTime<Utc>> {
                self.core.completed_at
            }
            fn intervention_at(&self) -> Option<DateTime<Utc>> {
                self.core.intervention_at
            }
            fn timeout_state(&self) -> TimeoutState {
                self.core.timeout_state
            }
            fn timeout_count(&self) -> u32 {
                self.core.timeout_count
            }
            fn warning_sent(&self) -> bool {
                self.core.warning_sent
            }
            fn cancel_reason(&self) -> Option<&str> {
                self.core.cancel_reason.as_deref()
            }

            fn set_status(&mut self, status: OrderStatus) {
                self.core.status = status;
            }
            fn set_courier(&mut self, courier: Option<CourierId>) {
                self.core.courier = courier;
            }
            fn set_expected_delivery_at(&mut self, at: Option<DateTime<Utc>>) {
                self.core.expected_delivery_at = at;
            }
            fn set_delivered_at(&mut self, at: Option<DateTime<Utc>>) {
                self.core.delivered_at = at;
            }
            fn set_completed_at(&mut self, at: Option<DateTime<Utc>>) {
                self.core.completed_at = at;
            }
            fn set_intervention_at(&mut self, at: Option<DateTime<Utc>>) {
                self.core.intervention_at = at;
            }
            fn set_timeout_state(&mut self, state: TimeoutState) {
                self.core.timeout_state = state;
            }
            fn set_timeout_count(&mut self, count: u32) {
                self.core.timeout_count = count;
            }
            fn set_warning_sent(&mut self, sent: bool) {
                self.core.warning_sent = sent;
            }
            fn set_cancel_reason(&mut self, reason: Option<String>) {
                self.core.cancel_reason = reason;
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
            fn boxed_clone(&self) -> Box<dyn Timeoutable> {
                Box::new(self.clone())
            }
        }

        impl $ty {
            pub fn with_courier(mut self, courier: impl Into<CourierId>) -> Self {
                self.core.courier = Some(courier.into());
                self
            }

            pub fn with_status(mut self, status: OrderStatus) -> Self {
                self.core.status = status;
                self
            }

            pub fn with_expected_delivery_at(mut self, at: DateTime<Utc>) -> Self {
                self.core.expected_delivery_at = Some(at);
                self
            }

            pub fn with_delivered_at(mut self, at: DateTime<Utc>) -> Self {
                self.core.delivered_at = Some(at);
                self
            }

            pub fn with_timeout_count(mut self, count: u32) -> Self {
                self.core.timeout_count = count;
                self
            }
        }
    };
}

/// Courier pass-along delivery. The express tier runs on tighter budgets
/// and receives advance warnings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrandOrder {
    pub core: OrderCore,
    pub tier: ErrandTier,
    pub pickup: Address,
    pub dropoff: Address,
    /// Courier fee agreed at creation.
    pub fee: Decimal,
}

impl ErrandOrder {
    pub fn new(
        id: i64,
        order_no: impl Into<OrderNo>,
        requester: impl Into<UserId>,
        tier: ErrandTier,
        pickup: Address,
        dropoff: Address,
        fee: Decimal,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            core: OrderCore::new(id, order_no, requester, created_at),
            tier,
            pickup,
            dropoff,
            fee,
        }
    }
}

impl_order!(ErrandOrder, OrderKind::Errand);

/// Merchant shopping order: a courier buys listed goods at a store and
/// delivers them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShoppingOrder {
    pub core: OrderCore,
    pub store_name: String,
    pub store_address: Address,
    pub dropoff: Address,
    /// Total price of the listed goods.
    pub goods_amount: Decimal,
    pub delivery_fee: Decimal,
}

impl ShoppingOrder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: i64,
        order_no: impl Into<OrderNo>,
        requester: impl Into<UserId>,
        store_name: impl Into<String>,
        store_address: Address,
        dropoff: Address,
        goods_amount: Decimal,
        delivery_fee: Decimal,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            core: OrderCore::new(id, order_no, requester, created_at),
            store_name: store_name.into(),
            store_address,
            dropoff,
            goods_amount,
            delivery_fee,
        }
    }
}

impl_order!(ShoppingOrder, OrderKind::Shopping);

/// Proxy purchase: a courier buys an unlisted item on the requester's
/// behalf, optionally against a requester-chosen deadline that applies
/// even before anyone accepts the order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    pub core: OrderCore,
    pub purchase_address: Address,
    pub dropoff: Address,
    /// Requester-chosen completion deadline, enforced pre-assignment.
    pub deadline: Option<DateTime<Utc>>,
    /// Advance the requester put up for the goods.
    pub goods_budget: Decimal,
    pub fee: Decimal,
}

impl PurchaseOrder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: i64,
        order_no: impl Into<OrderNo>,
        requester: impl Into<UserId>,
        purchase_address: Address,
        dropoff: Address,
        goods_budget: Decimal,
        fee: Decimal,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            core: OrderCore::new(id, order_no, requester, created_at),
            purchase_address,
            dropoff,
            deadline: None,
            goods_budget,
            fee,
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl_order!(PurchaseOrder, OrderKind::Purchase);

/// Tier of an errand order seen only through the trait, `None` for the
/// other kinds.
pub fn errand_tier(order: &dyn Timeoutable) -> Option<ErrandTier> {
    order
        .as_any()
        .downcast_ref::<ErrandOrder>()
        .map(|errand| errand.tier)
}
