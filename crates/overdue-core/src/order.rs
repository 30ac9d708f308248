//! The `Timeoutable` capability trait and the state every order kind embeds.
//!
//! The sweep engine only ever sees `dyn Timeoutable`. Concrete kinds add
//! their own fields (tier, merchant, goods budget) and expose them to the
//! classifier through `as_any` downcasts, keeping remediation generic.

use std::any::Any;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{CourierId, OrderNo, UserId};
use crate::status::{OrderKind, OrderStatus, TimeoutState};

/// Capability surface required of any order the sweep can examine.
///
/// Getters and setters cover exactly the state remediation touches;
/// kind-specific fields stay on the concrete types. Implementations must
/// keep `kind()` fixed for the life of the value.
pub trait Timeoutable: fmt::Debug + Send + Sync {
    fn id(&self) -> i64;
    fn order_no(&self) -> &str;
    fn kind(&self) -> OrderKind;
    fn requester(&self) -> &str;
    fn courier(&self) -> Option<&str>;
    fn status(&self) -> OrderStatus;
    fn created_at(&self) -> DateTime<Utc>;
    fn expected_delivery_at(&self) -> Option<DateTime<Utc>>;
    fn delivered_at(&self) -> Option<DateTime<Utc>>;
    fn completed_at(&self) -> Option<DateTime<Utc>>;
    fn intervention_at(&self) -> Option<DateTime<Utc>>;
    fn timeout_state(&self) -> TimeoutState;
    fn timeout_count(&self) -> u32;
    fn warning_sent(&self) -> bool;
    fn cancel_reason(&self) -> Option<&str>;

    fn set_status(&mut self, status: OrderStatus);
    fn set_courier(&mut self, courier: Option<CourierId>);
    fn set_expected_delivery_at(&mut self, at: Option<DateTime<Utc>>);
    fn set_delivered_at(&mut self, at: Option<DateTime<Utc>>);
    fn set_completed_at(&mut self, at: Option<DateTime<Utc>>);
    fn set_intervention_at(&mut self, at: Option<DateTime<Utc>>);
    fn set_timeout_state(&mut self, state: TimeoutState);
    fn set_timeout_count(&mut self, count: u32);
    fn set_warning_sent(&mut self, sent: bool);
    fn set_cancel_reason(&mut self, reason: Option<String>);

    /// Downcast hook for kind-specific reads in the classifier.
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn boxed_clone(&self) -> Box<dyn Timeoutable>;
}

impl Clone for Box<dyn Timeoutable> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

/// State common to every order kind. Concrete types embed one of these
/// and delegate the `Timeoutable` accessors to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderCore {
    pub id: i64,
    pub order_no: OrderNo,
    pub requester: UserId,
    pub courier: Option<CourierId>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub expected_delivery_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub intervention_at: Option<DateTime<Utc>>,
    pub timeout_state: TimeoutState,
    pub timeout_count: u32,
    pub warning_sent: bool,
    pub cancel_reason: Option<String>,
}

impl OrderCore {
    pub fn new(
        id: i64,
        order_no: impl Into<OrderNo>,
        requester: impl Into<UserId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            order_no: order_no.into(),
            requester: requester.into(),
            courier: None,
            status: OrderStatus::Pending,
            created_at,
            expected_delivery_at: None,
            delivered_at: None,
            completed_at: None,
            intervention_at: None,
            timeout_state: TimeoutState::Normal,
            timeout_count: 0,
            warning_sent: false,
            cancel_reason: None,
        }
    }
}
