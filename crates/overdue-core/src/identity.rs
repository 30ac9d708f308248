//! Identity aliases and location primitives shared across order kinds.
//!
//! Orders are correlated by an opaque order number that is unique across
//! every kind; numeric row ids stay internal to storage and caches.

use serde::{Deserialize, Serialize};

/// Opaque order number, unique across all order kinds.
pub type OrderNo = String;

/// Account id of the courier working an order.
pub type CourierId = String;

/// Account id of the requester who placed an order.
pub type UserId = String;

/// WGS84 coordinate captured alongside an address when the client
/// supplied one.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Free-text address with an optional coordinate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub text: String,
    pub point: Option<GeoPoint>,
}

impl Address {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            point: None,
        }
    }

    pub fn with_point(mut self, lat: f64, lon: f64) -> Self {
        self.point = Some(GeoPoint::new(lat, lon));
        self
    }
}
