//! Abandoned-order snapshots.
//!
//! When an order runs out of chances it is snapshotted into a durable
//! abandoned record and the source row is closed as cancelled with a
//! readable reason. Snapshots are idempotent per order number: archiving
//! twice refreshes the record instead of duplicating it. Region and
//! time-band enrichment exists for reporting and is strictly best
//! effort; a failed lookup leaves the fields empty and never blocks the
//! archive.

use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use overdue_core::{
    ErrandOrder, GeoPoint, OrderKind, OrderNo, OrderStatus, PurchaseOrder, ShoppingOrder,
    Timeoutable,
};

use crate::error::EngineError;
use crate::ports::{Notice, NoticeCategory};
use crate::store::UnitOfWork;

/// Reason string appended to orders closed by the timeout engine.
pub const ABANDON_REASON: &str = "system-archived: excessive timeouts";

/// Coarse time-of-day bucket used by reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBand {
    EarlyMorning,
    Morning,
    Midday,
    Afternoon,
    Evening,
    Night,
}

impl TimeBand {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=8 => TimeBand::EarlyMorning,
            9..=11 => TimeBand::Morning,
            12..=13 => TimeBand::Midday,
            14..=17 => TimeBand::Afternoon,
            18..=22 => TimeBand::Evening,
            _ => TimeBand::Night,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeBand::EarlyMorning => "early_morning",
            TimeBand::Morning => "morning",
            TimeBand::Midday => "midday",
            TimeBand::Afternoon => "afternoon",
            TimeBand::Evening => "evening",
            TimeBand::Night => "night",
        }
    }
}

/// Durable record of an abandoned order. Created and refreshed only by
/// [`ArchiveService`]; consumers read it, nothing else writes it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AbandonedOrder {
    pub order_no: OrderNo,
    pub kind: OrderKind,
    pub requester: String,
    pub courier: Option<String>,
    pub pickup_address: Option<String>,
    pub dropoff_address: Option<String>,
    pub dropoff_point: Option<GeoPoint>,
    pub fee: Decimal,
    pub goods_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
    pub timeout_count: u32,
    pub reason: String,
    pub region: Option<String>,
    pub time_band: Option<TimeBand>,
}

impl AbandonedOrder {
    /// Denormalized copy of the order with enrichment fields unset.
    pub fn draft(order: &dyn Timeoutable, reason: &str, now: DateTime<Utc>) -> Self {
        let mut snapshot = Self {
            order_no: order.order_no().to_string(),
            kind: order.kind(),
            requester: order.requester().to_string(),
            courier: order.courier().map(str::to_string),
            pickup_address: None,
            dropoff_address: None,
            dropoff_point: None,
            fee: Decimal::ZERO,
            goods_amount: None,
            created_at: order.created_at(),
            archived_at: now,
            timeout_count: order.timeout_count(),
            reason: reason.to_string(),
            region: None,
            time_band: None,
        };
        match order.kind() {
            OrderKind::Errand => {
                if let Some(errand) = order.as_any().downcast_ref::<ErrandOrder>() {
                    snapshot.pickup_address = Some(errand.pickup.text.clone());
                    snapshot.dropoff_address = Some(errand.dropoff.text.clone());
                    snapshot.dropoff_point = errand.dropoff.point;
                    snapshot.fee = errand.fee;
                }
            }
            OrderKind::Shopping => {
                if let Some(shopping) = order.as_any().downcast_ref::<ShoppingOrder>() {
                    snapshot.pickup_address = Some(shopping.store_address.text.clone());
                    snapshot.dropoff_address = Some(shopping.dropoff.text.clone());
                    snapshot.dropoff_point = shopping.dropoff.point;
                    snapshot.fee = shopping.delivery_fee;
                    snapshot.goods_amount = Some(shopping.goods_amount);
                }
            }
            OrderKind::Purchase => {
                if let Some(purchase) = order.as_any().downcast_ref::<PurchaseOrder>() {
                    snapshot.pickup_address = Some(purchase.purchase_address.text.clone());
                    snapshot.dropoff_address = Some(purchase.dropoff.text.clone());
                    snapshot.dropoff_point = purchase.dropoff.point;
                    snapshot.fee = purchase.fee;
                    snapshot.goods_amount = Some(purchase.goods_budget);
                }
            }
        }
        snapshot
    }
}

/// Maps a coordinate to a named service region.
pub trait RegionLookup: Send + Sync {
    fn region_for(&self, point: GeoPoint) -> Result<Option<String>, EngineError>;
}

/// Lookup that knows no regions. Every snapshot stays unenriched.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRegionLookup;

impl RegionLookup for NoRegionLookup {
    fn region_for(&self, _point: GeoPoint) -> Result<Option<String>, EngineError> {
        Ok(None)
    }
}

/// Static table of circular service regions.
#[derive(Clone, Debug, Default)]
pub struct StaticRegionTable {
    regions: Vec<RegionCircle>,
}

#[derive(Clone, Debug)]
struct RegionCircle {
    name: String,
    center: GeoPoint,
    radius_km: f64,
}

impl StaticRegionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_region(mut self, name: impl Into<String>, center: GeoPoint, radius_km: f64) -> Self {
        self.regions.push(RegionCircle {
            name: name.into(),
            center,
            radius_km,
        });
        self
    }
}

impl RegionLookup for StaticRegionTable {
    fn region_for(&self, point: GeoPoint) -> Result<Option<String>, EngineError> {
        let mut best: Option<(&RegionCircle, f64)> = None;
        for region in &self.regions {
            let distance = haversine_km(region.center, point);
            if distance <= region.radius_km
                && best.map_or(true, |(_, best_distance)| distance < best_distance)
            {
                best = Some((region, distance));
            }
        }
        Ok(best.map(|(region, _)| region.name.clone()))
    }
}

fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Stages the abandoned snapshot and closes out the source order.
pub struct ArchiveService {
    regions: Arc<dyn RegionLookup>,
}

impl ArchiveService {
    pub fn new(regions: Arc<dyn RegionLookup>) -> Self {
        Self { regions }
    }

    pub fn without_regions() -> Self {
        Self::new(Arc::new(NoRegionLookup))
    }

    /// Snapshot `order` under `reason`, cancel the source row, and queue
    /// the requester's notice. Idempotence comes from the snapshot being
    /// an upsert on the order number.
    pub fn archive(
        &self,
        unit: &mut UnitOfWork,
        order: &mut dyn Timeoutable,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut snapshot = AbandonedOrder::draft(order, reason, now);
        if let Some(point) = snapshot.dropoff_point {
            match self.regions.region_for(point) {
                Ok(region) => snapshot.region = region,
                Err(err) => {
                    debug!(order_no = %snapshot.order_no, error = %err, "region lookup failed");
                }
            }
        }
        snapshot.time_band = Some(TimeBand::from_hour(now.hour()));
        unit.upsert_abandoned(snapshot);

        let combined = append_reason(order.cancel_reason(), reason);
        order.set_status(OrderStatus::Cancelled);
        order.set_cancel_reason(Some(combined));
        unit.save_order(order);

        unit.push_notice(Notice::to_requester(
            order.requester(),
            NoticeCategory::Archived,
            format!(
                "Order {} was closed after repeated timeouts. Our team has recorded it for review.",
                order.order_no()
            ),
        ));
        Ok(())
    }
}

fn append_reason(existing: Option<&str>, reason: &str) -> String {
    match existing {
        Some(previous) if !previous.is_empty() => format!("{previous}; {reason}"),
        _ => reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryMarketStore, MarketStore};
    use overdue_core::{Address, ErrandTier};
    use rust_decimal_macros::dec;

    struct FailingRegions;

    impl RegionLookup for FailingRegions {
        fn region_for(&self, _point: GeoPoint) -> Result<Option<String>, EngineError> {
            Err(EngineError::Archive("region service unreachable".to_string()))
        }
    }

    fn errand_with_point() -> ErrandOrder {
        ErrandOrder::new(
            1,
            "ER-1",
            "user-1",
            ErrandTier::Standard,
            Address::new("12 Dock St"),
            Address::new("4 Hill Rd").with_point(31.2304, 121.4737),
            dec!(8.00),
            Utc::now(),
        )
        .with_courier("courier-1")
        .with_timeout_count(8)
    }

    #[test]
    fn hours_map_to_bands() {
        assert_eq!(TimeBand::from_hour(6), TimeBand::EarlyMorning);
        assert_eq!(TimeBand::from_hour(10), TimeBand::Morning);
        assert_eq!(TimeBand::from_hour(12), TimeBand::Midday);
        assert_eq!(TimeBand::from_hour(16), TimeBand::Afternoon);
        assert_eq!(TimeBand::from_hour(21), TimeBand::Evening);
        assert_eq!(TimeBand::from_hour(2), TimeBand::Night);
        assert_eq!(TimeBand::from_hour(23), TimeBand::Night);
    }

    #[test]
    fn region_table_matches_points_inside_a_circle() {
        let table = StaticRegionTable::new()
            .with_region("downtown", GeoPoint::new(31.2304, 121.4737), 5.0)
            .with_region("airport", GeoPoint::new(31.1443, 121.8083), 8.0);

        let region = table
            .region_for(GeoPoint::new(31.2310, 121.4750))
            .unwrap();
        assert_eq!(region.as_deref(), Some("downtown"));

        let region = table.region_for(GeoPoint::new(30.0, 120.0)).unwrap();
        assert_eq!(region, None);
    }

    #[test]
    fn archive_snapshots_and_cancels_the_source_order() {
        let store = InMemoryMarketStore::new();
        let service = ArchiveService::new(Arc::new(
            StaticRegionTable::new().with_region("downtown", GeoPoint::new(31.2304, 121.4737), 5.0),
        ));
        let mut order = errand_with_point();
        store.put_errand(order.clone()).unwrap();

        let now = Utc::now();
        let mut unit = UnitOfWork::new("ER-1");
        service
            .archive(&mut unit, &mut order, ABANDON_REASON, now)
            .unwrap();
        let receipt = unit.commit(&store).unwrap();

        let snapshot = store.abandoned_order("ER-1").unwrap().unwrap();
        assert_eq!(snapshot.pickup_address.as_deref(), Some("12 Dock St"));
        assert_eq!(snapshot.dropoff_address.as_deref(), Some("4 Hill Rd"));
        assert_eq!(snapshot.fee, dec!(8.00));
        assert_eq!(snapshot.timeout_count, 8);
        assert_eq!(snapshot.region.as_deref(), Some("downtown"));
        assert!(snapshot.time_band.is_some());

        let stored = store.find_order(OrderKind::Errand, "ER-1").unwrap().unwrap();
        assert_eq!(stored.status(), OrderStatus::Cancelled);
        assert_eq!(stored.cancel_reason(), Some(ABANDON_REASON));

        assert_eq!(receipt.notices.len(), 1);
    }

    #[test]
    fn enrichment_failure_degrades_to_empty_fields() {
        let store = InMemoryMarketStore::new();
        let service = ArchiveService::new(Arc::new(FailingRegions));
        let mut order = errand_with_point();
        store.put_errand(order.clone()).unwrap();

        let mut unit = UnitOfWork::new("ER-1");
        service
            .archive(&mut unit, &mut order, ABANDON_REASON, Utc::now())
            .unwrap();
        unit.commit(&store).unwrap();

        let snapshot = store.abandoned_order("ER-1").unwrap().unwrap();
        assert_eq!(snapshot.region, None);
        assert!(snapshot.time_band.is_some());
    }

    #[test]
    fn cancel_reasons_append_instead_of_overwriting() {
        let service = ArchiveService::without_regions();
        let mut order = errand_with_point();
        order.set_cancel_reason(Some("courier reported damage".to_string()));

        let mut unit = UnitOfWork::new("ER-1");
        service
            .archive(&mut unit, &mut order, ABANDON_REASON, Utc::now())
            .unwrap();

        assert_eq!(
            order.cancel_reason(),
            Some("courier reported damage; system-archived: excessive timeouts")
        );
    }
}
