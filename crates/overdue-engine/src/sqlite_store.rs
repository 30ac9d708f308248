//! SQLite-backed market store.
//!
//! Keeps the same shape as the in-memory store: three order tables, the
//! courier wallets, the funds journal, a single-row platform account,
//! and the abandoned snapshots. [`MarketStore::apply`] runs the whole
//! staged batch inside one transaction, so a penalty debit and the
//! status write it belongs to commit together or roll back together.
//!
//! Addresses travel as JSON text and money as decimal strings; both
//! round-trip exactly. Timestamps are stored as epoch milliseconds.

#![cfg(feature = "sqlite-persistence")]

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;

use overdue_core::{
    Address, ErrandOrder, ErrandTier, OrderCore, OrderKind, OrderStatus, PurchaseOrder,
    ShoppingOrder, TimeoutState, Timeoutable,
};

use crate::archive::{AbandonedOrder, TimeBand};
use crate::error::EngineError;
use crate::store::{downcast_owned, FundsMove, MarketStore, StagedWrite};

const CORE_COLS: &str = "id, order_no, requester, courier, status, created_at_ms, \
     expected_delivery_at_ms, delivered_at_ms, completed_at_ms, intervention_at_ms, \
     timeout_state, timeout_count, warning_sent, cancel_reason";

#[derive(Clone)]
pub struct SqliteMarketStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMarketStore {
    pub fn new(db_path: &str) -> Result<Self, EngineError> {
        let conn = Connection::open(db_path)
            .map_err(|e| EngineError::Store(format!("open market db: {}", e)))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Store over a private in-memory database. Each call opens a fresh
    /// one; used by tests and throwaway deployments.
    pub fn in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::Store(format!("open in-memory market db: {}", e)))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), EngineError> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS errand_orders (
              id INTEGER NOT NULL,
              order_no TEXT PRIMARY KEY,
              requester TEXT NOT NULL,
              courier TEXT NULL,
              status TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              expected_delivery_at_ms INTEGER NULL,
              delivered_at_ms INTEGER NULL,
              completed_at_ms INTEGER NULL,
              intervention_at_ms INTEGER NULL,
              timeout_state TEXT NOT NULL,
              timeout_count INTEGER NOT NULL,
              warning_sent INTEGER NOT NULL,
              cancel_reason TEXT NULL,
              tier TEXT NOT NULL,
              pickup_json TEXT NOT NULL,
              dropoff_json TEXT NOT NULL,
              fee TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS shopping_orders (
              id INTEGER NOT NULL,
              order_no TEXT PRIMARY KEY,
              requester TEXT NOT NULL,
              courier TEXT NULL,
              status TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              expected_delivery_at_ms INTEGER NULL,
              delivered_at_ms INTEGER NULL,
              completed_at_ms INTEGER NULL,
              intervention_at_ms INTEGER NULL,
              timeout_state TEXT NOT NULL,
              timeout_count INTEGER NOT NULL,
              warning_sent INTEGER NOT NULL,
              cancel_reason TEXT NULL,
              store_name TEXT NOT NULL,
              store_address_json TEXT NOT NULL,
              dropoff_json TEXT NOT NULL,
              goods_amount TEXT NOT NULL,
              delivery_fee TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS purchase_orders (
              id INTEGER NOT NULL,
              order_no TEXT PRIMARY KEY,
              requester TEXT NOT NULL,
              courier TEXT NULL,
              status TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              expected_delivery_at_ms INTEGER NULL,
              delivered_at_ms INTEGER NULL,
              completed_at_ms INTEGER NULL,
              intervention_at_ms INTEGER NULL,
              timeout_state TEXT NOT NULL,
              timeout_count INTEGER NOT NULL,
              warning_sent INTEGER NOT NULL,
              cancel_reason TEXT NULL,
              purchase_address_json TEXT NOT NULL,
              dropoff_json TEXT NOT NULL,
              deadline_ms INTEGER NULL,
              goods_budget TEXT NOT NULL,
              fee TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS courier_wallets (
              courier TEXT PRIMARY KEY,
              pending_balance TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS platform_account (
              id INTEGER PRIMARY KEY CHECK (id = 1),
              income TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS funds_journal (
              entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
              courier TEXT NOT NULL,
              amount TEXT NOT NULL,
              reason TEXT NOT NULL,
              at_ms INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS abandoned_orders (
              order_no TEXT PRIMARY KEY,
              kind TEXT NOT NULL,
              requester TEXT NOT NULL,
              courier TEXT NULL,
              pickup_address TEXT NULL,
              dropoff_address TEXT NULL,
              dropoff_point_json TEXT NULL,
              fee TEXT NOT NULL,
              goods_amount TEXT NULL,
              created_at_ms INTEGER NOT NULL,
              archived_at_ms INTEGER NOT NULL,
              timeout_count INTEGER NOT NULL,
              reason TEXT NOT NULL,
              region TEXT NULL,
              time_band TEXT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_errand_orders_status ON errand_orders(status);
            CREATE INDEX IF NOT EXISTS idx_shopping_orders_status ON shopping_orders(status);
            CREATE INDEX IF NOT EXISTS idx_purchase_orders_status ON purchase_orders(status);
            CREATE INDEX IF NOT EXISTS idx_funds_journal_courier ON funds_journal(courier, at_ms);
            "#,
        )
        .map_err(|e| EngineError::Store(format!("init market db schema: {}", e)))?;
        conn.execute(
            "INSERT OR IGNORE INTO platform_account (id, income) VALUES (1, '0')",
            [],
        )
        .map_err(|e| EngineError::Store(format!("seed platform account: {}", e)))?;
        Ok(())
    }

    pub fn put_errand(&self, order: ErrandOrder) -> Result<(), EngineError> {
        let conn = self.lock_conn()?;
        upsert_errand(&conn, &order)
    }

    pub fn put_shopping(&self, order: ShoppingOrder) -> Result<(), EngineError> {
        let conn = self.lock_conn()?;
        upsert_shopping(&conn, &order)
    }

    pub fn put_purchase(&self, order: PurchaseOrder) -> Result<(), EngineError> {
        let conn = self.lock_conn()?;
        upsert_purchase(&conn, &order)
    }

    pub fn set_pending_balance(
        &self,
        courier: impl Into<String>,
        amount: Decimal,
    ) -> Result<(), EngineError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO courier_wallets (courier, pending_balance) VALUES (?1, ?2)
             ON CONFLICT(courier) DO UPDATE SET pending_balance = excluded.pending_balance",
            params![courier.into(), amount.to_string()],
        )
        .map_err(|e| EngineError::Store(format!("set wallet balance: {}", e)))?;
        Ok(())
    }

    pub fn journal(&self) -> Result<Vec<FundsMove>, EngineError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT courier, amount, reason, at_ms FROM funds_journal ORDER BY entry_id ASC",
            )
            .map_err(|e| EngineError::Store(format!("prepare journal read: {}", e)))?;
        let mut rows = stmt
            .query([])
            .map_err(|e| EngineError::Store(format!("query journal read: {}", e)))?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().map_err(map_rusqlite_err)? {
            entries.push(FundsMove {
                courier: row.get(0).map_err(map_rusqlite_err)?,
                amount: parse_decimal(&row.get::<_, String>(1).map_err(map_rusqlite_err)?)?,
                reason: row.get(2).map_err(map_rusqlite_err)?,
                at: ms_to_dt(row.get::<_, i64>(3).map_err(map_rusqlite_err)?),
            });
        }
        Ok(entries)
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, EngineError> {
        self.conn
            .lock()
            .map_err(|_| EngineError::Store("market db lock poisoned".to_string()))
    }
}

impl MarketStore for SqliteMarketStore {
    fn load_open_orders(&self) -> Result<Vec<Box<dyn Timeoutable>>, EngineError> {
        let conn = self.lock_conn()?;
        let mut open: Vec<Box<dyn Timeoutable>> = Vec::new();
        for order in open_errands(&conn)? {
            open.push(Box::new(order));
        }
        for order in open_shopping(&conn)? {
            open.push(Box::new(order));
        }
        for order in open_purchases(&conn)? {
            open.push(Box::new(order));
        }
        Ok(open)
    }

    fn find_order(
        &self,
        kind: OrderKind,
        order_no: &str,
    ) -> Result<Option<Box<dyn Timeoutable>>, EngineError> {
        let conn = self.lock_conn()?;
        Ok(match kind {
            OrderKind::Errand => {
                find_errand(&conn, order_no)?.map(|o| Box::new(o) as Box<dyn Timeoutable>)
            }
            OrderKind::Shopping => {
                find_shopping(&conn, order_no)?.map(|o| Box::new(o) as Box<dyn Timeoutable>)
            }
            OrderKind::Purchase => {
                find_purchase(&conn, order_no)?.map(|o| Box::new(o) as Box<dyn Timeoutable>)
            }
        })
    }

    fn apply(&self, order_no: &str, writes: Vec<StagedWrite>) -> Result<(), EngineError> {
        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| EngineError::Store(format!("begin apply tx: {}", e)))?;
        for write in writes {
            match write {
                StagedWrite::SaveOrder(order) => {
                    if order.order_no() != order_no {
                        return Err(EngineError::Store(format!(
                            "unit of work for {order_no} staged a write for {}",
                            order.order_no()
                        )));
                    }
                    match order.kind() {
                        OrderKind::Errand => {
                            upsert_errand(&tx, &downcast_owned::<ErrandOrder>(&order)?)?
                        }
                        OrderKind::Shopping => {
                            upsert_shopping(&tx, &downcast_owned::<ShoppingOrder>(&order)?)?
                        }
                        OrderKind::Purchase => {
                            upsert_purchase(&tx, &downcast_owned::<PurchaseOrder>(&order)?)?
                        }
                    }
                }
                StagedWrite::DebitPending(movement) => apply_debit(&tx, &movement)?,
                StagedWrite::UpsertAbandoned(snapshot) => {
                    if snapshot.order_no != order_no {
                        return Err(EngineError::Store(format!(
                            "unit of work for {order_no} staged a snapshot for {}",
                            snapshot.order_no
                        )));
                    }
                    upsert_abandoned(&tx, &snapshot)?;
                }
            }
        }
        tx.commit()
            .map_err(|e| EngineError::Store(format!("commit apply tx: {}", e)))?;
        Ok(())
    }

    fn pending_balance(&self, courier: &str) -> Result<Decimal, EngineError> {
        let conn = self.lock_conn()?;
        Ok(wallet_balance(&conn, courier)?.unwrap_or(Decimal::ZERO))
    }

    fn platform_income(&self) -> Result<Decimal, EngineError> {
        let conn = self.lock_conn()?;
        platform_income_value(&conn)
    }

    fn abandoned_order(&self, order_no: &str) -> Result<Option<AbandonedOrder>, EngineError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT order_no, kind, requester, courier, pickup_address, dropoff_address, \
                 dropoff_point_json, fee, goods_amount, created_at_ms, archived_at_ms, \
                 timeout_count, reason, region, time_band
                 FROM abandoned_orders WHERE order_no = ?1",
            )
            .map_err(|e| EngineError::Store(format!("prepare abandoned read: {}", e)))?;
        let mut rows = stmt
            .query(params![order_no])
            .map_err(|e| EngineError::Store(format!("query abandoned read: {}", e)))?;
        if let Some(row) = rows.next().map_err(map_rusqlite_err)? {
            Ok(Some(abandoned_from_row(row)?))
        } else {
            Ok(None)
        }
    }
}

fn open_errands(conn: &Connection) -> Result<Vec<ErrandOrder>, EngineError> {
    let sql = format!(
        "SELECT {CORE_COLS}, tier, pickup_json, dropoff_json, fee FROM errand_orders
         WHERE status NOT IN ('completed', 'cancelled', 'platform_intervention')"
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| EngineError::Store(format!("prepare open errands: {}", e)))?;
    let mut rows = stmt
        .query([])
        .map_err(|e| EngineError::Store(format!("query open errands: {}", e)))?;
    let mut orders = Vec::new();
    while let Some(row) = rows.next().map_err(map_rusqlite_err)? {
        orders.push(errand_from_row(row)?);
    }
    Ok(orders)
}

fn open_shopping(conn: &Connection) -> Result<Vec<ShoppingOrder>, EngineError> {
    let sql = format!(
        "SELECT {CORE_COLS}, store_name, store_address_json, dropoff_json, goods_amount, \
         delivery_fee FROM shopping_orders
         WHERE status NOT IN ('completed', 'cancelled', 'platform_intervention')"
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| EngineError::Store(format!("prepare open shopping: {}", e)))?;
    let mut rows = stmt
        .query([])
        .map_err(|e| EngineError::Store(format!("query open shopping: {}", e)))?;
    let mut orders = Vec::new();
    while let Some(row) = rows.next().map_err(map_rusqlite_err)? {
        orders.push(shopping_from_row(row)?);
    }
    Ok(orders)
}

fn open_purchases(conn: &Connection) -> Result<Vec<PurchaseOrder>, EngineError> {
    let sql = format!(
        "SELECT {CORE_COLS}, purchase_address_json, dropoff_json, deadline_ms, goods_budget, \
         fee FROM purchase_orders
         WHERE status NOT IN ('completed', 'cancelled', 'platform_intervention')"
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| EngineError::Store(format!("prepare open purchases: {}", e)))?;
    let mut rows = stmt
        .query([])
        .map_err(|e| EngineError::Store(format!("query open purchases: {}", e)))?;
    let mut orders = Vec::new();
    while let Some(row) = rows.next().map_err(map_rusqlite_err)? {
        orders.push(purchase_from_row(row)?);
    }
    Ok(orders)
}

fn find_errand(conn: &Connection, order_no: &str) -> Result<Option<ErrandOrder>, EngineError> {
    let sql = format!(
        "SELECT {CORE_COLS}, tier, pickup_json, dropoff_json, fee FROM errand_orders
         WHERE order_no = ?1"
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| EngineError::Store(format!("prepare find errand: {}", e)))?;
    let mut rows = stmt
        .query(params![order_no])
        .map_err(|e| EngineError::Store(format!("query find errand: {}", e)))?;
    if let Some(row) = rows.next().map_err(map_rusqlite_err)? {
        Ok(Some(errand_from_row(row)?))
    } else {
        Ok(None)
    }
}

fn find_shopping(conn: &Connection, order_no: &str) -> Result<Option<ShoppingOrder>, EngineError> {
    let sql = format!(
        "SELECT {CORE_COLS}, store_name, store_address_json, dropoff_json, goods_amount, \
         delivery_fee FROM shopping_orders WHERE order_no = ?1"
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| EngineError::Store(format!("prepare find shopping: {}", e)))?;
    let mut rows = stmt
        .query(params![order_no])
        .map_err(|e| EngineError::Store(format!("query find shopping: {}", e)))?;
    if let Some(row) = rows.next().map_err(map_rusqlite_err)? {
        Ok(Some(shopping_from_row(row)?))
    } else {
        Ok(None)
    }
}

fn find_purchase(conn: &Connection, order_no: &str) -> Result<Option<PurchaseOrder>, EngineError> {
    let sql = format!(
        "SELECT {CORE_COLS}, purchase_address_json, dropoff_json, deadline_ms, goods_budget, \
         fee FROM purchase_orders WHERE order_no = ?1"
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| EngineError::Store(format!("prepare find purchase: {}", e)))?;
    let mut rows = stmt
        .query(params![order_no])
        .map_err(|e| EngineError::Store(format!("query find purchase: {}", e)))?;
    if let Some(row) = rows.next().map_err(map_rusqlite_err)? {
        Ok(Some(purchase_from_row(row)?))
    } else {
        Ok(None)
    }
}

fn upsert_errand(conn: &Connection, order: &ErrandOrder) -> Result<(), EngineError> {
    let pickup_json = address_json(&order.pickup)?;
    let dropoff_json = address_json(&order.dropoff)?;
    conn.execute(
        "INSERT INTO errand_orders
         (id, order_no, requester, courier, status, created_at_ms, expected_delivery_at_ms,
          delivered_at_ms, completed_at_ms, intervention_at_ms, timeout_state, timeout_count,
          warning_sent, cancel_reason, tier, pickup_json, dropoff_json, fee)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
         ON CONFLICT(order_no) DO UPDATE SET
           courier = excluded.courier,
           status = excluded.status,
           expected_delivery_at_ms = excluded.expected_delivery_at_ms,
           delivered_at_ms = excluded.delivered_at_ms,
           completed_at_ms = excluded.completed_at_ms,
           intervention_at_ms = excluded.intervention_at_ms,
           timeout_state = excluded.timeout_state,
           timeout_count = excluded.timeout_count,
           warning_sent = excluded.warning_sent,
           cancel_reason = excluded.cancel_reason,
           tier = excluded.tier,
           pickup_json = excluded.pickup_json,
           dropoff_json = excluded.dropoff_json,
           fee = excluded.fee",
        params![
            order.core.id,
            order.core.order_no,
            order.core.requester,
            order.core.courier,
            order.core.status.as_str(),
            dt_to_ms(order.core.created_at),
            order.core.expected_delivery_at.map(dt_to_ms),
            order.core.delivered_at.map(dt_to_ms),
            order.core.completed_at.map(dt_to_ms),
            order.core.intervention_at.map(dt_to_ms),
            order.core.timeout_state.as_str(),
            order.core.timeout_count as i64,
            order.core.warning_sent,
            order.core.cancel_reason,
            tier_to_str(order.tier),
            pickup_json,
            dropoff_json,
            order.fee.to_string(),
        ],
    )
    .map_err(|e| EngineError::Store(format!("upsert errand order: {}", e)))?;
    Ok(())
}

fn upsert_shopping(conn: &Connection, order: &ShoppingOrder) -> Result<(), EngineError> {
    let store_address_json = address_json(&order.store_address)?;
    let dropoff_json = address_json(&order.dropoff)?;
    conn.execute(
        "INSERT INTO shopping_orders
         (id, order_no, requester, courier, status, created_at_ms, expected_delivery_at_ms,
          delivered_at_ms, completed_at_ms, intervention_at_ms, timeout_state, timeout_count,
          warning_sent, cancel_reason, store_name, store_address_json, dropoff_json,
          goods_amount, delivery_fee)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                 ?18, ?19)
         ON CONFLICT(order_no) DO UPDATE SET
           courier = excluded.courier,
           status = excluded.status,
           expected_delivery_at_ms = excluded.expected_delivery_at_ms,
           delivered_at_ms = excluded.delivered_at_ms,
           completed_at_ms = excluded.completed_at_ms,
           intervention_at_ms = excluded.intervention_at_ms,
           timeout_state = excluded.timeout_state,
           timeout_count = excluded.timeout_count,
           warning_sent = excluded.warning_sent,
           cancel_reason = excluded.cancel_reason,
           store_name = excluded.store_name,
           store_address_json = excluded.store_address_json,
           dropoff_json = excluded.dropoff_json,
           goods_amount = excluded.goods_amount,
           delivery_fee = excluded.delivery_fee",
        params![
            order.core.id,
            order.core.order_no,
            order.core.requester,
            order.core.courier,
            order.core.status.as_str(),
            dt_to_ms(order.core.created_at),
            order.core.expected_delivery_at.map(dt_to_ms),
            order.core.delivered_at.map(dt_to_ms),
            order.core.completed_at.map(dt_to_ms),
            order.core.intervention_at.map(dt_to_ms),
            order.core.timeout_state.as_str(),
            order.core.timeout_count as i64,
            order.core.warning_sent,
            order.core.cancel_reason,
            order.store_name,
            store_address_json,
            dropoff_json,
            order.goods_amount.to_string(),
            order.delivery_fee.to_string(),
        ],
    )
    .map_err(|e| EngineError::Store(format!("upsert shopping order: {}", e)))?;
    Ok(())
}

fn upsert_purchase(conn: &Connection, order: &PurchaseOrder) -> Result<(), EngineError> {
    let purchase_address_json = address_json(&order.purchase_address)?;
    let dropoff_json = address_json(&order.dropoff)?;
    conn.execute(
        "INSERT INTO purchase_orders
         (id, order_no, requester, courier, status, created_at_ms, expected_delivery_at_ms,
          delivered_at_ms, completed_at_ms, intervention_at_ms, timeout_state, timeout_count,
          warning_sent, cancel_reason, purchase_address_json, dropoff_json, deadline_ms,
          goods_budget, fee)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                 ?18, ?19)
         ON CONFLICT(order_no) DO UPDATE SET
           courier = excluded.courier,
           status = excluded.status,
           expected_delivery_at_ms = excluded.expected_delivery_at_ms,
           delivered_at_ms = excluded.delivered_at_ms,
           completed_at_ms = excluded.completed_at_ms,
           intervention_at_ms = excluded.intervention_at_ms,
           timeout_state = excluded.timeout_state,
           timeout_count = excluded.timeout_count,
           warning_sent = excluded.warning_sent,
           cancel_reason = excluded.cancel_reason,
           purchase_address_json = excluded.purchase_address_json,
           dropoff_json = excluded.dropoff_json,
           deadline_ms = excluded.deadline_ms,
           goods_budget = excluded.goods_budget,
           fee = excluded.fee",
        params![
            order.core.id,
            order.core.order_no,
            order.core.requester,
            order.core.courier,
            order.core.status.as_str(),
            dt_to_ms(order.core.created_at),
            order.core.expected_delivery_at.map(dt_to_ms),
            order.core.delivered_at.map(dt_to_ms),
            order.core.completed_at.map(dt_to_ms),
            order.core.intervention_at.map(dt_to_ms),
            order.core.timeout_state.as_str(),
            order.core.timeout_count as i64,
            order.core.warning_sent,
            order.core.cancel_reason,
            purchase_address_json,
            dropoff_json,
            order.deadline.map(dt_to_ms),
            order.goods_budget.to_string(),
            order.fee.to_string(),
        ],
    )
    .map_err(|e| EngineError::Store(format!("upsert purchase order: {}", e)))?;
    Ok(())
}

fn apply_debit(conn: &Connection, movement: &FundsMove) -> Result<(), EngineError> {
    let balance =
        wallet_balance(conn, &movement.courier)?.unwrap_or(Decimal::ZERO) - movement.amount;
    conn.execute(
        "INSERT INTO courier_wallets (courier, pending_balance) VALUES (?1, ?2)
         ON CONFLICT(courier) DO UPDATE SET pending_balance = excluded.pending_balance",
        params![movement.courier, balance.to_string()],
    )
    .map_err(|e| EngineError::Store(format!("debit wallet: {}", e)))?;
    let income = platform_income_value(conn)? + movement.amount;
    conn.execute(
        "UPDATE platform_account SET income = ?1 WHERE id = 1",
        params![income.to_string()],
    )
    .map_err(|e| EngineError::Store(format!("credit platform income: {}", e)))?;
    conn.execute(
        "INSERT INTO funds_journal (courier, amount, reason, at_ms) VALUES (?1, ?2, ?3, ?4)",
        params![
            movement.courier,
            movement.amount.to_string(),
            movement.reason,
            dt_to_ms(movement.at)
        ],
    )
    .map_err(|e| EngineError::Store(format!("append funds journal: {}", e)))?;
    Ok(())
}

fn upsert_abandoned(conn: &Connection, snapshot: &AbandonedOrder) -> Result<(), EngineError> {
    let dropoff_point_json = snapshot
        .dropoff_point
        .map(|point| serde_json::to_string(&point))
        .transpose()?;
    conn.execute(
        "INSERT INTO abandoned_orders
         (order_no, kind, requester, courier, pickup_address, dropoff_address,
          dropoff_point_json, fee, goods_amount, created_at_ms, archived_at_ms, timeout_count,
          reason, region, time_band)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(order_no) DO UPDATE SET
           kind = excluded.kind,
           requester = excluded.requester,
           courier = excluded.courier,
           pickup_address = excluded.pickup_address,
           dropoff_address = excluded.dropoff_address,
           dropoff_point_json = excluded.dropoff_point_json,
           fee = excluded.fee,
           goods_amount = excluded.goods_amount,
           created_at_ms = excluded.created_at_ms,
           archived_at_ms = excluded.archived_at_ms,
           timeout_count = excluded.timeout_count,
           reason = excluded.reason,
           region = excluded.region,
           time_band = excluded.time_band",
        params![
            snapshot.order_no,
            snapshot.kind.as_str(),
            snapshot.requester,
            snapshot.courier,
            snapshot.pickup_address,
            snapshot.dropoff_address,
            dropoff_point_json,
            snapshot.fee.to_string(),
            snapshot.goods_amount.map(|amount| amount.to_string()),
            dt_to_ms(snapshot.created_at),
            dt_to_ms(snapshot.archived_at),
            snapshot.timeout_count as i64,
            snapshot.reason,
            snapshot.region,
            snapshot.time_band.map(TimeBand::as_str),
        ],
    )
    .map_err(|e| EngineError::Store(format!("upsert abandoned order: {}", e)))?;
    Ok(())
}

fn wallet_balance(conn: &Connection, courier: &str) -> Result<Option<Decimal>, EngineError> {
    let mut stmt = conn
        .prepare("SELECT pending_balance FROM courier_wallets WHERE courier = ?1")
        .map_err(|e| EngineError::Store(format!("prepare wallet read: {}", e)))?;
    let mut rows = stmt
        .query(params![courier])
        .map_err(|e| EngineError::Store(format!("query wallet read: {}", e)))?;
    if let Some(row) = rows.next().map_err(map_rusqlite_err)? {
        let raw: String = row.get(0).map_err(map_rusqlite_err)?;
        Ok(Some(parse_decimal(&raw)?))
    } else {
        Ok(None)
    }
}

fn platform_income_value(conn: &Connection) -> Result<Decimal, EngineError> {
    let raw: String = conn
        .query_row("SELECT income FROM platform_account WHERE id = 1", [], |r| {
            r.get(0)
        })
        .map_err(|e| EngineError::Store(format!("read platform income: {}", e)))?;
    parse_decimal(&raw)
}

fn core_from_row(row: &rusqlite::Row<'_>) -> Result<OrderCore, EngineError> {
    Ok(OrderCore {
        id: row.get(0).map_err(map_rusqlite_err)?,
        order_no: row.get(1).map_err(map_rusqlite_err)?,
        requester: row.get(2).map_err(map_rusqlite_err)?,
        courier: row.get(3).map_err(map_rusqlite_err)?,
        status: parse_status(&row.get::<_, String>(4).map_err(map_rusqlite_err)?),
        created_at: ms_to_dt(row.get::<_, i64>(5).map_err(map_rusqlite_err)?),
        expected_delivery_at: row
            .get::<_, Option<i64>>(6)
            .map_err(map_rusqlite_err)?
            .map(ms_to_dt),
        delivered_at: row
            .get::<_, Option<i64>>(7)
            .map_err(map_rusqlite_err)?
            .map(ms_to_dt),
        completed_at: row
            .get::<_, Option<i64>>(8)
            .map_err(map_rusqlite_err)?
            .map(ms_to_dt),
        intervention_at: row
            .get::<_, Option<i64>>(9)
            .map_err(map_rusqlite_err)?
            .map(ms_to_dt),
        timeout_state: parse_state(&row.get::<_, String>(10).map_err(map_rusqlite_err)?),
        timeout_count: row.get::<_, i64>(11).map_err(map_rusqlite_err)? as u32,
        warning_sent: row.get(12).map_err(map_rusqlite_err)?,
        cancel_reason: row.get(13).map_err(map_rusqlite_err)?,
    })
}

fn errand_from_row(row: &rusqlite::Row<'_>) -> Result<ErrandOrder, EngineError> {
    Ok(ErrandOrder {
        core: core_from_row(row)?,
        tier: parse_tier(&row.get::<_, String>(14).map_err(map_rusqlite_err)?),
        pickup: address_from_json(&row.get::<_, String>(15).map_err(map_rusqlite_err)?)?,
        dropoff: address_from_json(&row.get::<_, String>(16).map_err(map_rusqlite_err)?)?,
        fee: parse_decimal(&row.get::<_, String>(17).map_err(map_rusqlite_err)?)?,
    })
}

fn shopping_from_row(row: &rusqlite::Row<'_>) -> Result<ShoppingOrder, EngineError> {
    Ok(ShoppingOrder {
        core: core_from_row(row)?,
        store_name: row.get(14).map_err(map_rusqlite_err)?,
        store_address: address_from_json(&row.get::<_, String>(15).map_err(map_rusqlite_err)?)?,
        dropoff: address_from_json(&row.get::<_, String>(16).map_err(map_rusqlite_err)?)?,
        goods_amount: parse_decimal(&row.get::<_, String>(17).map_err(map_rusqlite_err)?)?,
        delivery_fee: parse_decimal(&row.get::<_, String>(18).map_err(map_rusqlite_err)?)?,
    })
}

fn purchase_from_row(row: &rusqlite::Row<'_>) -> Result<PurchaseOrder, EngineError> {
    Ok(PurchaseOrder {
        core: core_from_row(row)?,
        purchase_address: address_from_json(&row.get::<_, String>(14).map_err(map_rusqlite_err)?)?,
        dropoff: address_from_json(&row.get::<_, String>(15).map_err(map_rusqlite_err)?)?,
        deadline: row
            .get::<_, Option<i64>>(16)
            .map_err(map_rusqlite_err)?
            .map(ms_to_dt),
        goods_budget: parse_decimal(&row.get::<_, String>(17).map_err(map_rusqlite_err)?)?,
        fee: parse_decimal(&row.get::<_, String>(18).map_err(map_rusqlite_err)?)?,
    })
}

fn abandoned_from_row(row: &rusqlite::Row<'_>) -> Result<AbandonedOrder, EngineError> {
    let dropoff_point_json: Option<String> = row.get(6).map_err(map_rusqlite_err)?;
    let dropoff_point = match dropoff_point_json {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };
    let goods_amount: Option<String> = row.get(8).map_err(map_rusqlite_err)?;
    let goods_amount = match goods_amount {
        Some(raw) => Some(parse_decimal(&raw)?),
        None => None,
    };
    Ok(AbandonedOrder {
        order_no: row.get(0).map_err(map_rusqlite_err)?,
        kind: parse_kind(&row.get::<_, String>(1).map_err(map_rusqlite_err)?),
        requester: row.get(2).map_err(map_rusqlite_err)?,
        courier: row.get(3).map_err(map_rusqlite_err)?,
        pickup_address: row.get(4).map_err(map_rusqlite_err)?,
        dropoff_address: row.get(5).map_err(map_rusqlite_err)?,
        dropoff_point,
        fee: parse_decimal(&row.get::<_, String>(7).map_err(map_rusqlite_err)?)?,
        goods_amount,
        created_at: ms_to_dt(row.get::<_, i64>(9).map_err(map_rusqlite_err)?),
        archived_at: ms_to_dt(row.get::<_, i64>(10).map_err(map_rusqlite_err)?),
        timeout_count: row.get::<_, i64>(11).map_err(map_rusqlite_err)? as u32,
        reason: row.get(12).map_err(map_rusqlite_err)?,
        region: row.get(13).map_err(map_rusqlite_err)?,
        time_band: row
            .get::<_, Option<String>>(14)
            .map_err(map_rusqlite_err)?
            .and_then(|raw| parse_band(&raw)),
    })
}

fn address_json(address: &Address) -> Result<String, EngineError> {
    Ok(serde_json::to_string(address)?)
}

fn address_from_json(raw: &str) -> Result<Address, EngineError> {
    Ok(serde_json::from_str(raw)?)
}

fn parse_decimal(raw: &str) -> Result<Decimal, EngineError> {
    raw.parse::<Decimal>()
        .map_err(|e| EngineError::Store(format!("parse stored decimal '{}': {}", raw, e)))
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

fn tier_to_str(tier: ErrandTier) -> &'static str {
    match tier {
        ErrandTier::Standard => "standard",
        ErrandTier::Express => "express",
    }
}

fn parse_tier(value: &str) -> ErrandTier {
    match value {
        "express" => ErrandTier::Express,
        _ => ErrandTier::Standard,
    }
}

fn parse_status(value: &str) -> OrderStatus {
    match value {
        "assigned" => OrderStatus::Assigned,
        "in_transit" => OrderStatus::InTransit,
        "delivered" => OrderStatus::Delivered,
        "completed" => OrderStatus::Completed,
        "cancelled" => OrderStatus::Cancelled,
        "platform_intervention" => OrderStatus::PlatformIntervention,
        _ => OrderStatus::Pending,
    }
}

fn parse_state(value: &str) -> TimeoutState {
    match value {
        "pickup_warning" => TimeoutState::PickupWarning,
        "pickup_timeout" => TimeoutState::PickupTimeout,
        "delivery_warning" => TimeoutState::DeliveryWarning,
        "delivery_timeout" => TimeoutState::DeliveryTimeout,
        "confirm_warning" => TimeoutState::ConfirmWarning,
        "confirm_timeout" => TimeoutState::ConfirmTimeout,
        _ => TimeoutState::Normal,
    }
}

fn parse_kind(value: &str) -> OrderKind {
    match value {
        "shopping" => OrderKind::Shopping,
        "purchase" => OrderKind::Purchase,
        _ => OrderKind::Errand,
    }
}

fn parse_band(value: &str) -> Option<TimeBand> {
    match value {
        "early_morning" => Some(TimeBand::EarlyMorning),
        "morning" => Some(TimeBand::Morning),
        "midday" => Some(TimeBand::Midday),
        "afternoon" => Some(TimeBand::Afternoon),
        "evening" => Some(TimeBand::Evening),
        "night" => Some(TimeBand::Night),
        _ => None,
    }
}

fn map_rusqlite_err(err: rusqlite::Error) -> EngineError {
    EngineError::Store(format!("market db: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap()
    }

    fn sample_errand() -> ErrandOrder {
        ErrandOrder::new(
            11,
            "ER-1001",
            "user-1",
            ErrandTier::Express,
            Address::new("12 Dock St"),
            Address::new("4 Hill Rd").with_point(31.2304, 121.4737),
            dec!(8.50),
            t0(),
        )
        .with_courier("courier-1")
        .with_status(OrderStatus::InTransit)
        .with_expected_delivery_at(t0() + Duration::minutes(90))
    }

    #[test]
    fn errand_orders_round_trip() {
        let store = SqliteMarketStore::in_memory().unwrap();
        let order = sample_errand().with_timeout_count(2);
        store.put_errand(order.clone()).unwrap();

        let found = store.find_order(OrderKind::Errand, "ER-1001").unwrap().unwrap();
        let stored = found
            .as_any()
            .downcast_ref::<ErrandOrder>()
            .expect("errand downcast");
        assert_eq!(*stored, order);
    }

    #[test]
    fn purchase_deadline_and_nulls_round_trip() {
        let store = SqliteMarketStore::in_memory().unwrap();
        let order = PurchaseOrder::new(
            12,
            "PU-3001",
            "user-2",
            Address::new("77 Mall Way"),
            Address::new("4 Hill Rd"),
            dec!(120.00),
            dec!(10.00),
            t0(),
        )
        .with_deadline(t0() + Duration::hours(4));
        store.put_purchase(order.clone()).unwrap();

        let found = store.find_order(OrderKind::Purchase, "PU-3001").unwrap().unwrap();
        let stored = found
            .as_any()
            .downcast_ref::<PurchaseOrder>()
            .expect("purchase downcast");
        assert_eq!(*stored, order);
        assert!(stored.core.courier.is_none());
        assert!(stored.core.delivered_at.is_none());
    }

    #[test]
    fn open_orders_exclude_closed_statuses() {
        let store = SqliteMarketStore::in_memory().unwrap();
        store
            .put_errand(sample_errand().with_status(OrderStatus::Completed))
            .unwrap();
        store
            .put_shopping(ShoppingOrder::new(
                13,
                "SH-2001",
                "user-3",
                "Corner Mart",
                Address::new("9 Market Sq"),
                Address::new("4 Hill Rd"),
                dec!(42.00),
                dec!(5.00),
                t0(),
            ))
            .unwrap();
        store
            .put_purchase(
                PurchaseOrder::new(
                    14,
                    "PU-3002",
                    "user-4",
                    Address::new("77 Mall Way"),
                    Address::new("4 Hill Rd"),
                    dec!(60.00),
                    dec!(6.00),
                    t0(),
                )
                .with_status(OrderStatus::PlatformIntervention),
            )
            .unwrap();

        let open = store.load_open_orders().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].order_no(), "SH-2001");
    }

    #[test]
    fn apply_commits_order_debit_and_snapshot_together() {
        let store = SqliteMarketStore::in_memory().unwrap();
        let order = sample_errand();
        store.put_errand(order.clone()).unwrap();
        store.set_pending_balance("courier-1", dec!(20.00)).unwrap();

        let mut updated = order.clone();
        updated.set_status(OrderStatus::Cancelled);
        updated.set_timeout_count(8);
        let snapshot = AbandonedOrder::draft(&updated, "excessive timeouts", t0());
        let writes = vec![
            StagedWrite::SaveOrder(Box::new(updated)),
            StagedWrite::DebitPending(FundsMove {
                courier: "courier-1".to_string(),
                amount: dec!(5.00),
                reason: "pickup timeout penalty".to_string(),
                at: t0(),
            }),
            StagedWrite::UpsertAbandoned(snapshot),
        ];
        store.apply("ER-1001", writes).unwrap();

        let stored = store.find_order(OrderKind::Errand, "ER-1001").unwrap().unwrap();
        assert_eq!(stored.status(), OrderStatus::Cancelled);
        assert_eq!(stored.timeout_count(), 8);
        assert_eq!(store.pending_balance("courier-1").unwrap(), dec!(15.00));
        assert_eq!(store.platform_income().unwrap(), dec!(5.00));
        assert!(store.abandoned_order("ER-1001").unwrap().is_some());
        assert_eq!(store.journal().unwrap().len(), 1);
    }

    #[test]
    fn apply_rolls_back_the_batch_when_a_write_is_rejected() {
        let store = SqliteMarketStore::in_memory().unwrap();
        store.put_errand(sample_errand()).unwrap();
        store.set_pending_balance("courier-1", dec!(20.00)).unwrap();

        let stray = sample_errand();
        let writes = vec![
            StagedWrite::DebitPending(FundsMove {
                courier: "courier-1".to_string(),
                amount: dec!(5.00),
                reason: "pickup timeout penalty".to_string(),
                at: t0(),
            }),
            // Staged under the wrong unit; the whole batch must vanish.
            StagedWrite::SaveOrder(Box::new(stray)),
        ];
        let result = store.apply("ER-9999", writes);
        assert!(result.is_err());

        assert_eq!(store.pending_balance("courier-1").unwrap(), dec!(20.00));
        assert_eq!(store.platform_income().unwrap(), Decimal::ZERO);
        assert!(store.journal().unwrap().is_empty());
    }

    #[test]
    fn abandoned_snapshots_upsert_on_order_no() {
        let store = SqliteMarketStore::in_memory().unwrap();
        let order = sample_errand();

        let mut first = AbandonedOrder::draft(&order, "excessive timeouts", t0());
        first.region = Some("downtown".to_string());
        first.time_band = Some(TimeBand::Morning);
        store
            .apply("ER-1001", vec![StagedWrite::UpsertAbandoned(first)])
            .unwrap();

        let refreshed_order = order.with_timeout_count(9);
        let second = AbandonedOrder::draft(&refreshed_order, "excessive timeouts", t0());
        store
            .apply("ER-1001", vec![StagedWrite::UpsertAbandoned(second)])
            .unwrap();

        let snapshot = store.abandoned_order("ER-1001").unwrap().unwrap();
        assert_eq!(snapshot.timeout_count, 9);
        assert_eq!(snapshot.region, None);
        assert_eq!(snapshot.time_band, None);
    }

    #[test]
    fn debits_accumulate_across_batches() {
        let store = SqliteMarketStore::in_memory().unwrap();
        store.set_pending_balance("courier-1", dec!(10.00)).unwrap();

        for order_no in ["ER-1", "ER-2"] {
            store
                .apply(
                    order_no,
                    vec![StagedWrite::DebitPending(FundsMove {
                        courier: "courier-1".to_string(),
                        amount: dec!(4.00),
                        reason: "delivery timeout penalty".to_string(),
                        at: t0(),
                    })],
                )
                .unwrap();
        }

        assert_eq!(store.pending_balance("courier-1").unwrap(), dec!(2.00));
        assert_eq!(store.platform_income().unwrap(), dec!(8.00));
        assert_eq!(store.journal().unwrap().len(), 2);
    }
}
