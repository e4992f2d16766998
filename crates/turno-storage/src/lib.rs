//! Repository abstraction for cleaning-task state, with interchangeable
//! in-memory and Postgres backends.
//!
//! The reconciler is specified against these traits so the same invariants
//! hold regardless of backend. The Postgres backend leans on a UNIQUE
//! `(order_id, task_type)` constraint plus `INSERT ... ON CONFLICT DO
//! UPDATE`, so concurrent reconciliations of the same order serialize
//! through the row while different orders proceed in parallel.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use turno_core::{
    normalize_stay, CleaningTask, Order, Property, SyncLogEntry, TaskType, UnknownLabel,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "turno-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("write_conflict: {0}")]
    WriteConflict(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt stored value: {0}")]
    Corrupt(#[from] UnknownLabel),
}

/// Read-only view of the external order/property store.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>, StoreError>;

    async fn find_property(&self, property_id: Uuid) -> Result<Option<Property>, StoreError>;

    /// Orders whose checkin or checkout day falls inside `[from, to]`.
    async fn list_order_ids_overlapping(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Uuid>, StoreError>;
}

/// Owned cleaning-task rows, keyed by `(order_id, task_type)`.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn find_by_order_and_type(
        &self,
        order_id: Uuid,
        task_type: TaskType,
    ) -> Result<Option<CleaningTask>, StoreError>;

    async fn upsert(&self, task: &CleaningTask) -> Result<(), StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

/// Append-only audit sink. The reconciler writes, never reads.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn append(&self, entry: &SyncLogEntry) -> Result<(), StoreError>;

    async fn list_recent(&self, limit: u32) -> Result<Vec<SyncLogEntry>, StoreError>;
}

/// In-memory backend for tests and DATABASE_URL-less local runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    orders: Mutex<HashMap<Uuid, Order>>,
    properties: Mutex<HashMap<Uuid, Property>>,
    tasks: Mutex<HashMap<(Uuid, TaskType), CleaningTask>>,
    ledger: Mutex<Vec<SyncLogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_order(&self, order: Order) {
        self.orders.lock().await.insert(order.id, order);
    }

    pub async fn remove_order(&self, order_id: Uuid) {
        self.orders.lock().await.remove(&order_id);
    }

    pub async fn put_property(&self, property: Property) {
        self.properties.lock().await.insert(property.id, property);
    }

    /// Direct row mutation, used by tests to simulate manual scheduling
    /// decisions made outside the sync engine.
    pub async fn update_task<F>(&self, order_id: Uuid, task_type: TaskType, mutate: F)
    where
        F: FnOnce(&mut CleaningTask),
    {
        if let Some(task) = self.tasks.lock().await.get_mut(&(order_id, task_type)) {
            mutate(task);
        }
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.lock().await.get(&order_id).cloned())
    }

    async fn find_property(&self, property_id: Uuid) -> Result<Option<Property>, StoreError> {
        Ok(self.properties.lock().await.get(&property_id).cloned())
    }

    async fn list_order_ids_overlapping(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Uuid>, StoreError> {
        let orders = self.orders.lock().await;
        let mut ids: Vec<Uuid> = orders
            .values()
            .filter(|order| {
                let stay = normalize_stay(
                    order.checkin.as_deref(),
                    order.checkout.as_deref(),
                    order.nights,
                );
                [stay.checkin, stay.checkout]
                    .into_iter()
                    .flatten()
                    .any(|day| day >= from && day <= to)
            })
            .map(|order| order.id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn find_by_order_and_type(
        &self,
        order_id: Uuid,
        task_type: TaskType,
    ) -> Result<Option<CleaningTask>, StoreError> {
        Ok(self.tasks.lock().await.get(&(order_id, task_type)).cloned())
    }

    async fn upsert(&self, task: &CleaningTask) -> Result<(), StoreError> {
        self.tasks
            .lock()
            .await
            .insert((task.order_id, task.task_type), task.clone());
        Ok(())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.tasks.lock().await.len() as u64)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn append(&self, entry: &SyncLogEntry) -> Result<(), StoreError> {
        self.ledger.lock().await.push(entry.clone());
        Ok(())
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<SyncLogEntry>, StoreError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger.iter().rev().take(limit as usize).cloned().collect())
    }
}

/// Postgres backend over `sqlx`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn order_from_row(row: &PgRow) -> Result<Order, StoreError> {
    Ok(Order {
        id: row.try_get("id")?,
        property_id: row.try_get("property_id")?,
        checkin: row.try_get("checkin")?,
        checkout: row.try_get("checkout")?,
        nights: row.try_get("nights")?,
        status: row.try_get("status")?,
        cleaning_fee: row.try_get("cleaning_fee")?,
        note: row.try_get("note")?,
        guest_name: row.try_get("guest_name")?,
        confirmation_code: row.try_get("confirmation_code")?,
        source: row.try_get("source")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn task_from_row(row: &PgRow) -> Result<CleaningTask, StoreError> {
    let task_type: String = row.try_get("task_type")?;
    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;
    let service_type: String = row.try_get("service_type")?;
    Ok(CleaningTask {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        task_type: task_type.parse()?,
        property_id: row.try_get("property_id")?,
        task_date: row.try_get("task_date")?,
        status: status.parse()?,
        priority: priority.parse()?,
        service_type: service_type.parse()?,
        content: row.try_get("content")?,
        assignee_id: row.try_get("assignee_id")?,
        scheduled_at: row.try_get("scheduled_at")?,
        auto_sync_enabled: row.try_get("auto_sync_enabled")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn ledger_from_row(row: &PgRow) -> Result<SyncLogEntry, StoreError> {
    let task_type: String = row.try_get("task_type")?;
    let mode: String = row.try_get("mode")?;
    let outcome: String = row.try_get("outcome")?;
    Ok(SyncLogEntry {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        task_type: task_type.parse()?,
        mode: mode.parse()?,
        outcome: outcome.parse()?,
        old_values: row.try_get("old_values")?,
        new_values: row.try_get("new_values")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_write_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::WriteConflict(db.to_string());
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl OrderStore for PgStore {
    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, property_id, checkin, checkout, nights, status,
                   cleaning_fee, note, guest_name, confirmation_code, source, updated_at
              FROM orders
             WHERE id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn find_property(&self, property_id: Uuid) -> Result<Option<Property>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, code, capacity, property_type
              FROM properties
             WHERE id = $1
            "#,
        )
        .bind(property_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(Property {
                id: row.try_get("id")?,
                code: row.try_get("code")?,
                capacity: row.try_get("capacity")?,
                kind: row.try_get("property_type")?,
            })
        })
        .transpose()
    }

    async fn list_order_ids_overlapping(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Uuid>, StoreError> {
        // Date fields are dirty text; only rows with a leading day token
        // can be compared, mirroring the normalizer's fallback parse.
        let rows = sqlx::query(
            r#"
            SELECT id
              FROM orders
             WHERE (checkin  ~ '^\d{4}-\d{2}-\d{2}' AND left(checkin, 10)::date  BETWEEN $1 AND $2)
                OR (checkout ~ '^\d{4}-\d{2}-\d{2}' AND left(checkout, 10)::date BETWEEN $1 AND $2)
             ORDER BY id
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get("id")?);
        }
        Ok(ids)
    }
}

#[async_trait]
impl TaskRepository for PgStore {
    async fn find_by_order_and_type(
        &self,
        order_id: Uuid,
        task_type: TaskType,
    ) -> Result<Option<CleaningTask>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, order_id, task_type, property_id, task_date, status,
                   priority, service_type, content, assignee_id, scheduled_at,
                   auto_sync_enabled, created_at, updated_at
              FROM cleaning_tasks
             WHERE order_id = $1 AND task_type = $2
            "#,
        )
        .bind(order_id)
        .bind(task_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn upsert(&self, task: &CleaningTask) -> Result<(), StoreError> {
        debug!(order_id = %task.order_id, task_type = %task.task_type, "upserting cleaning task");
        sqlx::query(
            r#"
            INSERT INTO cleaning_tasks
                   (id, order_id, task_type, property_id, task_date, status,
                    priority, service_type, content, assignee_id, scheduled_at,
                    auto_sync_enabled, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (order_id, task_type) DO UPDATE SET
                property_id       = EXCLUDED.property_id,
                task_date         = EXCLUDED.task_date,
                status            = EXCLUDED.status,
                priority          = EXCLUDED.priority,
                service_type      = EXCLUDED.service_type,
                content           = EXCLUDED.content,
                assignee_id       = EXCLUDED.assignee_id,
                scheduled_at      = EXCLUDED.scheduled_at,
                auto_sync_enabled = EXCLUDED.auto_sync_enabled,
                updated_at        = EXCLUDED.updated_at
            "#,
        )
        .bind(task.id)
        .bind(task.order_id)
        .bind(task.task_type.as_str())
        .bind(task.property_id)
        .bind(task.task_date)
        .bind(task.status.as_str())
        .bind(task.priority.as_str())
        .bind(task.service_type.as_str())
        .bind(&task.content)
        .bind(task.assignee_id)
        .bind(task.scheduled_at)
        .bind(task.auto_sync_enabled)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_write_error)?;
        Ok(())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM cleaning_tasks")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn append(&self, entry: &SyncLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_log
                   (id, order_id, task_type, mode, outcome, old_values, new_values, error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.order_id)
        .bind(entry.task_type.as_str())
        .bind(entry.mode.as_str())
        .bind(entry.outcome.as_str())
        .bind(&entry.old_values)
        .bind(&entry.new_values)
        .bind(&entry.error)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_write_error)?;
        Ok(())
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<SyncLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, task_type, mode, outcome, old_values, new_values, error, created_at
              FROM sync_log
             ORDER BY created_at DESC
             LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ledger_from_row).collect()
    }
}
