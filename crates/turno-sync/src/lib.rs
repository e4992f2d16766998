//! Reconciler state machine + backfill orchestration.
//!
//! `SyncReconciler` brings the persisted cleaning-task rows for one order
//! into agreement with that order's current state, for both task types
//! independently; it is idempotent and never lets a failure escape past
//! its own boundary. `BackfillOrchestrator` fans the reconciler out over
//! a date window through a fixed worker pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use turno_core::{
    derive_task_fields, CleaningTask, DeriveError, Order, SyncLogEntry, SyncMode, SyncOutcome,
    TaskStatus, TaskType,
};
use turno_storage::{LedgerStore, OrderStore, StoreError, TaskRepository};
use uuid::Uuid;

pub const CRATE_NAME: &str = "turno-sync";

/// Injected time source so derivation, reconciliation, and scheduling stay
/// deterministic under test.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Pinned clock for tests and replay.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub web_port: u16,
    pub scheduler_enabled: bool,
    pub backfill_cron_1: String,
    pub backfill_cron_2: String,
    pub backfill_concurrency: usize,
    pub backfill_horizon_days: i64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            web_port: std::env::var("TURNO_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            scheduler_enabled: std::env::var("TURNO_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            backfill_cron_1: std::env::var("BACKFILL_CRON_1")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            backfill_cron_2: std::env::var("BACKFILL_CRON_2")
                .unwrap_or_else(|_| "0 0 18 * * *".to_string()),
            backfill_concurrency: std::env::var("TURNO_BACKFILL_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            backfill_horizon_days: std::env::var("TURNO_BACKFILL_HORIZON_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(14),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Derive(#[from] DeriveError),
    #[error("property_not_found: {0}")]
    PropertyNotFound(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What one `(order, task_type)` reconciliation actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Created,
    Updated,
    Cancelled,
    Unchanged,
    Skipped,
    Failed,
}

impl SyncAction {
    fn outcome(self) -> SyncOutcome {
        match self {
            SyncAction::Created | SyncAction::Updated | SyncAction::Cancelled => {
                SyncOutcome::Success
            }
            SyncAction::Unchanged | SyncAction::Skipped => SyncOutcome::Skipped,
            SyncAction::Failed => SyncOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSyncItem {
    pub task_type: TaskType,
    pub action: SyncAction,
    pub outcome: SyncOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Structured single-order result; the trigger surface returns this as-is
/// instead of throwing.
#[derive(Debug, Clone, Serialize)]
pub struct OrderSyncReport {
    pub order_id: Uuid,
    pub ok: bool,
    pub status: SyncOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub items: Vec<TaskSyncItem>,
}

struct Applied {
    action: SyncAction,
    old_values: Option<serde_json::Value>,
    new_values: Option<serde_json::Value>,
    detail: Option<String>,
}

impl Applied {
    fn skipped(detail: &str) -> Self {
        Self {
            action: SyncAction::Skipped,
            old_values: None,
            new_values: None,
            detail: Some(detail.to_string()),
        }
    }

    fn unchanged(row: &CleaningTask) -> Self {
        Self {
            action: SyncAction::Unchanged,
            old_values: Some(row.sync_values()),
            new_values: Some(row.sync_values()),
            detail: None,
        }
    }
}

pub struct SyncReconciler {
    orders: Arc<dyn OrderStore>,
    tasks: Arc<dyn TaskRepository>,
    ledger: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl SyncReconciler {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        tasks: Arc<dyn TaskRepository>,
        ledger: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orders,
            tasks,
            ledger,
            clock,
        }
    }

    /// Reconcile both task types for one order. Failures are captured per
    /// `(order, task_type)`, never propagated.
    pub async fn sync_order(&self, order_id: Uuid, mode: SyncMode) -> OrderSyncReport {
        let mut items = Vec::with_capacity(TaskType::ALL.len());
        for task_type in TaskType::ALL {
            items.push(self.sync_task(order_id, task_type, mode).await);
        }

        let status = if items.iter().any(|i| i.action == SyncAction::Failed) {
            SyncOutcome::Failed
        } else if items.iter().any(|i| i.outcome == SyncOutcome::Success) {
            SyncOutcome::Success
        } else {
            SyncOutcome::Skipped
        };
        let error = items.iter().find_map(|i| i.error.clone());

        OrderSyncReport {
            order_id,
            ok: status != SyncOutcome::Failed,
            status,
            error,
            items,
        }
    }

    async fn sync_task(&self, order_id: Uuid, task_type: TaskType, mode: SyncMode) -> TaskSyncItem {
        let (item, old_values, new_values) = match self.apply(order_id, task_type).await {
            Ok(applied) => (
                TaskSyncItem {
                    task_type,
                    action: applied.action,
                    outcome: applied.action.outcome(),
                    detail: applied.detail,
                    error: None,
                },
                applied.old_values,
                applied.new_values,
            ),
            Err(err) => {
                warn!(%order_id, task_type = %task_type, error = %err, "task sync failed");
                (
                    TaskSyncItem {
                        task_type,
                        action: SyncAction::Failed,
                        outcome: SyncOutcome::Failed,
                        detail: None,
                        error: Some(err.to_string()),
                    },
                    None,
                    None,
                )
            }
        };

        let entry = SyncLogEntry {
            id: Uuid::new_v4(),
            order_id,
            task_type,
            mode,
            outcome: item.outcome,
            old_values,
            new_values,
            error: item.error.clone(),
            created_at: self.clock.now(),
        };
        // The ledger is an audit sink; losing an entry must not fail the
        // reconciliation it describes.
        if let Err(err) = self.ledger.append(&entry).await {
            warn!(%order_id, task_type = %task_type, error = %err, "ledger append failed");
        }

        item
    }

    async fn apply(&self, order_id: Uuid, task_type: TaskType) -> Result<Applied, SyncError> {
        let order = self.orders.find_order(order_id).await?;
        let existing = self.tasks.find_by_order_and_type(order_id, task_type).await?;

        match (order, existing) {
            (None, None) => Ok(Applied::skipped("order_not_found")),
            // A vanished order cancels its leftover task, same as an
            // explicit cancellation; rows are never hard-deleted.
            (None, Some(row)) => self.cancel_row(row).await,
            (Some(order), existing) if order.is_cancelled() => match existing {
                // Never create a row just to cancel it.
                None => Ok(Applied::skipped("cancelled_without_task")),
                Some(row) => self.cancel_row(row).await,
            },
            (Some(order), existing) => self.schedule(order, existing, task_type).await,
        }
    }

    /// Cancellation applies even to locked rows: the lock protects manual
    /// scheduling decisions, not lifecycle.
    async fn cancel_row(&self, row: CleaningTask) -> Result<Applied, SyncError> {
        if row.status == TaskStatus::Cancelled {
            return Ok(Applied::unchanged(&row));
        }
        let old_values = row.sync_values();
        let mut next = row;
        next.status = TaskStatus::Cancelled;
        next.updated_at = self.clock.now();
        self.tasks.upsert(&next).await?;
        Ok(Applied {
            action: SyncAction::Cancelled,
            old_values: Some(old_values),
            new_values: Some(next.sync_values()),
            detail: None,
        })
    }

    async fn schedule(
        &self,
        order: Order,
        existing: Option<CleaningTask>,
        task_type: TaskType,
    ) -> Result<Applied, SyncError> {
        let property = self
            .orders
            .find_property(order.property_id)
            .await?
            .ok_or(SyncError::PropertyNotFound(order.property_id))?;
        let derived = derive_task_fields(&order, &property, task_type, self.clock.today())?;
        let detail = if derived.warnings.is_empty() {
            None
        } else {
            Some(derived.warnings.join("; "))
        };

        match existing {
            None => {
                let now = self.clock.now();
                let row = CleaningTask {
                    id: Uuid::new_v4(),
                    order_id: order.id,
                    task_type,
                    property_id: order.property_id,
                    task_date: derived.date,
                    status: TaskStatus::Pending,
                    priority: derived.priority,
                    service_type: derived.service_type,
                    content: derived.content,
                    assignee_id: None,
                    scheduled_at: None,
                    auto_sync_enabled: true,
                    created_at: now,
                    updated_at: now,
                };
                self.tasks.upsert(&row).await?;
                info!(order_id = %order.id, task_type = %task_type, date = %row.task_date, "cleaning task created");
                Ok(Applied {
                    action: SyncAction::Created,
                    old_values: None,
                    new_values: Some(row.sync_values()),
                    detail,
                })
            }
            // Manual override: schedule-relevant fields stay untouched.
            Some(row) if !row.auto_sync_enabled => Ok(Applied::skipped("auto_sync_disabled")),
            Some(row) => {
                let mut next = row.clone();
                next.property_id = order.property_id;
                next.task_date = derived.date;
                next.priority = derived.priority;
                next.service_type = derived.service_type;
                next.content = derived.content;
                if next.property_id != row.property_id {
                    // A stale on-site assignment may not fit the new
                    // location; force re-dispatch.
                    next.assignee_id = None;
                    next.scheduled_at = None;
                }

                if next == row {
                    return Ok(Applied::unchanged(&row));
                }

                let old_values = row.sync_values();
                next.updated_at = self.clock.now();
                self.tasks.upsert(&next).await?;
                Ok(Applied {
                    action: SyncAction::Updated,
                    old_values: Some(old_values),
                    new_values: Some(next.sync_values()),
                    detail,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackfillRequest {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    #[serde(default)]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillItem {
    pub order_id: Uuid,
    pub status: SyncOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub items: Vec<BackfillItem>,
}

pub struct BackfillOrchestrator {
    orders: Arc<dyn OrderStore>,
    reconciler: Arc<SyncReconciler>,
    default_concurrency: usize,
}

impl BackfillOrchestrator {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        reconciler: Arc<SyncReconciler>,
        default_concurrency: usize,
    ) -> Self {
        Self {
            orders,
            reconciler,
            default_concurrency: default_concurrency.max(1),
        }
    }

    /// Re-sync every order overlapping the window. Always returns a
    /// summary; per-order failures are counted, never propagated.
    pub async fn run(&self, request: BackfillRequest) -> BackfillReport {
        let candidates = match self
            .orders
            .list_order_ids_overlapping(request.date_from, request.date_to)
            .await
        {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "backfill candidate enumeration failed");
                return BackfillReport {
                    total: 0,
                    success: 0,
                    failed: 0,
                    skipped: 0,
                    error: Some(err.to_string()),
                    items: Vec::new(),
                };
            }
        };

        let total = candidates.len();
        let workers = request
            .concurrency
            .unwrap_or(self.default_concurrency)
            .max(1)
            .min(total.max(1));
        info!(
            total,
            workers,
            from = %request.date_from,
            to = %request.date_to,
            "backfill starting"
        );

        // One shared cursor; the only cross-worker state is the atomic
        // take-next-index.
        let cursor = Arc::new(AtomicUsize::new(0));
        let candidates = Arc::new(candidates);
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let cursor = Arc::clone(&cursor);
            let candidates = Arc::clone(&candidates);
            let reconciler = Arc::clone(&self.reconciler);
            handles.push(tokio::spawn(async move {
                let mut out = Vec::new();
                loop {
                    let idx = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(order_id) = candidates.get(idx).copied() else {
                        break;
                    };
                    let report = reconciler.sync_order(order_id, SyncMode::Batch).await;
                    out.push(BackfillItem {
                        order_id,
                        status: report.status,
                        error: report.error,
                    });
                }
                out
            }));
        }

        let mut items = Vec::with_capacity(total);
        for handle in handles {
            match handle.await {
                Ok(mut chunk) => items.append(&mut chunk),
                Err(err) => warn!(error = %err, "backfill worker aborted"),
            }
        }

        let success = items
            .iter()
            .filter(|i| i.status == SyncOutcome::Success)
            .count();
        let failed = items
            .iter()
            .filter(|i| i.status == SyncOutcome::Failed)
            .count();
        let skipped = items
            .iter()
            .filter(|i| i.status == SyncOutcome::Skipped)
            .count();
        info!(total, success, failed, skipped, "backfill finished");

        BackfillReport {
            total,
            success,
            failed,
            skipped,
            error: None,
            items,
        }
    }
}

/// Wire cron-driven catch-up backfills when enabled by config.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<BackfillOrchestrator>,
    clock: Arc<dyn Clock>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.backfill_cron_1, &config.backfill_cron_2] {
        let orchestrator = Arc::clone(&orchestrator);
        let clock = Arc::clone(&clock);
        let horizon = config.backfill_horizon_days;
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let orchestrator = Arc::clone(&orchestrator);
            let clock = Arc::clone(&clock);
            Box::pin(async move {
                let today = clock.today();
                let report = orchestrator
                    .run(BackfillRequest {
                        date_from: today - Duration::days(1),
                        date_to: today + Duration::days(horizon),
                        concurrency: None,
                    })
                    .await;
                info!(
                    total = report.total,
                    success = report.success,
                    failed = report.failed,
                    skipped = report.skipped,
                    "scheduled backfill finished"
                );
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use turno_core::{Priority, Property, ServiceType};
    use turno_storage::MemoryStore;

    fn clock() -> Arc<dyn Clock> {
        let now = Utc
            .with_ymd_and_hms(2026, 2, 17, 9, 0, 0)
            .single()
            .expect("clock");
        Arc::new(FixedClock(now))
    }

    fn order(id: Uuid, property_id: Uuid) -> Order {
        Order {
            id,
            property_id,
            checkin: Some("2026-02-17T12:00:00Z".to_string()),
            checkout: Some("2026-02-20T11:00:00Z".to_string()),
            nights: None,
            status: "confirmed".to_string(),
            cleaning_fee: Some(120.0),
            note: None,
            guest_name: Some("Ada".to_string()),
            confirmation_code: Some("HM123".to_string()),
            source: Some("airbnb".to_string()),
            updated_at: Utc::now(),
        }
    }

    fn property(id: Uuid) -> Property {
        Property {
            id,
            code: "A-101".to_string(),
            capacity: Some(2),
            kind: Some("apartment".to_string()),
        }
    }

    struct Rig {
        store: Arc<MemoryStore>,
        reconciler: Arc<SyncReconciler>,
        backfill: BackfillOrchestrator,
    }

    fn rig() -> Rig {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Arc::new(SyncReconciler::new(
            store.clone(),
            store.clone(),
            store.clone(),
            clock(),
        ));
        let backfill = BackfillOrchestrator::new(store.clone(), reconciler.clone(), 4);
        Rig {
            store,
            reconciler,
            backfill,
        }
    }

    async fn seed_order(rig: &Rig) -> Order {
        let property_id = Uuid::new_v4();
        let o = order(Uuid::new_v4(), property_id);
        rig.store.put_property(property(property_id)).await;
        rig.store.put_order(o.clone()).await;
        o
    }

    #[tokio::test]
    async fn first_sync_creates_both_tasks() {
        let rig = rig();
        let o = seed_order(&rig).await;

        let report = rig.reconciler.sync_order(o.id, SyncMode::Realtime).await;
        assert!(report.ok);
        assert_eq!(report.status, SyncOutcome::Success);
        assert!(report
            .items
            .iter()
            .all(|i| i.action == SyncAction::Created));
        assert_eq!(rig.store.count().await.expect("count"), 2);

        let checkout = rig
            .store
            .find_by_order_and_type(o.id, TaskType::CheckoutCleaning)
            .await
            .expect("find")
            .expect("row");
        assert_eq!(
            checkout.task_date,
            NaiveDate::from_ymd_opt(2026, 2, 20).expect("date")
        );
        assert_eq!(checkout.status, TaskStatus::Pending);
        assert_eq!(checkout.priority, Priority::High);
        assert!(checkout.auto_sync_enabled);
        assert_eq!(checkout.assignee_id, None);
        assert!(checkout.content.contains("property:A-101"));
        assert!(checkout.content.contains("type:checkout_cleaning"));
    }

    #[tokio::test]
    async fn resync_without_changes_is_byte_identical_and_deduplicated() {
        let rig = rig();
        let o = seed_order(&rig).await;

        rig.reconciler.sync_order(o.id, SyncMode::Realtime).await;
        let first = rig
            .store
            .find_by_order_and_type(o.id, TaskType::CheckoutCleaning)
            .await
            .expect("find")
            .expect("row");

        let report = rig.reconciler.sync_order(o.id, SyncMode::Realtime).await;
        assert_eq!(report.status, SyncOutcome::Skipped);
        assert!(report
            .items
            .iter()
            .all(|i| i.action == SyncAction::Unchanged));

        let second = rig
            .store
            .find_by_order_and_type(o.id, TaskType::CheckoutCleaning)
            .await
            .expect("find")
            .expect("row");
        assert_eq!(first, second);
        assert_eq!(rig.store.count().await.expect("count"), 2);
    }

    #[tokio::test]
    async fn property_change_clears_assignment() {
        let rig = rig();
        let mut o = seed_order(&rig).await;
        rig.reconciler.sync_order(o.id, SyncMode::Realtime).await;

        // Field ops assigned a cleaner in the meantime.
        rig.store
            .update_task(o.id, TaskType::CheckoutCleaning, |t| {
                t.assignee_id = Some(Uuid::new_v4());
                t.scheduled_at = Some(Utc::now());
            })
            .await;

        let new_property = Uuid::new_v4();
        rig.store.put_property(property(new_property)).await;
        o.property_id = new_property;
        rig.store.put_order(o.clone()).await;

        let report = rig.reconciler.sync_order(o.id, SyncMode::Realtime).await;
        assert_eq!(report.status, SyncOutcome::Success);

        let row = rig
            .store
            .find_by_order_and_type(o.id, TaskType::CheckoutCleaning)
            .await
            .expect("find")
            .expect("row");
        assert_eq!(row.property_id, new_property);
        assert_eq!(row.assignee_id, None);
        assert_eq!(row.scheduled_at, None);
    }

    #[tokio::test]
    async fn locked_task_keeps_manual_schedule() {
        let rig = rig();
        let mut o = seed_order(&rig).await;
        rig.reconciler.sync_order(o.id, SyncMode::Realtime).await;

        let manual_date = NaiveDate::from_ymd_opt(2026, 3, 1).expect("date");
        rig.store
            .update_task(o.id, TaskType::CheckoutCleaning, |t| {
                t.auto_sync_enabled = false;
                t.task_date = manual_date;
            })
            .await;

        o.checkout = Some("2026-02-25".to_string());
        rig.store.put_order(o.clone()).await;

        let report = rig.reconciler.sync_order(o.id, SyncMode::Realtime).await;
        let item = report
            .items
            .iter()
            .find(|i| i.task_type == TaskType::CheckoutCleaning)
            .expect("item");
        assert_eq!(item.action, SyncAction::Skipped);

        let row = rig
            .store
            .find_by_order_and_type(o.id, TaskType::CheckoutCleaning)
            .await
            .expect("find")
            .expect("row");
        assert_eq!(row.task_date, manual_date);
        assert!(!row.auto_sync_enabled);
    }

    #[tokio::test]
    async fn cancellation_drives_both_tasks_to_cancelled() {
        let rig = rig();
        let mut o = seed_order(&rig).await;
        rig.reconciler.sync_order(o.id, SyncMode::Realtime).await;

        // One of the two is locked; cancellation still applies.
        rig.store
            .update_task(o.id, TaskType::CheckinCleaning, |t| {
                t.auto_sync_enabled = false;
            })
            .await;

        o.status = "cancelled".to_string();
        rig.store.put_order(o.clone()).await;

        let report = rig.reconciler.sync_order(o.id, SyncMode::Realtime).await;
        assert_eq!(report.status, SyncOutcome::Success);
        for task_type in TaskType::ALL {
            let row = rig
                .store
                .find_by_order_and_type(o.id, task_type)
                .await
                .expect("find")
                .expect("row");
            assert_eq!(row.status, TaskStatus::Cancelled);
        }
        assert_eq!(rig.store.count().await.expect("count"), 2);

        // Re-running the cancellation is a no-op.
        let report = rig.reconciler.sync_order(o.id, SyncMode::Realtime).await;
        assert_eq!(report.status, SyncOutcome::Skipped);
    }

    #[tokio::test]
    async fn cancelled_order_without_tasks_creates_nothing() {
        let rig = rig();
        let mut o = seed_order(&rig).await;
        o.status = "cancelled".to_string();
        rig.store.put_order(o.clone()).await;

        let report = rig.reconciler.sync_order(o.id, SyncMode::Realtime).await;
        assert_eq!(report.status, SyncOutcome::Skipped);
        assert_eq!(rig.store.count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn deleted_order_cancels_leftover_tasks() {
        let rig = rig();
        let o = seed_order(&rig).await;
        rig.reconciler.sync_order(o.id, SyncMode::Realtime).await;

        rig.store.remove_order(o.id).await;
        let report = rig.reconciler.sync_order(o.id, SyncMode::Realtime).await;
        assert_eq!(report.status, SyncOutcome::Success);
        for task_type in TaskType::ALL {
            let row = rig
                .store
                .find_by_order_and_type(o.id, task_type)
                .await
                .expect("find")
                .expect("row");
            assert_eq!(row.status, TaskStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn unknown_order_without_rows_is_a_skipped_noop() {
        let rig = rig();
        let report = rig
            .reconciler
            .sync_order(Uuid::new_v4(), SyncMode::Realtime)
            .await;
        assert!(report.ok);
        assert_eq!(report.status, SyncOutcome::Skipped);
        assert_eq!(rig.store.count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn unresolvable_dates_fail_only_that_order() {
        let rig = rig();
        let good = seed_order(&rig).await;

        let property_id = Uuid::new_v4();
        rig.store.put_property(property(property_id)).await;
        let mut bad = order(Uuid::new_v4(), property_id);
        bad.checkin = Some("whenever".to_string());
        bad.checkout = None;
        bad.nights = None;
        rig.store.put_order(bad.clone()).await;

        let report = rig.reconciler.sync_order(bad.id, SyncMode::Realtime).await;
        assert!(!report.ok);
        assert_eq!(report.status, SyncOutcome::Failed);
        assert_eq!(report.error.as_deref(), Some("order_missing_dates"));

        // The sibling order is untouched by the failure.
        let report = rig.reconciler.sync_order(good.id, SyncMode::Realtime).await;
        assert_eq!(report.status, SyncOutcome::Success);
    }

    #[tokio::test]
    async fn every_attempt_lands_in_the_ledger() {
        let rig = rig();
        let o = seed_order(&rig).await;

        rig.reconciler.sync_order(o.id, SyncMode::Realtime).await;
        rig.reconciler.sync_order(o.id, SyncMode::Batch).await;
        rig.reconciler
            .sync_order(Uuid::new_v4(), SyncMode::Realtime)
            .await;

        // Three order-level attempts, two task types each.
        let entries = rig.store.list_recent(100).await.expect("ledger");
        assert_eq!(entries.len(), 6);
        assert!(entries.iter().any(|e| e.mode == SyncMode::Batch));
        assert!(entries
            .iter()
            .any(|e| e.outcome == SyncOutcome::Skipped && e.order_id != o.id));
        let created = entries
            .iter()
            .find(|e| e.order_id == o.id && e.outcome == SyncOutcome::Success)
            .expect("created entry");
        assert!(created.old_values.is_none());
        assert!(created.new_values.is_some());
    }

    #[tokio::test]
    async fn backfill_processes_window_and_isolates_failures() {
        let rig = rig();
        let good_a = seed_order(&rig).await;
        let good_b = seed_order(&rig).await;

        let property_id = Uuid::new_v4();
        rig.store.put_property(property(property_id)).await;
        let mut bad = order(Uuid::new_v4(), property_id);
        bad.checkin = Some("2026-02-18 unparseable tail is fine".to_string());
        bad.checkout = Some("not a date".to_string());
        rig.store.put_order(bad.clone()).await;

        // Orphan property: active order whose property row is missing.
        let mut orphan = order(Uuid::new_v4(), Uuid::new_v4());
        orphan.checkin = Some("2026-02-18".to_string());
        orphan.checkout = Some("2026-02-21".to_string());
        rig.store.put_order(orphan.clone()).await;

        let request = BackfillRequest {
            date_from: NaiveDate::from_ymd_opt(2026, 2, 1).expect("date"),
            date_to: NaiveDate::from_ymd_opt(2026, 2, 28).expect("date"),
            concurrency: Some(3),
        };
        let report = rig.backfill.run(request.clone()).await;

        assert_eq!(report.total, 4);
        assert_eq!(report.success, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.error, None);
        let failed = report
            .items
            .iter()
            .find(|i| i.status == SyncOutcome::Failed)
            .expect("failed item");
        assert_eq!(failed.order_id, orphan.id);

        // good_a, good_b, and bad (checkin token salvaged) each got 2 rows.
        assert_eq!(rig.store.count().await.expect("count"), 6);
        let _ = (good_a, good_b);

        // Same window again: no new rows, everything unchanged or failed.
        let report = rig.backfill.run(request).await;
        assert_eq!(report.total, 4);
        assert_eq!(report.success, 0);
        assert_eq!(report.skipped, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(rig.store.count().await.expect("count"), 6);
    }

    #[tokio::test]
    async fn backfill_with_single_worker_still_covers_all_candidates() {
        let rig = rig();
        for _ in 0..5 {
            seed_order(&rig).await;
        }
        let report = rig
            .backfill
            .run(BackfillRequest {
                date_from: NaiveDate::from_ymd_opt(2026, 2, 1).expect("date"),
                date_to: NaiveDate::from_ymd_opt(2026, 2, 28).expect("date"),
                concurrency: Some(1),
            })
            .await;
        assert_eq!(report.total, 5);
        assert_eq!(report.success, 5);
        assert_eq!(rig.store.count().await.expect("count"), 10);
    }

    #[tokio::test]
    async fn scheduler_only_builds_when_enabled() {
        let rig = rig();
        let orchestrator = Arc::new(BackfillOrchestrator::new(
            rig.store.clone(),
            rig.reconciler.clone(),
            2,
        ));

        let mut config = SyncConfig::from_env();
        config.scheduler_enabled = false;
        let none = maybe_build_scheduler(&config, orchestrator.clone(), clock())
            .await
            .expect("scheduler");
        assert!(none.is_none());

        config.scheduler_enabled = true;
        config.backfill_cron_1 = "0 0 6 * * *".to_string();
        config.backfill_cron_2 = "0 0 18 * * *".to_string();
        let some = maybe_build_scheduler(&config, orchestrator, clock())
            .await
            .expect("scheduler");
        assert!(some.is_some());
    }
}
