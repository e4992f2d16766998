//! Domain model + pure derivation logic for Turno cleaning-task sync.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "turno-core";

/// Raised when a persisted text label does not map back onto an enum.
#[derive(Debug, Error)]
#[error("unknown {kind} label: {value}")]
pub struct UnknownLabel {
    pub kind: &'static str,
    pub value: String,
}

/// The two derived work items per booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    CheckoutCleaning,
    CheckinCleaning,
}

impl TaskType {
    pub const ALL: [TaskType; 2] = [TaskType::CheckoutCleaning, TaskType::CheckinCleaning];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CheckoutCleaning => "checkout_cleaning",
            TaskType::CheckinCleaning => "checkin_cleaning",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checkout_cleaning" => Ok(TaskType::CheckoutCleaning),
            "checkin_cleaning" => Ok(TaskType::CheckinCleaning),
            other => Err(UnknownLabel {
                kind: "task_type",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle states. The sync engine only ever writes `Pending` and
/// `Cancelled`; the rest belong to the field-operations API and pass
/// through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Ready,
    RestockPending,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Ready => "ready",
            TaskStatus::RestockPending => "restock_pending",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "ready" => Ok(TaskStatus::Ready),
            "restock_pending" => Ok(TaskStatus::RestockPending),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(UnknownLabel {
                kind: "task_status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Standard,
    Deep,
    LinenOnly,
    Inspection,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Standard => "standard",
            ServiceType::Deep => "deep",
            ServiceType::LinenOnly => "linen_only",
            ServiceType::Inspection => "inspection",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(ServiceType::Standard),
            "deep" => Ok(ServiceType::Deep),
            "linen_only" => Ok(ServiceType::LinenOnly),
            "inspection" => Ok(ServiceType::Inspection),
            other => Err(UnknownLabel {
                kind: "service_type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    /// Clamp an additive urgency score onto the four persisted levels.
    pub fn from_score(score: i32) -> Self {
        match score {
            i32::MIN..=0 => Priority::Low,
            1 => Priority::Medium,
            2 => Priority::High,
            _ => Priority::Urgent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(UnknownLabel {
                kind: "priority",
                value: other.to_string(),
            }),
        }
    }
}

/// Booking record, read-only to the engine. Date fields stay raw strings
/// because upstream channels deliver anything from clean `YYYY-MM-DD`
/// days to full timestamps to garbage; normalization happens here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub property_id: Uuid,
    pub checkin: Option<String>,
    pub checkout: Option<String>,
    pub nights: Option<i64>,
    pub status: String,
    pub cleaning_fee: Option<f64>,
    pub note: Option<String>,
    pub guest_name: Option<String>,
    pub confirmation_code: Option<String>,
    pub source: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn is_cancelled(&self) -> bool {
        self.status.eq_ignore_ascii_case("cancelled")
    }
}

/// Rental property, read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub id: Uuid,
    pub code: String,
    pub capacity: Option<i32>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// The derived work item, one per `(order_id, task_type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleaningTask {
    pub id: Uuid,
    pub order_id: Uuid,
    pub task_type: TaskType,
    pub property_id: Uuid,
    pub task_date: NaiveDate,
    pub status: TaskStatus,
    pub priority: Priority,
    pub service_type: ServiceType,
    pub content: String,
    pub assignee_id: Option<Uuid>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub auto_sync_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CleaningTask {
    /// Snapshot of the sync-managed fields, recorded as ledger old/new values.
    pub fn sync_values(&self) -> serde_json::Value {
        serde_json::json!({
            "task_date": self.task_date,
            "property_id": self.property_id,
            "status": self.status,
            "priority": self.priority,
            "service_type": self.service_type,
            "content": self.content,
            "assignee_id": self.assignee_id,
            "scheduled_at": self.scheduled_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Realtime,
    Batch,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Realtime => "realtime",
            SyncMode::Batch => "batch",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "realtime" => Ok(SyncMode::Realtime),
            "batch" => Ok(SyncMode::Batch),
            other => Err(UnknownLabel {
                kind: "sync_mode",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Success,
    Failed,
    Skipped,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Success => "success",
            SyncOutcome::Failed => "failed",
            SyncOutcome::Skipped => "skipped",
        }
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncOutcome {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(SyncOutcome::Success),
            "failed" => Ok(SyncOutcome::Failed),
            "skipped" => Ok(SyncOutcome::Skipped),
            other => Err(UnknownLabel {
                kind: "sync_outcome",
                value: other.to_string(),
            }),
        }
    }
}

/// One append-only audit row per reconciliation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: Uuid,
    pub order_id: Uuid,
    pub task_type: TaskType,
    pub mode: SyncMode,
    pub outcome: SyncOutcome,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One consistent stay interval resolved from possibly dirty booking fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedStay {
    pub checkin: Option<NaiveDate>,
    pub checkout: Option<NaiveDate>,
    pub nights: Option<i64>,
    pub warnings: Vec<String>,
}

static LEADING_DAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4}-\d{2}-\d{2})").expect("leading day pattern"));

fn parse_day(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if let Ok(day) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(day);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.date_naive());
    }
    // Channels occasionally send timestamps that are almost-but-not-quite
    // RFC 3339 ("2026-02-17T12:00Z"); salvage the leading calendar day.
    let caps = LEADING_DAY.captures(trimmed)?;
    NaiveDate::parse_from_str(caps.get(1)?.as_str(), "%Y-%m-%d").ok()
}

/// Resolve checkin/checkout/nights into one consistent interval.
///
/// Never fails; repairs are applied in a fixed order and every repair (or
/// unrepairable inconsistency) surfaces as a diagnostic warning string.
pub fn normalize_stay(
    checkin: Option<&str>,
    checkout: Option<&str>,
    nights: Option<i64>,
) -> NormalizedStay {
    let mut warnings = Vec::new();
    let checkin_day = checkin.and_then(parse_day);
    let mut checkout_day = checkout.and_then(parse_day);

    if let (Some(ci), Some(n)) = (checkin_day, nights) {
        let inferred = ci + Duration::days(n);
        match checkout_day {
            None => {
                checkout_day = Some(inferred);
                warnings.push("checkout_missing_inferred_from_nights".to_string());
            }
            Some(co) => {
                let diff = (co - ci).num_days();
                if diff != n {
                    checkout_day = Some(inferred);
                    warnings.push(format!("checkout_mismatch_inferred_from_nights({diff},{n})"));
                }
            }
        }
    }

    if let (Some(ci), Some(co)) = (checkin_day, checkout_day) {
        if co < ci {
            match nights {
                Some(n) => {
                    checkout_day = Some(ci + Duration::days(n));
                    warnings.push("checkout_before_checkin_corrected_from_nights".to_string());
                }
                None => warnings.push("checkout_before_checkin".to_string()),
            }
        }
    }

    NormalizedStay {
        checkin: checkin_day,
        checkout: checkout_day,
        nights,
        warnings,
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeriveError {
    #[error("order_missing_dates")]
    MissingDates,
}

/// Scheduling attributes computed for one `(order, task_type)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedTaskFields {
    pub date: NaiveDate,
    pub rooms: i32,
    pub service_type: ServiceType,
    pub priority: Priority,
    pub content: String,
    pub recommended_start_day: NaiveDate,
    pub warnings: Vec<String>,
}

fn classify_service(order: &Order, property: &Property) -> ServiceType {
    // Ordered rule list, last writer wins. Do not reorder: a later match
    // overrides everything before it.
    let mut service = ServiceType::Standard;

    let note = order
        .note
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    if note.contains("deep") || note.contains("深度") {
        service = ServiceType::Deep;
    }
    if note.contains("linen") || note.contains("bed") || note.contains("床品") {
        service = ServiceType::LinenOnly;
    }

    if order.cleaning_fee.unwrap_or(0.0) >= 180.0 {
        service = ServiceType::Deep;
    }

    let kind = property.kind.as_deref().unwrap_or_default().to_lowercase();
    if kind.contains("inspection") {
        service = ServiceType::Inspection;
    }

    service
}

fn urgency_score(days_until: i64, rooms: i32, service: ServiceType, source: Option<&str>) -> i32 {
    let mut score = if days_until <= 1 {
        3
    } else if days_until <= 3 {
        2
    } else if days_until <= 7 {
        1
    } else {
        0
    };
    if rooms >= 4 {
        score += 1;
    }
    if service == ServiceType::Deep {
        score += 1;
    }
    if source
        .unwrap_or_default()
        .to_lowercase()
        .contains("booking")
    {
        score += 1;
    }
    score
}

fn build_content(
    order: &Order,
    property: &Property,
    task_type: TaskType,
    service: ServiceType,
    rooms: i32,
    date: NaiveDate,
) -> String {
    let mut lines = Vec::with_capacity(8);
    if !property.code.is_empty() {
        lines.push(format!("property:{}", property.code));
    }
    if let Some(source) = order.source.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("source:{source}"));
    }
    lines.push(format!("type:{task_type}"));
    lines.push(format!("service:{service}"));
    lines.push(format!("rooms:{rooms}"));
    if let Some(guest) = order.guest_name.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("guest:{guest}"));
    }
    if let Some(code) = order.confirmation_code.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("code:{code}"));
    }
    match task_type {
        TaskType::CheckoutCleaning => lines.push(format!("checkout:{date}")),
        TaskType::CheckinCleaning => lines.push(format!("checkin:{date}")),
    }
    lines.join("\n")
}

/// Turn a booking + property into a cleaning task's scheduling attributes.
///
/// `today` is injected so priority scoring stays deterministic. Fails only
/// when neither stay boundary resolves to a calendar day.
pub fn derive_task_fields(
    order: &Order,
    property: &Property,
    task_type: TaskType,
    today: NaiveDate,
) -> Result<DerivedTaskFields, DeriveError> {
    let stay = normalize_stay(order.checkin.as_deref(), order.checkout.as_deref(), order.nights);

    let date = match task_type {
        TaskType::CheckoutCleaning => stay.checkout.or(stay.checkin),
        TaskType::CheckinCleaning => stay.checkin.or(stay.checkout),
    }
    .ok_or(DeriveError::MissingDates)?;

    let rooms = property.capacity.unwrap_or(1).max(1);
    let service_type = classify_service(order, property);

    let days_until = (date - today).num_days();
    let priority = Priority::from_score(urgency_score(
        days_until,
        rooms,
        service_type,
        order.source.as_deref(),
    ));

    let content = build_content(order, property, task_type, service_type, rooms, date);

    let recommended_start_day = match task_type {
        TaskType::CheckoutCleaning => date,
        // Checkin cleans get a one-day prep-ahead window.
        TaskType::CheckinCleaning => date - Duration::days(1),
    };

    Ok(DerivedTaskFields {
        date,
        rooms,
        service_type,
        priority,
        content,
        recommended_start_day,
        warnings: stay.warnings,
    })
}
