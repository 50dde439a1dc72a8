//! Shared test utilities for the academy ledger.
//!
//! This module provides common helper functions for setting up test databases
//! and creating test entities with sensible defaults. Rows are inserted
//! directly so tests can arrange any ledger state, including ones the engine
//! itself would never produce.

#![allow(clippy::unwrap_used)]

use crate::{
    config::billing::BillingSettings,
    core::{
        context::LedgerContext,
        notification::NotificationDispatcher,
        package::NewRound,
    },
    entities::{
        Bill, BillStatus, ClassIds, ClassStatus, PackageStatus, bill, class_record, package,
        student, teacher,
    },
    errors::Result,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use sea_orm::{DatabaseConnection, QueryOrder, Set, prelude::*};
use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};
use tracing_subscriber::EnvFilter;

/// Routes `tracing` output through the test harness. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Creates an in-memory `SQLite` database with all tables initialized.
/// This is the standard setup for all integration tests.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    init_test_tracing();
    let db = sea_orm::Database::connect("sqlite::memory:").await?;
    crate::config::database::create_tables(&db).await?;
    Ok(db)
}

/// Dispatcher that records every accepted message, or rejects them all once
/// [`RecordingDispatcher::fail_deliveries`] is called.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
}

impl RecordingDispatcher {
    /// Accepted messages as `(recipient, body)` pairs.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Makes every later `send` return `false`.
    pub fn fail_deliveries(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn send(&self, recipient: &str, body: &str) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            return false;
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((recipient.to_string(), body.to_string()));
        true
    }
}

/// Wraps a connection (real or mock) in a context with default settings and a
/// recording dispatcher.
pub fn context_for(db: DatabaseConnection) -> (LedgerContext, Arc<RecordingDispatcher>) {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let notifier: Arc<dyn NotificationDispatcher> = Arc::clone(&dispatcher) as _;
    let ctx = LedgerContext::new(db, notifier, BillingSettings::default());
    (ctx, dispatcher)
}

/// In-memory database plus context. Returns (ctx, dispatcher).
pub async fn setup_test_context() -> Result<(LedgerContext, Arc<RecordingDispatcher>)> {
    let db = setup_test_db().await?;
    Ok(context_for(db))
}

/// The fixed "now" passed to engine operations in tests.
pub fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

/// Timestamp used for rows arranged by tests, earlier than [`test_now`].
fn seeded_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap()
}

/// A day in February 2026.
pub fn day(n: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 2, n).unwrap()
}

/// Round purchase in USD starting on the first test day.
pub fn new_round(student_id: i64, total_hours: f64, hour_price: f64) -> NewRound {
    NewRound {
        student_id,
        total_hours,
        hour_price,
        currency: "USD".to_string(),
        start_date: day(1),
    }
}

/// Creates a test student with a messaging address.
///
/// # Defaults
/// * `whatsapp`: `"+5511999990000"`
/// * `currency`: `"BRL"`
pub async fn create_test_student(db: &DatabaseConnection, name: &str) -> Result<student::Model> {
    student::ActiveModel {
        name: Set(name.to_string()),
        whatsapp: Set(Some("+5511999990000".to_string())),
        currency: Set(Some("BRL".to_string())),
        ..Default::default()
    }
    .insert(db)
    .await
    .map_err(Into::into)
}

/// Creates a test teacher with the given hourly rate.
pub async fn create_test_teacher(
    db: &DatabaseConnection,
    name: &str,
    hourly_rate: f64,
) -> Result<teacher::Model> {
    teacher::ActiveModel {
        name: Set(name.to_string()),
        hourly_rate: Set(hourly_rate),
        ..Default::default()
    }
    .insert(db)
    .await
    .map_err(Into::into)
}

/// Sets up the usual pair: student "Ana" and teacher "Bruno" at 25/h.
pub async fn create_student_and_teacher(
    db: &DatabaseConnection,
) -> Result<(student::Model, teacher::Model)> {
    let student = create_test_student(db, "Ana").await?;
    let teacher = create_test_teacher(db, "Bruno", 25.0).await?;
    Ok((student, teacher))
}

/// Builds an unsaved hour-tracked package for `MockDatabase` results.
/// Remaining hours equal total hours; priced at 20 USD per hour.
pub fn package_model(
    id: i64,
    student_id: i64,
    round_number: i32,
    total_hours: f64,
    status: PackageStatus,
) -> package::Model {
    package::Model {
        id,
        student_id,
        round_number,
        total_hours,
        remaining_hours: total_hours,
        total_classes: None,
        remaining_classes: None,
        hour_price: 20.0,
        currency: "USD".to_string(),
        status,
        start_date: day(1),
        last_notification_sent: None,
        notification_count: 0,
        paid_at: None,
        created_at: seeded_at(),
        updated_at: seeded_at(),
    }
}

/// Builds an unsaved class at 10:00 with teacher 1 for `MockDatabase` results.
pub fn class_model(
    id: i64,
    student_id: i64,
    package_id: Option<i64>,
    class_date: NaiveDate,
    duration_minutes: i32,
    status: ClassStatus,
) -> class_record::Model {
    class_record::Model {
        id,
        student_id,
        teacher_id: 1,
        package_id,
        class_date,
        start_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        duration_minutes,
        status,
        cancellation_reason: None,
        cancelled_by: None,
        cancelled_at: None,
        created_at: seeded_at(),
        updated_at: seeded_at(),
    }
}

/// Inserts an hour-tracked package priced at 20 USD per hour.
pub async fn insert_package(
    db: &DatabaseConnection,
    student_id: i64,
    round_number: i32,
    total_hours: f64,
    remaining_hours: f64,
    status: PackageStatus,
) -> Result<package::Model> {
    let paid_at = (status == PackageStatus::Paid).then(seeded_at);
    package::ActiveModel {
        student_id: Set(student_id),
        round_number: Set(round_number),
        total_hours: Set(total_hours),
        remaining_hours: Set(remaining_hours),
        total_classes: Set(None),
        remaining_classes: Set(None),
        hour_price: Set(20.0),
        currency: Set("USD".to_string()),
        status: Set(status),
        start_date: Set(day(1)),
        last_notification_sent: Set(None),
        notification_count: Set(0),
        paid_at: Set(paid_at),
        created_at: Set(seeded_at()),
        updated_at: Set(seeded_at()),
        ..Default::default()
    }
    .insert(db)
    .await
    .map_err(Into::into)
}

/// Inserts an active package with custom price and currency.
pub async fn insert_priced_package(
    db: &DatabaseConnection,
    student_id: i64,
    round_number: i32,
    total_hours: f64,
    hour_price: f64,
    currency: &str,
) -> Result<package::Model> {
    let pkg = insert_package(
        db,
        student_id,
        round_number,
        total_hours,
        total_hours,
        PackageStatus::Active,
    )
    .await?;
    let mut active_model: package::ActiveModel = pkg.into();
    active_model.hour_price = Set(hour_price);
    active_model.currency = Set(currency.to_string());
    active_model.update(db).await.map_err(Into::into)
}

/// Inserts an active legacy package tracked by class count only.
pub async fn insert_legacy_package(
    db: &DatabaseConnection,
    student_id: i64,
    round_number: i32,
    total_classes: i32,
) -> Result<package::Model> {
    let pkg = insert_package(db, student_id, round_number, 0.0, 0.0, PackageStatus::Active).await?;
    let mut active_model: package::ActiveModel = pkg.into();
    active_model.total_classes = Set(Some(total_classes));
    active_model.remaining_classes = Set(Some(total_classes));
    active_model.update(db).await.map_err(Into::into)
}

async fn insert_class(
    db: &DatabaseConnection,
    student_id: i64,
    teacher_id: i64,
    package_id: Option<i64>,
    class_date: NaiveDate,
    duration_minutes: i32,
    status: ClassStatus,
) -> Result<class_record::Model> {
    class_record::ActiveModel {
        student_id: Set(student_id),
        teacher_id: Set(teacher_id),
        package_id: Set(package_id),
        class_date: Set(class_date),
        start_time: Set(NaiveTime::from_hms_opt(10, 0, 0).unwrap()),
        duration_minutes: Set(duration_minutes),
        status: Set(status),
        cancellation_reason: Set(None),
        cancelled_by: Set(None),
        cancelled_at: Set(None),
        created_at: Set(seeded_at()),
        updated_at: Set(seeded_at()),
        ..Default::default()
    }
    .insert(db)
    .await
    .map_err(Into::into)
}

/// Creates a class at 10:00 on `class_date` with no package.
pub async fn create_test_class(
    db: &DatabaseConnection,
    student_id: i64,
    teacher_id: i64,
    class_date: NaiveDate,
    duration_minutes: i32,
    status: ClassStatus,
) -> Result<class_record::Model> {
    insert_class(db, student_id, teacher_id, None, class_date, duration_minutes, status).await
}

/// Creates a class at 10:00 on `class_date` already linked to a package.
pub async fn create_linked_class(
    db: &DatabaseConnection,
    student_id: i64,
    teacher_id: i64,
    package_id: i64,
    class_date: NaiveDate,
    duration_minutes: i32,
    status: ClassStatus,
) -> Result<class_record::Model> {
    insert_class(
        db,
        student_id,
        teacher_id,
        Some(package_id),
        class_date,
        duration_minutes,
        status,
    )
    .await
}

/// Inserts a pending, system-generated USD bill covering one class.
pub async fn insert_pending_bill(
    db: &DatabaseConnection,
    package_id: i64,
    student_id: i64,
    class_id: i64,
    total_hours: f64,
    amount: f64,
) -> Result<bill::Model> {
    bill::ActiveModel {
        package_id: Set(Some(package_id)),
        student_id: Set(student_id),
        teacher_id: Set(None),
        class_ids: Set(ClassIds::single(class_id)),
        total_hours: Set(total_hours),
        amount: Set(amount),
        currency: Set("USD".to_string()),
        status: Set(BillStatus::Pending),
        is_custom: Set(false),
        payment_token: Set(None),
        description: Set(None),
        sent_at: Set(None),
        paid_at: Set(None),
        created_by: Set(None),
        created_at: Set(seeded_at()),
        updated_at: Set(seeded_at()),
        ..Default::default()
    }
    .insert(db)
    .await
    .map_err(Into::into)
}

/// All bills of a package, oldest first.
pub async fn bills_for_package(db: &DatabaseConnection, package_id: i64) -> Result<Vec<bill::Model>> {
    Bill::find()
        .filter(bill::Column::PackageId.eq(package_id))
        .order_by_asc(bill::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}
