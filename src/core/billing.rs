//! Billing accumulation - Pending invoices, payment requests and settlement.
//!
//! Billable classes (attended or student absent) accumulate into a single
//! pending, system-generated bill per package and student. When a package
//! finishes, its outstanding bills are sent to the student as one payment
//! request. Sending is best-effort: it runs after the ledger commit and its
//! failures never undo that commit.

use crate::{
    config::billing::BillingSettings,
    core::{
        context::LedgerContext,
        lifecycle,
        notification::{self, PaymentLine, PaymentRequest},
        package::{self, HOUR_EPSILON, round_hours},
        side_effect::best_effort,
    },
    entities::{
        Bill, BillStatus, ClassIds, Package, PackageStatus, Student, Teacher, bill,
        class_record, package as package_entity,
    },
    errors::{Error, Result},
};
use chrono::{DateTime, Utc};
use sea_orm::{QueryOrder, Set, TransactionTrait, prelude::*, sea_query::Expr};
use serde::Serialize;
use tracing::{debug, info};

/// Rounds a money amount to cents.
#[must_use]
pub fn round_money(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Aggregate billing figures for one package.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillsSummary {
    /// Contracted value of the round: total hours times hour price
    pub total_amount: f64,
    /// Contracted value not yet covered by paid bills, never negative
    pub unpaid_amount: f64,
    /// Number of bills under the package
    pub bill_count: usize,
    /// Currency of the package
    pub currency: String,
    /// Hours purchased
    pub total_hours: f64,
    /// Price per hour
    pub hour_price: f64,
}

/// What happened when a payment request was attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    /// The request was delivered and these bills are now `sent`
    Sent {
        /// Bills included in the request
        bill_ids: Vec<i64>,
    },
    /// The package had no outstanding bills
    Skipped,
}

/// Arguments for a manually created bill.
#[derive(Debug, Clone)]
pub struct CustomBill {
    /// Student being billed
    pub student_id: i64,
    /// Package the charge relates to, if any
    pub package_id: Option<i64>,
    /// Teacher the charge relates to, if any
    pub teacher_id: Option<i64>,
    /// Hours the charge covers
    pub total_hours: f64,
    /// Amount due
    pub amount: f64,
    /// Currency; falls back to the student's, then the configured default
    pub currency: Option<String>,
    /// Free-text description
    pub description: Option<String>,
    /// Actor creating the bill
    pub actor_id: Option<i64>,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// The package a class is billed against: its own package, else the student's
/// active package, else the student's latest round.
async fn resolve_billing_package<C>(
    db: &C,
    class: &class_record::Model,
) -> Result<Option<package_entity::Model>>
where
    C: ConnectionTrait,
{
    if let Some(package_id) = class.package_id {
        if let Some(pkg) = package::get_package_by_id(db, package_id).await? {
            return Ok(Some(pkg));
        }
    }
    if let Some(active) = package::get_active_package(db, class.student_id).await? {
        return Ok(Some(active));
    }
    Package::find()
        .filter(package_entity::Column::StudentId.eq(class.student_id))
        .order_by_desc(package_entity::Column::RoundNumber)
        .one(db)
        .await
        .map_err(Into::into)
}

/// Adds a billable class to the package's pending bill inside the caller's
/// transaction, creating the bill if there is none.
///
/// A class already present on the pending bill is not counted again.
pub async fn accumulate_bill<C>(
    db: &C,
    settings: &BillingSettings,
    class: &class_record::Model,
    actor_id: Option<i64>,
    now: DateTime<Utc>,
) -> Result<bill::Model>
where
    C: ConnectionTrait,
{
    if !class.status.is_billable() {
        return Err(Error::state(format!(
            "class {} is {:?}; only attended or absent classes are billed",
            class.id, class.status
        )));
    }

    let pkg = resolve_billing_package(db, class).await?;
    let student = Student::find_by_id(class.student_id)
        .one(db)
        .await?
        .ok_or_else(|| Error::not_found("student", class.student_id))?;

    let hourly_price = match pkg.as_ref() {
        Some(p) if p.hour_price > 0.0 => p.hour_price,
        _ => Teacher::find_by_id(class.teacher_id)
            .one(db)
            .await?
            .map(|t| t.hourly_rate)
            .filter(|rate| *rate > 0.0)
            .unwrap_or(0.0),
    };
    let hours = class.duration_hours();
    let amount = round_money(hours * hourly_price);
    let currency = pkg
        .as_ref()
        .and_then(|p| non_empty(Some(p.currency.as_str())))
        .or_else(|| non_empty(student.currency.as_deref()))
        .unwrap_or_else(|| settings.default_currency.clone());
    let package_id = pkg.as_ref().map(|p| p.id);

    let package_filter = match package_id {
        Some(id) => bill::Column::PackageId.eq(id),
        None => bill::Column::PackageId.is_null(),
    };
    let pending = Bill::find()
        .filter(package_filter)
        .filter(bill::Column::StudentId.eq(class.student_id))
        .filter(bill::Column::IsCustom.eq(false))
        .filter(bill::Column::Status.eq(BillStatus::Pending))
        .order_by_asc(bill::Column::Id)
        .one(db)
        .await?;

    match pending {
        Some(existing) if existing.class_ids.contains(class.id) => {
            debug!(bill_id = existing.id, class_id = class.id, "Class already on pending bill");
            Ok(existing)
        }
        Some(existing) => {
            let bill_id = existing.id;
            let mut class_ids = existing.class_ids.clone();
            class_ids.insert(class.id);
            let total_hours = round_hours(existing.total_hours + hours);
            let merged_amount = round_money(existing.amount + amount);
            let keep_currency = !existing.currency.trim().is_empty();

            let mut active_model: bill::ActiveModel = existing.into();
            active_model.class_ids = Set(class_ids);
            active_model.total_hours = Set(total_hours);
            active_model.amount = Set(merged_amount);
            if !keep_currency {
                active_model.currency = Set(currency);
            }
            active_model.updated_at = Set(now);
            let merged = active_model.update(db).await?;
            debug!(bill_id, class_id = class.id, amount, "Merged class into pending bill");
            Ok(merged)
        }
        None => {
            let created = bill::ActiveModel {
                package_id: Set(package_id),
                student_id: Set(class.student_id),
                teacher_id: Set(Some(class.teacher_id)),
                class_ids: Set(ClassIds::single(class.id)),
                total_hours: Set(round_hours(hours)),
                amount: Set(amount),
                currency: Set(currency),
                status: Set(BillStatus::Pending),
                is_custom: Set(false),
                payment_token: Set(None),
                description: Set(None),
                sent_at: Set(None),
                paid_at: Set(None),
                created_by: Set(actor_id),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            }
            .insert(db)
            .await?;
            info!(bill_id = created.id, class_id = class.id, ?package_id, "Opened pending bill");
            Ok(created)
        }
    }
}

/// Bills a class that is attended or marked absent.
///
/// Returns the pending bill now covering the class.
pub async fn create_bill_for_class(
    ctx: &LedgerContext,
    class_id: i64,
    now: DateTime<Utc>,
) -> Result<bill::Model> {
    const OPERATION: &str = "create_bill_for_class";

    let txn = ctx.database.begin().await?;
    let class = lifecycle::require_class(&txn, class_id).await?;
    let billed = accumulate_bill(&txn, &ctx.settings, &class, None, now)
        .await
        .map_err(|e| e.in_transaction(OPERATION))?;
    txn.commit()
        .await
        .map_err(|e| Error::from(e).in_transaction(OPERATION))?;
    Ok(billed)
}

/// Creates a manual bill. Custom bills are never merged with other bills.
pub async fn create_custom_bill(
    ctx: &LedgerContext,
    custom: CustomBill,
    now: DateTime<Utc>,
) -> Result<bill::Model> {
    if !custom.amount.is_finite() || custom.amount < 0.0 {
        return Err(Error::validation("amount must be a non-negative number"));
    }
    if !custom.total_hours.is_finite() || custom.total_hours < 0.0 {
        return Err(Error::validation("total_hours cannot be negative"));
    }

    let db = &ctx.database;
    let student = Student::find_by_id(custom.student_id)
        .one(db)
        .await?
        .ok_or_else(|| Error::not_found("student", custom.student_id))?;
    if let Some(package_id) = custom.package_id {
        package::require_package(db, package_id).await?;
    }

    let currency = non_empty(custom.currency.as_deref())
        .or_else(|| non_empty(student.currency.as_deref()))
        .unwrap_or_else(|| ctx.settings.default_currency.clone());

    let created = bill::ActiveModel {
        package_id: Set(custom.package_id),
        student_id: Set(custom.student_id),
        teacher_id: Set(custom.teacher_id),
        class_ids: Set(ClassIds::default()),
        total_hours: Set(round_hours(custom.total_hours)),
        amount: Set(round_money(custom.amount)),
        currency: Set(currency),
        status: Set(BillStatus::Pending),
        is_custom: Set(true),
        payment_token: Set(None),
        description: Set(custom.description),
        sent_at: Set(None),
        paid_at: Set(None),
        created_by: Set(custom.actor_id),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;
    info!(bill_id = created.id, student_id = custom.student_id, "Created custom bill");
    Ok(created)
}

/// Issues a token for a bill that has none, retrying until one is unused.
async fn assign_payment_token<C>(
    db: &C,
    settings: &BillingSettings,
    target: bill::Model,
    now: DateTime<Utc>,
) -> Result<bill::Model>
where
    C: ConnectionTrait,
{
    for _ in 0..settings.token_attempts.max(1) {
        let token = notification::generate_payment_token(&settings.payment_token_prefix);
        let taken = Bill::find()
            .filter(bill::Column::PaymentToken.eq(token.as_str()))
            .count(db)
            .await?;
        if taken == 0 {
            let mut active_model: bill::ActiveModel = target.into();
            active_model.payment_token = Set(Some(token));
            active_model.updated_at = Set(now);
            return active_model.update(db).await.map_err(Into::into);
        }
    }
    Err(Error::state(format!(
        "could not issue a unique payment token for bill {}",
        target.id
    )))
}

/// Sends the outstanding (pending or sent) bills of a package to the student
/// as one payment request.
///
/// Bills without a payment token get one first. On successful delivery every
/// included bill becomes `sent` and the package's notification counters move
/// forward. A missing recipient address or a rejected dispatch is reported as
/// [`Error::Notification`].
pub async fn send_automatic_bill_notification(
    ctx: &LedgerContext,
    package_id: i64,
    now: DateTime<Utc>,
) -> Result<NotificationOutcome> {
    const OPERATION: &str = "send_automatic_bill_notification";
    let db = &ctx.database;

    let pkg = package::require_package(db, package_id).await?;
    let student = Student::find_by_id(pkg.student_id)
        .one(db)
        .await?
        .ok_or_else(|| Error::not_found("student", pkg.student_id))?;

    let outstanding = Bill::find()
        .filter(bill::Column::PackageId.eq(package_id))
        .filter(bill::Column::Status.is_in([BillStatus::Pending, BillStatus::Sent]))
        .order_by_asc(bill::Column::Id)
        .all(db)
        .await?;
    if outstanding.is_empty() {
        debug!(package_id, "No outstanding bills; payment request skipped");
        return Ok(NotificationOutcome::Skipped);
    }

    let recipient = non_empty(student.whatsapp.as_deref()).ok_or_else(|| Error::Notification {
        message: format!("student {} has no messaging address", student.id),
    })?;

    let txn = db.begin().await?;
    let mut tokened = Vec::with_capacity(outstanding.len());
    for item in outstanding {
        if item.payment_token.is_some() {
            tokened.push(item);
        } else {
            let issued = assign_payment_token(&txn, &ctx.settings, item, now)
                .await
                .map_err(|e| e.in_transaction(OPERATION))?;
            tokened.push(issued);
        }
    }
    txn.commit()
        .await
        .map_err(|e| Error::from(e).in_transaction(OPERATION))?;

    let lines = tokened
        .iter()
        .map(|b| PaymentLine {
            bill_id: b.id,
            hours: b.total_hours,
            amount: b.amount,
            url: notification::payment_url(
                &ctx.settings,
                b.payment_token.as_deref().unwrap_or_default(),
            ),
        })
        .collect();
    let request = PaymentRequest {
        student_name: student.name.clone(),
        round_number: pkg.round_number,
        package_hours: pkg.total_hours,
        currency: pkg.currency.clone(),
        lines,
    };
    let body = notification::format_payment_request(&request);

    if !ctx.notifier.send(&recipient, &body).await {
        return Err(Error::Notification {
            message: format!("dispatcher rejected payment request for package {package_id}"),
        });
    }

    let bill_ids: Vec<i64> = tokened.iter().map(|b| b.id).collect();
    let txn = db.begin().await?;
    Bill::update_many()
        .col_expr(bill::Column::Status, Expr::value(BillStatus::Sent))
        .col_expr(bill::Column::SentAt, Expr::value(now))
        .col_expr(bill::Column::UpdatedAt, Expr::value(now))
        .filter(bill::Column::Id.is_in(bill_ids.clone()))
        .exec(&txn)
        .await
        .map_err(|e| Error::from(e).in_transaction(OPERATION))?;
    Package::update_many()
        .col_expr(
            package_entity::Column::NotificationCount,
            Expr::col(package_entity::Column::NotificationCount).add(1),
        )
        .col_expr(package_entity::Column::LastNotificationSent, Expr::value(now))
        .filter(package_entity::Column::Id.eq(package_id))
        .exec(&txn)
        .await
        .map_err(|e| Error::from(e).in_transaction(OPERATION))?;
    txn.commit()
        .await
        .map_err(|e| Error::from(e).in_transaction(OPERATION))?;

    info!(package_id, bills = bill_ids.len(), "Payment request sent");
    Ok(NotificationOutcome::Sent { bill_ids })
}

/// Sends payment requests for packages that just finished, swallowing and
/// logging any failure.
pub async fn notify_finished_packages(ctx: &LedgerContext, package_ids: &[i64], now: DateTime<Utc>) {
    for &package_id in package_ids {
        best_effort(
            "package_finished_notification",
            send_automatic_bill_notification(ctx, package_id, now),
        )
        .await;
    }
}

/// Billing figures for one package.
///
/// `total_amount` is the contracted value of the round (hours purchased
/// times hour price), independent of how many classes were billed so far.
pub async fn get_bills_summary<C>(db: &C, package_id: i64) -> Result<BillsSummary>
where
    C: ConnectionTrait,
{
    let pkg = package::require_package(db, package_id).await?;
    let bills = Bill::find()
        .filter(bill::Column::PackageId.eq(package_id))
        .all(db)
        .await?;

    let total_amount = round_money(pkg.total_hours * pkg.hour_price);
    let paid: f64 = bills
        .iter()
        .filter(|b| b.status == BillStatus::Paid)
        .map(|b| b.amount)
        .sum();
    let unpaid_amount = round_money((total_amount - paid).max(0.0));

    Ok(BillsSummary {
        total_amount,
        unpaid_amount,
        bill_count: bills.len(),
        currency: pkg.currency,
        total_hours: pkg.total_hours,
        hour_price: pkg.hour_price,
    })
}

/// Marks a pending or sent bill as paid.
pub async fn mark_bill_paid(
    ctx: &LedgerContext,
    bill_id: i64,
    now: DateTime<Utc>,
) -> Result<bill::Model> {
    let target = Bill::find_by_id(bill_id)
        .one(&ctx.database)
        .await?
        .ok_or_else(|| Error::not_found("bill", bill_id))?;
    if target.status == BillStatus::Paid {
        return Err(Error::state(format!("bill {bill_id} is already paid")));
    }

    let mut active_model: bill::ActiveModel = target.into();
    active_model.status = Set(BillStatus::Paid);
    active_model.paid_at = Set(Some(now));
    active_model.updated_at = Set(now);
    let paid = active_model.update(&ctx.database).await?;
    info!(bill_id, "Bill marked paid");
    Ok(paid)
}

/// Settles a finished package: the round becomes `paid` (frozen history) and
/// all of its outstanding bills are marked paid with it.
pub async fn mark_package_paid(
    ctx: &LedgerContext,
    package_id: i64,
    now: DateTime<Utc>,
) -> Result<package_entity::Model> {
    const OPERATION: &str = "mark_package_paid";

    let pkg = package::require_package(&ctx.database, package_id).await?;
    let _guard = ctx.locks.acquire(pkg.student_id).await;

    let txn = ctx.database.begin().await?;
    let settled = settle_package(&txn, package_id, now)
        .await
        .map_err(|e| e.in_transaction(OPERATION))?;
    txn.commit()
        .await
        .map_err(|e| Error::from(e).in_transaction(OPERATION))?;
    info!(package_id, "Package marked paid");
    Ok(settled)
}

async fn settle_package<C>(
    db: &C,
    package_id: i64,
    now: DateTime<Utc>,
) -> Result<package_entity::Model>
where
    C: ConnectionTrait,
{
    let pkg = package::require_package(db, package_id).await?;
    if pkg.status != PackageStatus::Finished {
        return Err(Error::state(format!(
            "package {package_id} must be finished before it is paid"
        )));
    }

    Bill::update_many()
        .col_expr(bill::Column::Status, Expr::value(BillStatus::Paid))
        .col_expr(bill::Column::PaidAt, Expr::value(now))
        .col_expr(bill::Column::UpdatedAt, Expr::value(now))
        .filter(bill::Column::PackageId.eq(package_id))
        .filter(bill::Column::Status.is_in([BillStatus::Pending, BillStatus::Sent]))
        .exec(db)
        .await?;

    let remaining = pkg.remaining_hours;
    let mut active_model: package_entity::ActiveModel = pkg.into();
    active_model.status = Set(PackageStatus::Paid);
    active_model.paid_at = Set(Some(now));
    active_model.updated_at = Set(now);
    if remaining > HOUR_EPSILON {
        active_model.remaining_hours = Set(0.0);
    }
    active_model.update(db).await.map_err(Into::into)
}

/// Resolves the suffix of a public payment URL back to its bill.
pub async fn find_bill_by_payment_token<C>(
    db: &C,
    settings: &BillingSettings,
    suffix: &str,
) -> Result<Option<bill::Model>>
where
    C: ConnectionTrait,
{
    let token = format!("{}{}", settings.payment_token_prefix, suffix);
    Bill::find()
        .filter(bill::Column::PaymentToken.eq(token))
        .one(db)
        .await
        .map_err(Into::into)
}
