//! Package allocation - Round lifecycle, hour deduction and waiting-list admission.
//!
//! A student owns a sequence of package rounds. At most one of them is active at
//! a time; activating a new round or reactivating a finished one force-finishes
//! whatever round was active before. Deductions consume hours from the active
//! round and finish it when nothing is left, at which point the round's pending
//! bills are sent out as a payment request (best-effort, after commit).
//!
//! Functions generic over `C: ConnectionTrait` run inside a caller's
//! transaction and never take the student lock. The public `LedgerContext`
//! operations take the lock, open the transaction and commit it.

use crate::{
    core::{billing, context::LedgerContext, lifecycle},
    entities::{ClassRecord, ClassStatus, Package, PackageStatus, Student, class_record, package},
    errors::{Error, Result},
};
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::{QueryOrder, Set, TransactionTrait, prelude::*, sea_query::Expr};
use tracing::{debug, info};

/// Tolerance used when comparing hour quantities.
pub const HOUR_EPSILON: f64 = 1e-9;

/// Arguments for opening a new package round.
#[derive(Debug, Clone)]
pub struct NewRound {
    /// Student buying the round
    pub student_id: i64,
    /// Hours purchased; must be positive
    pub total_hours: f64,
    /// Price per hour
    pub hour_price: f64,
    /// ISO currency code
    pub currency: String,
    /// First valid day of the round
    pub start_date: NaiveDate,
}

/// Values replacing a finished package's terms on reactivation. Anything left
/// empty keeps the package's current value; `remaining_hours` defaults to the
/// effective `total_hours`.
#[derive(Debug, Clone, Default)]
pub struct ReactivateOverrides {
    /// New purchased hours
    pub total_hours: Option<f64>,
    /// New remaining hours
    pub remaining_hours: Option<f64>,
    /// New price per hour
    pub hour_price: Option<f64>,
    /// New currency
    pub currency: Option<String>,
    /// New start date
    pub start_date: Option<NaiveDate>,
}

/// Result of applying one deduction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deduction {
    /// The package was mutated
    pub applied: bool,
    /// This deduction moved the package from active to finished
    pub finished: bool,
}

/// Result of draining a student's waiting list into a package.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitingListDrain {
    /// Classes admitted into the package
    pub processed: usize,
    /// The drain exhausted the package
    pub finished: bool,
}

/// Rounds an hour quantity to four decimals to keep float drift out of the
/// ledger.
#[must_use]
pub fn round_hours(hours: f64) -> f64 {
    (hours * 10_000.0).round() / 10_000.0
}

fn validate_positive_hours(hours: f64, field: &str) -> Result<()> {
    if !hours.is_finite() || hours <= 0.0 {
        return Err(Error::validation(format!(
            "{field} must be greater than zero (got {hours})"
        )));
    }
    Ok(())
}

/// Decision rule for admitting a class of `duration_hours` into a package.
///
/// Finished and paid packages never admit anything. Hour-tracked packages need
/// enough remaining hours; legacy class-count packages need one class left.
#[must_use]
pub fn package_can_absorb(package: &package::Model, duration_hours: f64) -> bool {
    if package.status != PackageStatus::Active {
        return false;
    }
    if package.is_hour_tracked() {
        package.remaining_hours + HOUR_EPSILON >= duration_hours
    } else {
        package.remaining_classes.unwrap_or(0) > 0
    }
}

/// Finds a package by id.
pub async fn get_package_by_id<C>(db: &C, package_id: i64) -> Result<Option<package::Model>>
where
    C: ConnectionTrait,
{
    Package::find_by_id(package_id)
        .one(db)
        .await
        .map_err(Into::into)
}

pub(crate) async fn require_package<C>(db: &C, package_id: i64) -> Result<package::Model>
where
    C: ConnectionTrait,
{
    get_package_by_id(db, package_id)
        .await?
        .ok_or_else(|| Error::not_found("package", package_id))
}

/// The student's active package, if any.
pub async fn get_active_package<C>(db: &C, student_id: i64) -> Result<Option<package::Model>>
where
    C: ConnectionTrait,
{
    Package::find()
        .filter(package::Column::StudentId.eq(student_id))
        .filter(package::Column::Status.eq(PackageStatus::Active))
        .order_by_desc(package::Column::RoundNumber)
        .one(db)
        .await
        .map_err(Into::into)
}

/// All of a student's packages, oldest round first.
pub async fn get_student_packages<C>(db: &C, student_id: i64) -> Result<Vec<package::Model>>
where
    C: ConnectionTrait,
{
    Package::find()
        .filter(package::Column::StudentId.eq(student_id))
        .order_by_asc(package::Column::RoundNumber)
        .all(db)
        .await
        .map_err(Into::into)
}

async fn next_round_number<C>(db: &C, student_id: i64) -> Result<i32>
where
    C: ConnectionTrait,
{
    let latest = Package::find()
        .filter(package::Column::StudentId.eq(student_id))
        .order_by_desc(package::Column::RoundNumber)
        .one(db)
        .await?;
    Ok(latest.map_or(1, |p| p.round_number + 1))
}

/// Force-finishes every active package of the student except `keep`.
/// Returns the ids of the packages that were finished.
async fn finish_active_packages<C>(
    db: &C,
    student_id: i64,
    keep: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Vec<i64>>
where
    C: ConnectionTrait,
{
    let active = Package::find()
        .filter(package::Column::StudentId.eq(student_id))
        .filter(package::Column::Status.eq(PackageStatus::Active))
        .all(db)
        .await?;

    let mut finished = Vec::new();
    for pkg in active {
        if Some(pkg.id) == keep {
            continue;
        }
        let id = pkg.id;
        let legacy = !pkg.is_hour_tracked();
        let mut active_model: package::ActiveModel = pkg.into();
        active_model.remaining_hours = Set(0.0);
        if legacy {
            active_model.remaining_classes = Set(Some(0));
        }
        active_model.status = Set(PackageStatus::Finished);
        active_model.updated_at = Set(now);
        active_model.update(db).await?;
        info!(package_id = id, student_id, "Force-finished active package");
        finished.push(id);
    }
    Ok(finished)
}

/// Subtracts hours from a package inside the caller's transaction.
///
/// The subtraction is a single clamped `UPDATE` so the stored value never goes
/// negative. Finished or paid packages, and packages with nothing left, are
/// left untouched and reported as not applied.
pub async fn apply_deduction<C>(
    db: &C,
    package_id: i64,
    duration_hours: f64,
    now: DateTime<Utc>,
) -> Result<Deduction>
where
    C: ConnectionTrait,
{
    let pkg = require_package(db, package_id).await?;
    if pkg.status != PackageStatus::Active {
        debug!(package_id, status = ?pkg.status, "Deduction skipped for inactive package");
        return Ok(Deduction::default());
    }

    if pkg.is_hour_tracked() {
        if pkg.remaining_hours <= HOUR_EPSILON {
            return Ok(Deduction::default());
        }
        let remaining = Expr::col(package::Column::RemainingHours);
        Package::update_many()
            .col_expr(
                package::Column::RemainingHours,
                Expr::case(
                    remaining.clone().gt(duration_hours),
                    remaining.sub(duration_hours),
                )
                .finally(0.0)
                .into(),
            )
            .col_expr(package::Column::UpdatedAt, Expr::value(now))
            .filter(package::Column::Id.eq(package_id))
            .exec(db)
            .await?;
    } else {
        if pkg.remaining_classes.unwrap_or(0) <= 0 {
            return Ok(Deduction::default());
        }
        Package::update_many()
            .col_expr(
                package::Column::RemainingClasses,
                Expr::col(package::Column::RemainingClasses).sub(1),
            )
            .col_expr(package::Column::UpdatedAt, Expr::value(now))
            .filter(package::Column::Id.eq(package_id))
            .exec(db)
            .await?;
    }

    let updated = require_package(db, package_id).await?;
    let exhausted = if updated.is_hour_tracked() {
        updated.remaining_hours <= HOUR_EPSILON
    } else {
        updated.remaining_classes.unwrap_or(0) <= 0
    };

    if exhausted {
        let mut active_model: package::ActiveModel = updated.into();
        active_model.remaining_hours = Set(0.0);
        active_model.status = Set(PackageStatus::Finished);
        active_model.updated_at = Set(now);
        active_model.update(db).await?;
        info!(package_id, "Package exhausted and finished");
    }

    Ok(Deduction {
        applied: true,
        finished: exhausted,
    })
}

/// Drains the student's waiting list into a package inside the caller's
/// transaction.
///
/// Classes are admitted oldest first by `(class_date, start_time)`. The first
/// class that does not fit stops the drain; later, smaller classes are not
/// tried. Admitted classes become `attended` and consume hours.
pub async fn drain_waiting_list<C>(
    db: &C,
    student_id: i64,
    package_id: i64,
    now: DateTime<Utc>,
) -> Result<WaitingListDrain>
where
    C: ConnectionTrait,
{
    let waiting = ClassRecord::find()
        .filter(class_record::Column::StudentId.eq(student_id))
        .filter(class_record::Column::Status.eq(ClassStatus::WaitingList))
        .order_by_asc(class_record::Column::ClassDate)
        .order_by_asc(class_record::Column::StartTime)
        .order_by_asc(class_record::Column::Id)
        .all(db)
        .await?;

    let mut drain = WaitingListDrain::default();
    for class in waiting {
        let pkg = require_package(db, package_id).await?;
        let hours = class.duration_hours();
        if !package_can_absorb(&pkg, hours) {
            debug!(
                class_id = class.id,
                package_id, hours, "Waiting list drain stopped at a class that does not fit"
            );
            break;
        }

        let class_id = class.id;
        let mut active_model: class_record::ActiveModel = class.into();
        active_model.package_id = Set(Some(package_id));
        active_model.status = Set(ClassStatus::Attended);
        active_model.updated_at = Set(now);
        active_model.update(db).await?;

        let deduction = apply_deduction(db, package_id, hours, now).await?;
        drain.processed += 1;
        drain.finished |= deduction.finished;
        debug!(class_id, package_id, "Admitted waiting class into package");
    }
    Ok(drain)
}

async fn open_round<C>(
    db: &C,
    round: &NewRound,
    now: DateTime<Utc>,
) -> Result<(package::Model, Vec<i64>)>
where
    C: ConnectionTrait,
{
    Student::find_by_id(round.student_id)
        .one(db)
        .await?
        .ok_or_else(|| Error::not_found("student", round.student_id))?;

    let mut finished = finish_active_packages(db, round.student_id, None, now).await?;
    let round_number = next_round_number(db, round.student_id).await?;

    let created = package::ActiveModel {
        student_id: Set(round.student_id),
        round_number: Set(round_number),
        total_hours: Set(round.total_hours),
        remaining_hours: Set(round.total_hours),
        total_classes: Set(None),
        remaining_classes: Set(None),
        hour_price: Set(round.hour_price),
        currency: Set(round.currency.trim().to_string()),
        status: Set(PackageStatus::Active),
        start_date: Set(round.start_date),
        last_notification_sent: Set(None),
        notification_count: Set(0),
        paid_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;

    let drain = drain_waiting_list(db, round.student_id, created.id, now).await?;
    if drain.finished {
        finished.push(created.id);
    }
    info!(
        package_id = created.id,
        student_id = round.student_id,
        round_number,
        drained = drain.processed,
        "Activated new package round"
    );

    let refreshed = require_package(db, created.id).await?;
    Ok((refreshed, finished))
}

/// Opens a new package round for a student.
///
/// Every package currently active for the student is force-finished and a
/// new active round is created with the next round number. The student's
/// waiting list is drained into it in the same transaction. Payment requests
/// for the finished rounds go out after commit on a best-effort basis.
pub async fn activate_new_round(
    ctx: &LedgerContext,
    round: NewRound,
    now: DateTime<Utc>,
) -> Result<package::Model> {
    const OPERATION: &str = "activate_new_round";

    validate_positive_hours(round.total_hours, "total_hours")?;
    if !round.hour_price.is_finite() || round.hour_price < 0.0 {
        return Err(Error::validation("hour_price cannot be negative"));
    }

    let _guard = ctx.locks.acquire(round.student_id).await;
    let txn = ctx.database.begin().await?;
    let (created, finished) = open_round(&txn, &round, now)
        .await
        .map_err(|e| e.in_transaction(OPERATION))?;
    txn.commit()
        .await
        .map_err(|e| Error::from(e).in_transaction(OPERATION))?;

    billing::notify_finished_packages(ctx, &finished, now).await;
    Ok(created)
}

/// Deducts hours from a package.
///
/// Returns `false` without changing anything when the package is not active
/// or has nothing left. The stored remaining hours are clamped at zero and a
/// package reaching zero becomes finished; when this call finished it and
/// `notify` is set, its outstanding bills are sent as a payment request.
///
/// Callers must deduct a given class at most once.
pub async fn deduct_class(
    ctx: &LedgerContext,
    package_id: i64,
    duration_hours: f64,
    notify: bool,
    now: DateTime<Utc>,
) -> Result<bool> {
    const OPERATION: &str = "deduct_class";

    validate_positive_hours(duration_hours, "duration_hours")?;
    let pkg = require_package(&ctx.database, package_id).await?;

    let _guard = ctx.locks.acquire(pkg.student_id).await;
    let txn = ctx.database.begin().await?;
    let deduction = apply_deduction(&txn, package_id, duration_hours, now)
        .await
        .map_err(|e| e.in_transaction(OPERATION))?;
    txn.commit()
        .await
        .map_err(|e| Error::from(e).in_transaction(OPERATION))?;

    if deduction.finished && notify {
        billing::notify_finished_packages(ctx, &[package_id], now).await;
    }
    Ok(deduction.applied)
}

/// Deducts a class's duration from the package it is linked to.
///
/// Classes cancelled by the teacher and classes without a package deduct
/// nothing and return `false`.
pub async fn deduct_for_class(
    ctx: &LedgerContext,
    class_id: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let class = lifecycle::require_class(&ctx.database, class_id).await?;
    if class.status == ClassStatus::CancelledByTeacher {
        return Ok(false);
    }
    let Some(package_id) = class.package_id else {
        debug!(class_id, "Class has no package; nothing to deduct");
        return Ok(false);
    };
    deduct_class(ctx, package_id, class.duration_hours(), true, now).await
}

/// Checks, against the package's current state, whether a class of
/// `duration_hours` fits into it.
pub async fn can_add_class_to_package<C>(db: &C, package_id: i64, duration_hours: f64) -> Result<bool>
where
    C: ConnectionTrait,
{
    let pkg = require_package(db, package_id).await?;
    Ok(package_can_absorb(&pkg, duration_hours))
}

/// Admission gate applied at schedule time.
///
/// The class becomes `pending` when its package (or, lacking one, the
/// student's active package) can absorb it, and `waiting_list` otherwise.
/// Waiting classes are unlinked from any package.
pub async fn add_class_to_package(
    ctx: &LedgerContext,
    class_id: i64,
    now: DateTime<Utc>,
) -> Result<class_record::Model> {
    let db = &ctx.database;
    let class = lifecycle::require_class(db, class_id).await?;

    let target = match class.package_id {
        Some(package_id) => get_package_by_id(db, package_id).await?,
        None => get_active_package(db, class.student_id).await?,
    };
    let fits = target
        .as_ref()
        .is_some_and(|pkg| package_can_absorb(pkg, class.duration_hours()));
    let status = if fits {
        ClassStatus::Pending
    } else {
        ClassStatus::WaitingList
    };

    let mut active_model: class_record::ActiveModel = class.into();
    active_model.status = Set(status);
    if status == ClassStatus::WaitingList {
        active_model.package_id = Set(None);
    }
    active_model.updated_at = Set(now);
    let updated = active_model.update(db).await?;
    debug!(class_id, ?status, "Class admission decided");
    Ok(updated)
}

/// Drains a student's waiting list into one of their packages.
///
/// Returns how many classes were admitted.
pub async fn process_waiting_list_for_student(
    ctx: &LedgerContext,
    student_id: i64,
    package_id: i64,
    now: DateTime<Utc>,
) -> Result<usize> {
    const OPERATION: &str = "process_waiting_list_for_student";

    let pkg = require_package(&ctx.database, package_id).await?;
    if pkg.student_id != student_id {
        return Err(Error::validation(format!(
            "package {package_id} does not belong to student {student_id}"
        )));
    }

    let _guard = ctx.locks.acquire(student_id).await;
    let txn = ctx.database.begin().await?;
    let drain = drain_waiting_list(&txn, student_id, package_id, now)
        .await
        .map_err(|e| e.in_transaction(OPERATION))?;
    txn.commit()
        .await
        .map_err(|e| Error::from(e).in_transaction(OPERATION))?;

    if drain.finished {
        billing::notify_finished_packages(ctx, &[package_id], now).await;
    }
    info!(student_id, package_id, processed = drain.processed, "Processed waiting list");
    Ok(drain.processed)
}

async fn reopen_round<C>(
    db: &C,
    package_id: i64,
    overrides: ReactivateOverrides,
    now: DateTime<Utc>,
) -> Result<(package::Model, Vec<i64>)>
where
    C: ConnectionTrait,
{
    let pkg = require_package(db, package_id).await?;
    if pkg.status != PackageStatus::Finished {
        return Err(Error::state(format!(
            "package {package_id} is not finished"
        )));
    }

    let total_hours = overrides.total_hours.unwrap_or(pkg.total_hours);
    if !total_hours.is_finite() || total_hours <= 0.0 {
        return Err(Error::validation(
            "total_hours is required to reactivate a package",
        ));
    }
    let remaining_hours = overrides.remaining_hours.unwrap_or(total_hours);
    validate_positive_hours(remaining_hours, "remaining_hours")?;
    let hour_price = overrides.hour_price.unwrap_or(pkg.hour_price);
    if !hour_price.is_finite() || hour_price < 0.0 {
        return Err(Error::validation("hour_price cannot be negative"));
    }

    let student_id = pkg.student_id;
    let mut finished = finish_active_packages(db, student_id, Some(package_id), now).await?;

    let currency = overrides.currency.unwrap_or_else(|| pkg.currency.clone());
    let start_date = overrides.start_date.unwrap_or(pkg.start_date);
    let mut active_model: package::ActiveModel = pkg.into();
    active_model.total_hours = Set(total_hours);
    active_model.remaining_hours = Set(remaining_hours);
    active_model.hour_price = Set(hour_price);
    active_model.currency = Set(currency);
    active_model.start_date = Set(start_date);
    active_model.status = Set(PackageStatus::Active);
    active_model.updated_at = Set(now);
    active_model.update(db).await?;

    let drain = drain_waiting_list(db, student_id, package_id, now).await?;
    if drain.finished {
        finished.push(package_id);
    }
    info!(
        package_id,
        student_id,
        drained = drain.processed,
        "Reactivated package"
    );

    let refreshed = require_package(db, package_id).await?;
    Ok((refreshed, finished))
}

/// Reactivates a finished package, optionally with new terms, then drains the
/// student's waiting list into it. All mutations commit together or not at
/// all.
pub async fn reactivate_package(
    ctx: &LedgerContext,
    package_id: i64,
    overrides: ReactivateOverrides,
    now: DateTime<Utc>,
) -> Result<package::Model> {
    const OPERATION: &str = "reactivate_package";

    let pkg = require_package(&ctx.database, package_id).await?;
    let _guard = ctx.locks.acquire(pkg.student_id).await;
    let txn = ctx.database.begin().await?;
    let (reopened, finished) = reopen_round(&txn, package_id, overrides, now)
        .await
        .map_err(|e| e.in_transaction(OPERATION))?;
    txn.commit()
        .await
        .map_err(|e| Error::from(e).in_transaction(OPERATION))?;

    billing::notify_finished_packages(ctx, &finished, now).await;
    Ok(reopened)
}
