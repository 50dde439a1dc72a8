//! Class lifecycle - Status transitions and their ledger side effects.
//!
//! A pending class resolves to attended, cancelled (by student or teacher) or
//! absent. Each transition runs as one transaction under the student's lock:
//!
//! | Target               | Deducts hours | Bills |
//! |----------------------|---------------|-------|
//! | attended             | yes           | yes   |
//! | cancelled_by_student | yes           | no    |
//! | cancelled_by_teacher | no            | no    |
//! | absent_student       | yes           | yes   |
//!
//! Bill creation runs in a savepoint. When it fails the savepoint is rolled
//! back and logged, but the status change and deduction still commit.

use crate::{
    config::billing::BillingSettings,
    core::{
        billing,
        context::LedgerContext,
        package::{self, package_can_absorb},
    },
    entities::{ClassRecord, ClassStatus, PackageStatus, bill, class_record, package as package_entity},
    errors::{Error, Result},
};
use chrono::{DateTime, Utc};
use sea_orm::{DatabaseTransaction, Set, TransactionTrait, prelude::*};
use serde::Serialize;
use tracing::{info, warn};

/// A class after a transition, with the package and bill it touched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionOutcome {
    /// The class as stored after the transition
    pub class: class_record::Model,
    /// The package the class is now linked to, as stored after deduction
    pub package: Option<package_entity::Model>,
    /// The pending bill now covering the class
    pub bill: Option<bill::Model>,
}

struct AppliedTransition {
    outcome: TransitionOutcome,
    finished_package: Option<i64>,
}

/// Finds a class by id.
pub async fn get_class_by_id<C>(db: &C, class_id: i64) -> Result<Option<class_record::Model>>
where
    C: ConnectionTrait,
{
    ClassRecord::find_by_id(class_id)
        .one(db)
        .await
        .map_err(Into::into)
}

pub(crate) async fn require_class<C>(db: &C, class_id: i64) -> Result<class_record::Model>
where
    C: ConnectionTrait,
{
    get_class_by_id(db, class_id)
        .await?
        .ok_or_else(|| Error::not_found("class", class_id))
}

/// The package a resolving class should count against: its own package while
/// that is still active, else the student's active package.
async fn resolve_open_package<C>(
    db: &C,
    class: &class_record::Model,
) -> Result<Option<package_entity::Model>>
where
    C: ConnectionTrait,
{
    if let Some(package_id) = class.package_id {
        if let Some(own) = package::get_package_by_id(db, package_id).await? {
            if own.status == PackageStatus::Active {
                return Ok(Some(own));
            }
        }
    }
    package::get_active_package(db, class.student_id).await
}

async fn bill_in_savepoint(
    txn: &DatabaseTransaction,
    settings: &BillingSettings,
    class: &class_record::Model,
    actor_id: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Option<bill::Model>> {
    let savepoint = txn.begin().await?;
    match billing::accumulate_bill(&savepoint, settings, class, actor_id, now).await {
        Ok(billed) => {
            savepoint.commit().await?;
            Ok(Some(billed))
        }
        Err(e) => {
            warn!(class_id = class.id, error = %e, "Bill creation failed; attendance kept");
            savepoint.rollback().await?;
            Ok(None)
        }
    }
}

async fn apply_transition(
    txn: &DatabaseTransaction,
    settings: &BillingSettings,
    class_id: i64,
    new_status: ClassStatus,
    reason: Option<String>,
    actor_id: Option<i64>,
    now: DateTime<Utc>,
) -> Result<AppliedTransition> {
    let class = require_class(txn, class_id).await?;
    if class.status != ClassStatus::Pending {
        return Err(Error::state(format!(
            "class {class_id} is {:?}; only pending classes can change status",
            class.status
        )));
    }

    let hours = class.duration_hours();
    let (status, mut linked) = match new_status {
        ClassStatus::CancelledByTeacher => (new_status, resolve_open_package(txn, &class).await?),
        ClassStatus::Attended | ClassStatus::CancelledByStudent | ClassStatus::AbsentStudent => {
            let absorbing = resolve_open_package(txn, &class)
                .await?
                .filter(|pkg| package_can_absorb(pkg, hours));
            if absorbing.is_some() {
                (new_status, absorbing)
            } else {
                info!(class_id, "No package can absorb the class; moved to waiting list");
                (ClassStatus::WaitingList, None)
            }
        }
        ClassStatus::Pending | ClassStatus::WaitingList => {
            return Err(Error::state(format!(
                "{new_status:?} is not a valid transition target"
            )));
        }
    };

    let mut active_model: class_record::ActiveModel = class.into();
    active_model.status = Set(status);
    active_model.package_id = Set(linked.as_ref().map(|pkg| pkg.id));
    active_model.updated_at = Set(now);
    if status.is_cancellation() {
        active_model.cancellation_reason = Set(reason);
        active_model.cancelled_by = Set(actor_id);
        active_model.cancelled_at = Set(Some(now));
    }
    let updated = active_model.update(txn).await?;

    let mut finished_package = None;
    if status.consumes_hours() {
        if let Some(package_id) = linked.as_ref().map(|pkg| pkg.id) {
            let deduction = package::apply_deduction(txn, package_id, hours, now).await?;
            if deduction.finished {
                finished_package = Some(package_id);
            }
            linked = package::get_package_by_id(txn, package_id).await?;
        }
    }

    let billed = if status.is_billable() {
        bill_in_savepoint(txn, settings, &updated, actor_id, now).await?
    } else {
        None
    };

    Ok(AppliedTransition {
        outcome: TransitionOutcome {
            class: updated,
            package: linked,
            bill: billed,
        },
        finished_package,
    })
}

/// Moves a pending class to a resolved status and applies the package and
/// billing effects of that status.
///
/// A target of `pending` is a no-op that returns the class as stored. When no
/// package can absorb a class that should consume hours, the class goes to
/// the waiting list instead and nothing is deducted or billed.
///
/// Any failure other than bill creation rolls back the whole transition.
pub async fn transition_class_status(
    ctx: &LedgerContext,
    class_id: i64,
    new_status: ClassStatus,
    reason: Option<String>,
    actor_id: Option<i64>,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome> {
    const OPERATION: &str = "transition_class_status";

    let class = require_class(&ctx.database, class_id).await?;
    if new_status == ClassStatus::Pending {
        return Ok(TransitionOutcome {
            class,
            package: None,
            bill: None,
        });
    }

    let _guard = ctx.locks.acquire(class.student_id).await;
    let txn = ctx.database.begin().await?;
    let applied = apply_transition(
        &txn,
        &ctx.settings,
        class_id,
        new_status,
        reason,
        actor_id,
        now,
    )
    .await
    .map_err(|e| e.in_transaction(OPERATION))?;
    txn.commit()
        .await
        .map_err(|e| Error::from(e).in_transaction(OPERATION))?;

    info!(
        class_id,
        status = ?applied.outcome.class.status,
        package_id = ?applied.outcome.class.package_id,
        "Class status changed"
    );

    if let Some(package_id) = applied.finished_package {
        billing::notify_finished_packages(ctx, &[package_id], now).await;
    }
    Ok(applied.outcome)
}
