//! Chronological redistribution - Recomputes which round owns which class.
//!
//! Paid rounds are frozen: their classes keep their linkage and only feed the
//! running hour counter. Active and finished rounds are then refilled greedily
//! in round order with the remaining classes, oldest first. Whatever does not
//! fit is unlinked and shown as unassigned until a new round absorbs it.

use crate::{
    core::{
        context::LedgerContext,
        package::{self, HOUR_EPSILON, round_hours},
    },
    entities::{ClassRecord, ClassStatus, PackageStatus, class_record, package as package_entity},
    errors::{Error, Result},
};
use chrono::{DateTime, Utc};
use sea_orm::{QueryOrder, TransactionTrait, prelude::*, sea_query::Expr};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info};

/// Statuses that take part in redistribution.
const CANDIDATE_STATUSES: [ClassStatus; 3] = [
    ClassStatus::Attended,
    ClassStatus::CancelledByStudent,
    ClassStatus::CancelledByTeacher,
];

/// Which part of the view a section belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    /// The round currently being consumed
    Active,
    /// A finished round waiting for payment
    PendingPayment,
    /// Classes no round has capacity for
    Unassigned,
    /// Classes still on the waiting list
    WaitingList,
    /// A paid, frozen round
    Paid,
}

/// One class in the view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassEntry {
    /// The class as stored after redistribution
    pub class: class_record::Model,
    /// Hours the class contributes; zero when it does not count
    pub hours: f64,
    /// Whether the class counts towards its round's capacity
    pub counts_towards_limit: bool,
    /// Cumulative counted hours across all rounds up to this class
    pub counter: f64,
}

/// A round (or bucket) and the classes shown under it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundSection {
    /// Section kind
    pub kind: SectionKind,
    /// The round, absent for the unassigned and waiting list buckets
    pub package: Option<package_entity::Model>,
    /// Classes in chronological order
    pub classes: Vec<ClassEntry>,
    /// Counted hours in this section
    pub used_hours: f64,
}

impl RoundSection {
    const fn new(kind: SectionKind, package: Option<package_entity::Model>) -> Self {
        Self {
            kind,
            package,
            classes: Vec::new(),
            used_hours: 0.0,
        }
    }
}

/// A student's rounds with their classes after redistribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentPackageView {
    /// Student the view belongs to
    pub student_id: i64,
    /// Active, pending payment, unassigned, waiting list and paid sections, in that order
    pub sections: Vec<RoundSection>,
    /// Counted hours across every round
    pub total_counted_hours: f64,
    /// Classes whose package link changed
    pub reassigned: usize,
}

/// Redistribution result before anything is persisted.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RoundPlan {
    pub sections: Vec<RoundSection>,
    pub reassignments: Vec<(i64, Option<i64>)>,
    pub total_counted_hours: f64,
}

fn counts_towards_limit(class: &class_record::Model) -> bool {
    class.status.consumes_hours()
}

/// Capacity in the package's own unit: hours, or classes for legacy rounds.
fn capacity(pkg: &package_entity::Model) -> f64 {
    if pkg.is_hour_tracked() {
        pkg.total_hours
    } else {
        f64::from(pkg.total_classes.unwrap_or(0))
    }
}

fn load(pkg: &package_entity::Model, class: &class_record::Model) -> f64 {
    if pkg.is_hour_tracked() {
        class.duration_hours()
    } else {
        1.0
    }
}

/// Lays classes out over the rounds without touching the store.
///
/// `packages` must be ordered by round number and `pool` by
/// `(class_date, start_time, id)`.
pub(crate) fn plan_rounds(
    packages: Vec<package_entity::Model>,
    pool: Vec<class_record::Model>,
    waiting: Vec<class_record::Model>,
    now: DateTime<Utc>,
) -> RoundPlan {
    let (frozen, mutable): (Vec<_>, Vec<_>) = packages
        .into_iter()
        .partition(package_entity::Model::is_frozen);
    let frozen_ids: HashSet<i64> = frozen.iter().map(|p| p.id).collect();
    let (frozen_classes, remaining): (Vec<_>, Vec<_>) = pool
        .into_iter()
        .partition(|c| c.package_id.is_some_and(|id| frozen_ids.contains(&id)));

    let mut global = 0.0;
    let mut paid_sections = Vec::with_capacity(frozen.len());
    for pkg in frozen {
        let package_id = pkg.id;
        let mut section = RoundSection::new(SectionKind::Paid, Some(pkg));
        for class in frozen_classes
            .iter()
            .filter(|c| c.package_id == Some(package_id))
        {
            let counts = counts_towards_limit(class);
            let hours = if counts { class.duration_hours() } else { 0.0 };
            global = round_hours(global + hours);
            section.used_hours = round_hours(section.used_hours + hours);
            section.classes.push(ClassEntry {
                class: class.clone(),
                hours,
                counts_towards_limit: counts,
                counter: if counts { global } else { 0.0 },
            });
        }
        paid_sections.push(section);
    }

    let mut reassignments = Vec::new();
    let mut filled = Vec::with_capacity(mutable.len());
    let mut classes = remaining.into_iter().peekable();
    for pkg in mutable {
        let package_id = pkg.id;
        let limit = capacity(&pkg);
        let mut local = 0.0;
        let mut holds_counted = false;
        let kind = if pkg.status == PackageStatus::Active {
            SectionKind::Active
        } else {
            SectionKind::PendingPayment
        };

        let mut section = RoundSection::new(kind, None);
        while let Some(next) = classes.peek() {
            let counts = counts_towards_limit(next);
            let step = load(&pkg, next);
            if counts && holds_counted && local + step > limit + HOUR_EPSILON {
                debug!(package_id, class_id = next.id, "Round full; moving to next round");
                break;
            }
            let Some(mut class) = classes.next() else {
                break;
            };

            if class.package_id != Some(package_id) {
                class.package_id = Some(package_id);
                class.updated_at = now;
                reassignments.push((class.id, Some(package_id)));
            }
            let hours = if counts { class.duration_hours() } else { 0.0 };
            let counter = if counts {
                local += step;
                holds_counted = true;
                global = round_hours(global + hours);
                section.used_hours = round_hours(section.used_hours + hours);
                global
            } else {
                0.0
            };
            section.classes.push(ClassEntry {
                class,
                hours,
                counts_towards_limit: counts,
                counter,
            });
        }
        section.package = Some(pkg);
        filled.push(section);
    }

    let mut unassigned = RoundSection::new(SectionKind::Unassigned, None);
    for mut class in classes {
        if class.package_id.is_some() {
            class.package_id = None;
            class.updated_at = now;
            reassignments.push((class.id, None));
        }
        let counts = counts_towards_limit(&class);
        unassigned.classes.push(ClassEntry {
            hours: if counts { class.duration_hours() } else { 0.0 },
            class,
            counts_towards_limit: counts,
            counter: 0.0,
        });
    }

    let mut waiting_section = RoundSection::new(SectionKind::WaitingList, None);
    waiting_section.classes = waiting
        .into_iter()
        .map(|class| ClassEntry {
            hours: class.duration_hours(),
            class,
            counts_towards_limit: false,
            counter: 0.0,
        })
        .collect();

    let (active, pending_payment): (Vec<_>, Vec<_>) = filled
        .into_iter()
        .partition(|s| s.kind == SectionKind::Active);
    let mut sections = active;
    sections.extend(pending_payment);
    if !unassigned.classes.is_empty() {
        sections.push(unassigned);
    }
    if !waiting_section.classes.is_empty() {
        sections.push(waiting_section);
    }
    sections.extend(paid_sections);

    RoundPlan {
        sections,
        reassignments,
        total_counted_hours: global,
    }
}

async fn load_plan<C>(db: &C, student_id: i64, now: DateTime<Utc>) -> Result<RoundPlan>
where
    C: ConnectionTrait,
{
    let packages = package::get_student_packages(db, student_id).await?;
    let pool = ClassRecord::find()
        .filter(class_record::Column::StudentId.eq(student_id))
        .filter(class_record::Column::Status.is_in(CANDIDATE_STATUSES))
        .order_by_asc(class_record::Column::ClassDate)
        .order_by_asc(class_record::Column::StartTime)
        .order_by_asc(class_record::Column::Id)
        .all(db)
        .await?;
    let waiting = ClassRecord::find()
        .filter(class_record::Column::StudentId.eq(student_id))
        .filter(class_record::Column::Status.eq(ClassStatus::WaitingList))
        .order_by_asc(class_record::Column::ClassDate)
        .order_by_asc(class_record::Column::StartTime)
        .order_by_asc(class_record::Column::Id)
        .all(db)
        .await?;

    let plan = plan_rounds(packages, pool, waiting, now);
    for &(class_id, target) in &plan.reassignments {
        ClassRecord::update_many()
            .col_expr(class_record::Column::PackageId, Expr::value(target))
            .col_expr(class_record::Column::UpdatedAt, Expr::value(now))
            .filter(class_record::Column::Id.eq(class_id))
            .exec(db)
            .await?;
    }
    Ok(plan)
}

/// Builds a student's round-by-round view, persisting any class relinking
/// the chronological fill requires.
///
/// Every reassignment made by one call commits together or not at all.
pub async fn get_student_packages_with_classes_by_rounds(
    ctx: &LedgerContext,
    student_id: i64,
    now: DateTime<Utc>,
) -> Result<StudentPackageView> {
    const OPERATION: &str = "get_student_packages_with_classes_by_rounds";

    let _guard = ctx.locks.acquire(student_id).await;
    let txn = ctx.database.begin().await?;
    let plan = load_plan(&txn, student_id, now)
        .await
        .map_err(|e| e.in_transaction(OPERATION))?;
    txn.commit()
        .await
        .map_err(|e| Error::from(e).in_transaction(OPERATION))?;

    if !plan.reassignments.is_empty() {
        info!(
            student_id,
            reassigned = plan.reassignments.len(),
            "Redistributed classes across rounds"
        );
    }
    Ok(StudentPackageView {
        student_id,
        reassigned: plan.reassignments.len(),
        total_counted_hours: plan.total_counted_hours,
        sections: plan.sections,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::float_cmp)]
    use super::*;
    use crate::core::lifecycle;
    use crate::test_utils::*;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    fn section_ids(section: &RoundSection) -> Vec<i64> {
        section.classes.iter().map(|e| e.class.id).collect()
    }

    #[tokio::test]
    async fn test_chronological_fill_across_rounds() -> Result<()> {
        let (ctx, _) = setup_test_context().await?;
        let (student, teacher) = create_student_and_teacher(&ctx.database).await?;
        let first = insert_package(&ctx.database, student.id, 1, 2.0, 2.0, PackageStatus::Active).await?;
        let second = insert_package(&ctx.database, student.id, 2, 5.0, 0.0, PackageStatus::Finished).await?;
        let c1 = create_test_class(&ctx.database, student.id, teacher.id, day(1), 60, ClassStatus::Attended).await?;
        let c2 = create_test_class(&ctx.database, student.id, teacher.id, day(2), 60, ClassStatus::Attended).await?;
        let c3 = create_test_class(&ctx.database, student.id, teacher.id, day(3), 60, ClassStatus::Attended).await?;

        let view = get_student_packages_with_classes_by_rounds(&ctx, student.id, test_now()).await?;

        assert_eq!(view.sections.len(), 2);
        assert_eq!(view.sections[0].kind, SectionKind::Active);
        assert_eq!(view.sections[0].package.as_ref().unwrap().id, first.id);
        assert_eq!(section_ids(&view.sections[0]), vec![c1.id, c2.id]);
        assert_eq!(view.sections[0].used_hours, 2.0);
        assert_eq!(view.sections[1].kind, SectionKind::PendingPayment);
        assert_eq!(section_ids(&view.sections[1]), vec![c3.id]);
        assert_eq!(view.sections[1].classes[0].counter, 3.0);
        assert_eq!(view.total_counted_hours, 3.0);
        assert_eq!(view.reassigned, 3);

        let stored = lifecycle::require_class(&ctx.database, c3.id).await?;
        assert_eq!(stored.package_id, Some(second.id));
        Ok(())
    }

    #[tokio::test]
    async fn test_second_view_changes_nothing() -> Result<()> {
        let (ctx, _) = setup_test_context().await?;
        let (student, teacher) = create_student_and_teacher(&ctx.database).await?;
        insert_package(&ctx.database, student.id, 1, 2.0, 2.0, PackageStatus::Active).await?;
        create_test_class(&ctx.database, student.id, teacher.id, day(1), 60, ClassStatus::Attended).await?;

        get_student_packages_with_classes_by_rounds(&ctx, student.id, test_now()).await?;
        let again = get_student_packages_with_classes_by_rounds(&ctx, student.id, test_now()).await?;
        assert_eq!(again.reassigned, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_paid_rounds_are_frozen() -> Result<()> {
        let (ctx, _) = setup_test_context().await?;
        let (student, teacher) = create_student_and_teacher(&ctx.database).await?;
        let paid = insert_package(&ctx.database, student.id, 1, 2.0, 0.0, PackageStatus::Paid).await?;
        let active = insert_package(&ctx.database, student.id, 2, 2.0, 2.0, PackageStatus::Active).await?;
        // Later than the unlinked classes, still owned by the paid round
        let frozen = create_linked_class(&ctx.database, student.id, teacher.id, paid.id, day(5), 60, ClassStatus::Attended).await?;
        let c1 = create_test_class(&ctx.database, student.id, teacher.id, day(1), 60, ClassStatus::Attended).await?;
        let c2 = create_test_class(&ctx.database, student.id, teacher.id, day(2), 60, ClassStatus::CancelledByStudent).await?;

        let view = get_student_packages_with_classes_by_rounds(&ctx, student.id, test_now()).await?;

        assert_eq!(view.sections[0].package.as_ref().unwrap().id, active.id);
        assert_eq!(section_ids(&view.sections[0]), vec![c1.id, c2.id]);
        let counters: Vec<f64> = view.sections[0].classes.iter().map(|e| e.counter).collect();
        assert_eq!(counters, vec![2.0, 3.0]);

        let last = view.sections.last().unwrap();
        assert_eq!(last.kind, SectionKind::Paid);
        assert_eq!(section_ids(last), vec![frozen.id]);
        assert_eq!(last.classes[0].counter, 1.0);

        let stored = lifecycle::require_class(&ctx.database, frozen.id).await?;
        assert_eq!(stored.package_id, Some(paid.id));
        assert_eq!(stored.updated_at, frozen.updated_at);
        Ok(())
    }

    #[tokio::test]
    async fn test_teacher_cancellation_never_fills_a_round() -> Result<()> {
        let (ctx, _) = setup_test_context().await?;
        let (student, teacher) = create_student_and_teacher(&ctx.database).await?;
        let first = insert_package(&ctx.database, student.id, 1, 1.0, 0.0, PackageStatus::Finished).await?;
        let second = insert_package(&ctx.database, student.id, 2, 5.0, 5.0, PackageStatus::Active).await?;
        let c1 = create_test_class(&ctx.database, student.id, teacher.id, day(1), 60, ClassStatus::Attended).await?;
        let c2 = create_test_class(&ctx.database, student.id, teacher.id, day(2), 60, ClassStatus::CancelledByTeacher).await?;
        let c3 = create_test_class(&ctx.database, student.id, teacher.id, day(3), 60, ClassStatus::Attended).await?;

        let view = get_student_packages_with_classes_by_rounds(&ctx, student.id, test_now()).await?;

        let active = &view.sections[0];
        assert_eq!(active.package.as_ref().unwrap().id, second.id);
        assert_eq!(section_ids(active), vec![c3.id]);

        let finished = &view.sections[1];
        assert_eq!(finished.package.as_ref().unwrap().id, first.id);
        assert_eq!(section_ids(finished), vec![c1.id, c2.id]);
        let cancelled = &finished.classes[1];
        assert!(!cancelled.counts_towards_limit);
        assert_eq!(cancelled.hours, 0.0);
        assert_eq!(cancelled.counter, 0.0);
        assert_eq!(finished.used_hours, 1.0);
        assert_eq!(view.total_counted_hours, 2.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_class_still_fills_empty_round() -> Result<()> {
        let (ctx, _) = setup_test_context().await?;
        let (student, teacher) = create_student_and_teacher(&ctx.database).await?;
        let small = insert_package(&ctx.database, student.id, 1, 1.0, 0.0, PackageStatus::Finished).await?;
        let large = insert_package(&ctx.database, student.id, 2, 5.0, 5.0, PackageStatus::Active).await?;
        let long = create_test_class(&ctx.database, student.id, teacher.id, day(1), 120, ClassStatus::Attended).await?;
        let short = create_test_class(&ctx.database, student.id, teacher.id, day(2), 60, ClassStatus::Attended).await?;

        let view = get_student_packages_with_classes_by_rounds(&ctx, student.id, test_now()).await?;

        let active = &view.sections[0];
        assert_eq!(active.kind, SectionKind::Active);
        assert_eq!(active.package.as_ref().unwrap().id, large.id);
        assert_eq!(section_ids(active), vec![short.id]);
        assert_eq!(active.classes[0].counter, 3.0);

        let finished = &view.sections[1];
        assert_eq!(finished.kind, SectionKind::PendingPayment);
        assert_eq!(finished.package.as_ref().unwrap().id, small.id);
        assert_eq!(section_ids(finished), vec![long.id]);
        assert_eq!(finished.used_hours, 2.0);
        assert_eq!(finished.classes[0].counter, 2.0);
        assert_eq!(view.sections.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_relink_rolls_back_redistribution() -> Result<()> {
        let pkg = package_model(1, 1, 1, 5.0, PackageStatus::Active);
        let first = class_model(1, 1, None, day(1), 60, ClassStatus::Attended);
        let second = class_model(2, 1, None, day(2), 60, ClassStatus::Attended);
        let db = MockDatabase::new(DatabaseBackend::Sqlite)
            .append_query_results([vec![pkg]])
            .append_query_results([vec![first, second]])
            .append_query_results([Vec::<class_record::Model>::new()])
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 1,
            }])
            .append_exec_errors([DbErr::Custom("disk I/O error".to_string())])
            .into_connection();
        let (ctx, _) = context_for(db);

        let result = get_student_packages_with_classes_by_rounds(&ctx, 1, test_now()).await;
        assert!(matches!(
            result,
            Err(Error::Transaction {
                operation: "get_student_packages_with_classes_by_rounds",
                ..
            })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_overflow_is_unassigned() -> Result<()> {
        let (ctx, _) = setup_test_context().await?;
        let (student, teacher) = create_student_and_teacher(&ctx.database).await?;
        let pkg = insert_package(&ctx.database, student.id, 1, 1.0, 0.0, PackageStatus::Finished).await?;
        create_linked_class(&ctx.database, student.id, teacher.id, pkg.id, day(1), 60, ClassStatus::Attended).await?;
        let overflow = create_linked_class(&ctx.database, student.id, teacher.id, pkg.id, day(2), 60, ClassStatus::Attended).await?;
        let waiting = create_test_class(&ctx.database, student.id, teacher.id, day(3), 60, ClassStatus::WaitingList).await?;

        let view = get_student_packages_with_classes_by_rounds(&ctx, student.id, test_now()).await?;

        let kinds: Vec<SectionKind> = view.sections.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![SectionKind::PendingPayment, SectionKind::Unassigned, SectionKind::WaitingList]
        );
        assert_eq!(section_ids(&view.sections[1]), vec![overflow.id]);
        assert_eq!(view.sections[1].classes[0].counter, 0.0);
        assert_eq!(section_ids(&view.sections[2]), vec![waiting.id]);
        assert_eq!(view.total_counted_hours, 1.0);

        let stored = lifecycle::require_class(&ctx.database, overflow.id).await?;
        assert_eq!(stored.package_id, None);
        assert_eq!(stored.updated_at, test_now());
        Ok(())
    }

    #[tokio::test]
    async fn test_legacy_round_capacity_counts_classes() -> Result<()> {
        let (ctx, _) = setup_test_context().await?;
        let (student, teacher) = create_student_and_teacher(&ctx.database).await?;
        let legacy = insert_legacy_package(&ctx.database, student.id, 1, 2).await?;
        let c1 = create_test_class(&ctx.database, student.id, teacher.id, day(1), 90, ClassStatus::Attended).await?;
        let c2 = create_test_class(&ctx.database, student.id, teacher.id, day(2), 90, ClassStatus::Attended).await?;
        let c3 = create_test_class(&ctx.database, student.id, teacher.id, day(3), 90, ClassStatus::Attended).await?;

        let view = get_student_packages_with_classes_by_rounds(&ctx, student.id, test_now()).await?;
        assert_eq!(view.sections[0].package.as_ref().unwrap().id, legacy.id);
        assert_eq!(section_ids(&view.sections[0]), vec![c1.id, c2.id]);
        assert_eq!(view.sections[0].used_hours, 3.0);
        assert_eq!(section_ids(&view.sections[1]), vec![c3.id]);
        Ok(())
    }

    #[tokio::test]
    async fn test_view_serializes_section_kinds() -> Result<()> {
        let (ctx, _) = setup_test_context().await?;
        let (student, teacher) = create_student_and_teacher(&ctx.database).await?;
        create_test_class(&ctx.database, student.id, teacher.id, day(1), 60, ClassStatus::WaitingList).await?;

        let view = get_student_packages_with_classes_by_rounds(&ctx, student.id, test_now()).await?;
        let json = serde_json::to_value(&view)?;
        assert_eq!(json["sections"][0]["kind"], "waiting_list");
        Ok(())
    }
}
