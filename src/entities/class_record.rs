//! Class entity - One scheduled or completed tutoring session.
//!
//! `package_id` stays empty at schedule time and is assigned once the class
//! resolves to a billable or terminal outcome. Classes cancelled by the teacher
//! may be linked to a package for display but never consume hours.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Status of a class
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum ClassStatus {
    /// Scheduled, not yet resolved
    #[sea_orm(string_value = "pending")]
    #[default]
    Pending,
    /// The student attended
    #[sea_orm(string_value = "attended")]
    Attended,
    /// Cancelled by the student; still consumes hours
    #[sea_orm(string_value = "cancelled_by_student")]
    CancelledByStudent,
    /// Cancelled by the teacher; never consumes hours
    #[sea_orm(string_value = "cancelled_by_teacher")]
    CancelledByTeacher,
    /// The student did not show up
    #[sea_orm(string_value = "absent_student")]
    AbsentStudent,
    /// No package could absorb the class yet
    #[sea_orm(string_value = "waiting_list")]
    WaitingList,
}

impl ClassStatus {
    /// Whether a class in this status consumes package hours.
    #[must_use]
    pub const fn consumes_hours(self) -> bool {
        matches!(
            self,
            Self::Attended | Self::CancelledByStudent | Self::AbsentStudent
        )
    }

    /// Whether a class in this status produces a bill.
    #[must_use]
    pub const fn is_billable(self) -> bool {
        matches!(self, Self::Attended | Self::AbsentStudent)
    }

    /// Whether this status records a cancellation.
    #[must_use]
    pub const fn is_cancellation(self) -> bool {
        matches!(self, Self::CancelledByStudent | Self::CancelledByTeacher)
    }
}

/// Class database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "classes")]
pub struct Model {
    /// Unique identifier for the class
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Student taking the class
    pub student_id: i64,
    /// Teacher giving the class
    pub teacher_id: i64,
    /// Package the class is counted against, if any
    pub package_id: Option<i64>,
    /// Day of the class
    pub class_date: Date,
    /// Start time of the class
    pub start_time: Time,
    /// Length of the class in minutes
    pub duration_minutes: i32,
    /// Current status
    pub status: ClassStatus,
    /// Free-text reason given on cancellation
    pub cancellation_reason: Option<String>,
    /// Actor who cancelled the class
    pub cancelled_by: Option<i64>,
    /// When the class was cancelled
    pub cancelled_at: Option<DateTimeUtc>,
    /// When the row was created
    pub created_at: DateTimeUtc,
    /// When the row was last modified
    pub updated_at: DateTimeUtc,
}

impl Model {
    /// Duration of the class in hours.
    #[must_use]
    pub fn duration_hours(&self) -> f64 {
        f64::from(self.duration_minutes) / 60.0
    }
}

/// Defines relationships between Class and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each class may be counted against one package
    #[sea_orm(
        belongs_to = "super::package::Entity",
        from = "Column::PackageId",
        to = "super::package::Column::Id"
    )]
    Package,
    /// Each class belongs to one student
    #[sea_orm(
        belongs_to = "super::student::Entity",
        from = "Column::StudentId",
        to = "super::student::Column::Id"
    )]
    Student,
    /// Each class is given by one teacher
    #[sea_orm(
        belongs_to = "super::teacher::Entity",
        from = "Column::TeacherId",
        to = "super::teacher::Column::Id"
    )]
    Teacher,
}

impl Related<super::package::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Package.def()
    }
}

impl Related<super::student::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Student.def()
    }
}

impl Related<super::teacher::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Teacher.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
