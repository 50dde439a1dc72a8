//! Package entity - A purchased block of tutoring hours for one student.
//!
//! Packages are numbered per student by `round_number`. At most one package per
//! student is `active`; once `paid` a package is frozen history and its class
//! linkage never changes again.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a package round
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    /// Currently absorbing classes
    #[sea_orm(string_value = "active")]
    #[default]
    Active,
    /// Exhausted (or force-finished) and awaiting payment
    #[sea_orm(string_value = "finished")]
    Finished,
    /// Settled; class linkage is frozen
    #[sea_orm(string_value = "paid")]
    Paid,
}

/// Package database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "packages")]
pub struct Model {
    /// Unique identifier for the package
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Student who bought the package
    pub student_id: i64,
    /// Sequential round number per student, starting at 1
    pub round_number: i32,
    /// Purchased hours; zero for legacy class-count packages
    pub total_hours: f64,
    /// Hours still available
    pub remaining_hours: f64,
    /// Purchased classes for legacy class-count packages
    pub total_classes: Option<i32>,
    /// Classes still available for legacy class-count packages
    pub remaining_classes: Option<i32>,
    /// Price of one hour in `currency`
    pub hour_price: f64,
    /// ISO currency code
    pub currency: String,
    /// Lifecycle status
    pub status: PackageStatus,
    /// First day the round is valid
    pub start_date: Date,
    /// When the last payment request was sent
    pub last_notification_sent: Option<DateTimeUtc>,
    /// How many payment requests have been sent
    pub notification_count: i32,
    /// When the round was settled
    pub paid_at: Option<DateTimeUtc>,
    /// When the row was created
    pub created_at: DateTimeUtc,
    /// When the row was last modified
    pub updated_at: DateTimeUtc,
}

impl Model {
    /// Hour-tracked packages carry a positive `total_hours`; everything else
    /// falls back to legacy class counting.
    #[must_use]
    pub fn is_hour_tracked(&self) -> bool {
        self.total_hours > 0.0
    }

    /// Paid packages are immutable history.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.status == PackageStatus::Paid
    }
}

/// Defines relationships between Package and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each package belongs to one student
    #[sea_orm(
        belongs_to = "super::student::Entity",
        from = "Column::StudentId",
        to = "super::student::Column::Id"
    )]
    Student,
    /// One package has many classes linked to it
    #[sea_orm(has_many = "super::class_record::Entity")]
    Classes,
    /// One package has many bills
    #[sea_orm(has_many = "super::bill::Entity")]
    Bills,
}

impl Related<super::student::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Student.def()
    }
}

impl Related<super::class_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Classes.def()
    }
}

impl Related<super::bill::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Bills.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
