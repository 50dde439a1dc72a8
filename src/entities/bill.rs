//! Bill entity - An accumulating invoice tied to a package.
//!
//! System-generated bills accumulate classes: for a given package and student
//! there is at most one `pending` bill that is not custom, and every further
//! billable class is merged into it. `class_ids` is stored as a JSON array.

use sea_orm::FromJsonQueryResult;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Status of a bill
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    /// Still accumulating classes
    #[sea_orm(string_value = "pending")]
    #[default]
    Pending,
    /// Payment request delivered to the student
    #[sea_orm(string_value = "sent")]
    Sent,
    /// Settled
    #[sea_orm(string_value = "paid")]
    Paid,
}

/// Ordered set of class ids covered by a bill.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct ClassIds(pub Vec<i64>);

impl ClassIds {
    /// A set holding a single class.
    #[must_use]
    pub fn single(class_id: i64) -> Self {
        Self(vec![class_id])
    }

    /// Whether the class is already covered.
    #[must_use]
    pub fn contains(&self, class_id: i64) -> bool {
        self.0.contains(&class_id)
    }

    /// Appends the class unless it is already present. Returns whether the set
    /// changed.
    pub fn insert(&mut self, class_id: i64) -> bool {
        if self.contains(class_id) {
            return false;
        }
        self.0.push(class_id);
        true
    }

    /// Number of classes covered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no class is covered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Bill database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "bills")]
pub struct Model {
    /// Unique identifier for the bill
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Package the bill belongs to; empty only for custom bills
    pub package_id: Option<i64>,
    /// Student being billed
    pub student_id: i64,
    /// Teacher of the billed classes
    pub teacher_id: Option<i64>,
    /// Classes covered, in the order they were billed
    #[sea_orm(column_type = "Json")]
    pub class_ids: ClassIds,
    /// Hours covered
    pub total_hours: f64,
    /// Amount due in `currency`
    pub amount: f64,
    /// ISO currency code
    pub currency: String,
    /// Lifecycle status
    pub status: BillStatus,
    /// Manually created bills are never merged
    pub is_custom: bool,
    /// Token behind the public payment URL
    #[sea_orm(unique)]
    pub payment_token: Option<String>,
    /// Free-text description (custom bills)
    pub description: Option<String>,
    /// When the payment request was sent
    pub sent_at: Option<DateTimeUtc>,
    /// When the bill was settled
    pub paid_at: Option<DateTimeUtc>,
    /// Actor who created the bill
    pub created_by: Option<i64>,
    /// When the row was created
    pub created_at: DateTimeUtc,
    /// When the row was last modified
    pub updated_at: DateTimeUtc,
}

/// Defines relationships between Bill and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each bill belongs to at most one package
    #[sea_orm(
        belongs_to = "super::package::Entity",
        from = "Column::PackageId",
        to = "super::package::Column::Id"
    )]
    Package,
    /// Each bill belongs to one student
    #[sea_orm(
        belongs_to = "super::student::Entity",
        from = "Column::StudentId",
        to = "super::student::Column::Id"
    )]
    Student,
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

impl ActiveModelBehavior for ActiveModel {}
