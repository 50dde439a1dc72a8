//! Teacher entity - Only the hourly rate used as a billing fallback.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Teacher database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "teachers")]
pub struct Model {
    /// Unique identifier for the teacher
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Display name
    pub name: String,
    /// Rate charged per hour when a package carries no hour price
    pub hourly_rate: f64,
}

/// `Teacher` relationships are only navigated from the class side
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
