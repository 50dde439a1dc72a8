//! Student entity - The minimal student record the ledger reads.
//!
//! Student CRUD lives outside this crate; the engine only needs the recipient
//! address for payment requests and the preferred billing currency.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Student database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "students")]
pub struct Model {
    /// Unique identifier for the student
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Display name used in payment requests
    pub name: String,
    /// Messaging address for payment requests
    pub whatsapp: Option<String>,
    /// Preferred billing currency
    pub currency: Option<String>,
}

/// Defines relationships between Student and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One student has many package rounds
    #[sea_orm(has_many = "super::package::Entity")]
    Packages,
    /// One student has many classes
    #[sea_orm(has_many = "super::class_record::Entity")]
    Classes,
}

impl Related<super::package::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Packages.def()
    }
}

impl Related<super::class_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Classes.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
