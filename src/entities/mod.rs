//! Entity module - Contains all SeaORM entity definitions for the database.
//! These entities represent the database tables and their relationships.
//! Each entity has a Model struct for data and an Entity struct for operations.

pub mod bill;
pub mod class_record;
pub mod package;
pub mod student;
pub mod teacher;

// Re-export specific types to avoid conflicts
pub use bill::{BillStatus, ClassIds, Column as BillColumn, Entity as Bill, Model as BillModel};
pub use class_record::{
    ClassStatus, Column as ClassColumn, Entity as ClassRecord, Model as ClassModel,
};
pub use package::{
    Column as PackageColumn, Entity as Package, Model as PackageModel, PackageStatus,
};
pub use student::{Column as StudentColumn, Entity as Student, Model as StudentModel};
pub use teacher::{Column as TeacherColumn, Entity as Teacher, Model as TeacherModel};
