//! Core module - Package allocation, billing and class lifecycle operations.
//! These functions are transport-agnostic: every public operation takes a
//! [`context::LedgerContext`] (or a bare connection for read-only queries)
//! plus explicit `now` and actor arguments.

pub mod billing;
pub mod context;
pub mod lifecycle;
pub mod notification;
pub mod package;
pub mod redistribution;
pub mod side_effect;
