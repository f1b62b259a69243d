//! Repository layer over the store's tables.
//!
//! # Responsibility
//! - Keep SQL details for application-facing tables behind typed APIs.
//!
//! # Invariants
//! - Repository writes go through [`crate::db::Executor`] so they hold the
//!   write lock.

pub mod settings_repo;
