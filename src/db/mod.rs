//! Persistence for pagewatch.
//!
//! A SQLite-backed key-value store holding JSON values, with an atomic
//! repository layered on top for projects, logs and settings.

mod models;
mod repository;
mod store;

pub use models::*;
pub use repository::*;
pub use store::*;

#[cfg(test)]
pub(crate) use repository::tests as test_support;
