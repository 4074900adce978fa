//! Database module: row view models and SQL repositories.
//!
//! - `model`: row-level shapes and the normalisation applied where stored
//!   data enters the typed domain.
//! - `repo`: SQL-only functions over a SQLite pool.
//!
//! Callers normally go through [`crate::store::SqliteStore`]; the functions are
//! re-exported here for tests and tooling.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::normalize_platform_content;
