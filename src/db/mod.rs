//! Database module for PageWarden.
//!
//! Provides SQLite storage with automatic migrations.

mod models;
mod store;

pub use models::*;
pub use store::*;
