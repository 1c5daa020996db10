//! Port definitions (hexagonal architecture)
//!
//! Ports define the interfaces for external dependencies. The engine
//! depends only on these traits, not on concrete implementations.

mod data_source;
mod database;
mod resource;

pub use data_source::DataSource;
pub use database::{Database, ObjectKind, SchemaObject};
pub use resource::ResourceAccessor;
