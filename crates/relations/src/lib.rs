//! # elif-relations: Relation layer for elif.rs
//!
//! Relation definitions between models, batched include resolution without
//! N+1 queries, and per-record relation accessors, on top of any storage
//! backend implementing [`Connector`].
//!
//! The crate is split into:
//!
//! - [`relationships`]: metadata, the model registry, identity maps, scopes,
//!   the include resolver and relation accessors
//! - [`connector`]: the storage seam plus an in-memory connector
//! - [`datasource`]: registry, connector and configuration behind one handle

pub mod config;
pub mod connector;
pub mod datasource;
pub mod error;
pub mod filter;
pub mod record;
pub mod relationships;

// Re-export core types
pub use config::IncludeConfig;
pub use connector::{Collection, Connector, MemoryConnector};
pub use datasource::DataSource;
pub use error::*;
pub use filter::{Filter, QueryOptions, Row};
pub use record::Record;
pub use relationships::*;
