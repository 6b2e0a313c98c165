//! Backend-agnostic persistence for parcel.
//!
//! This crate stores the operational state of a file-delivery service: API
//! keys, login sessions, hotlinks, uploaded-file metadata, the end-to-end
//! encryption handshake and transient upload progress. An operator picks the
//! storage medium with a single connection string:
//!
//! - `sqlite://<path>`: an embedded single-file database.
//! - `redis://[user:pass@]host[:port][/?ssl=<bool>&prefix=<string>]`: a remote
//!   key-value cache (cargo feature `redis`, on by default).
//!
//! # Architecture
//! Every medium implements the [`Backend`] trait. [`Database`] is the facade
//! the rest of the service holds; it forwards each call to whichever backend
//! was selected at connect time and never branches on the medium itself.
//! Around that contract sit the schema [`upgrade`], the cross-backend
//! [`migrate`] copy and expiry-driven garbage collection ([`gc`]).
//!
//! ```no_run
//! use parcel_database::Database;
//!
//! # async fn example() -> parcel_database::error::Result<()> {
//! let db = Database::open("sqlite://./data/parcel.sqlite", false).await?;
//! let stats = db.run_garbage_collection().await?;
//! println!("collected {stats}");
//! db.close().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
mod connection;
mod database;
pub mod error;
pub mod gc;
pub mod migrate;
mod models;
pub mod upgrade;

#[cfg(any(test, feature = "mock"))]
pub use crate::backend::cache::MemoryStore;
#[cfg(feature = "redis")]
pub use crate::backend::cache::RedisStore;
pub use crate::backend::{Backend, BackendHandle, CacheBackend, SqliteBackend};
pub use crate::connection::{BackendKind, ConnectionDescriptor, parse_url};
pub use crate::database::Database;
pub use crate::gc::CollectionStats;
pub use crate::migrate::{MigrationReport, migrate, migrate_urls};
pub use crate::models::*;
pub use crate::upgrade::{CURRENT_SCHEMA_VERSION, UpgradeReport};
