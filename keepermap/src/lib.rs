//! KeeperMap - a key-value table engine whose rows live in a coordination
//! service.
//!
//! Every row is one node under the table's root path, named after the encoded
//! primary key and holding the encoded remaining columns. The coordination
//! service provides durability, ordering and atomic multi-op transactions; the
//! engine adds table lifecycle, batched reads and atomic batched writes on top.
//!
//! # Key Concepts
//!
//! - **KeeperMapTable**: one table instance. Several instances (on one or many
//!   servers) may share a root path and therefore the same rows.
//! - **ReadSlice**: one of the parallel shares a read is split into.
//! - **KeeperMapSink**: buffers an insert and commits it in one transaction.
//!
//! # Example
//!
//! ```ignore
//! use keepermap::{KeeperMapTable, TableDefinition, TableConfig, EngineSettings, KeySelection, ReadOptions};
//!
//! let table = KeeperMapTable::create(
//!     TableDefinition::new("users", schema, TableConfig::new("/users")),
//!     &EngineSettings::with_path_prefix("/keeper_map"),
//!     registry,
//! )
//! .await?;
//!
//! let mut sink = table.sink().await?;
//! sink.consume(&rows)?;
//! sink.finish().await?;
//!
//! for mut slice in table.read(KeySelection::FullScan, ReadOptions::default()).await? {
//!     while let Some(batch) = slice.next_batch().await? {
//!         println!("{} rows", batch.len());
//!     }
//! }
//! ```

mod capacity;
mod client;
mod config;
mod error;
mod model;
mod reader;
mod serde;
mod table;
mod writer;

pub use config::{DEFAULT_MAX_BLOCK_SIZE, EngineArg, EngineSettings, ReadOptions, TableConfig};
pub use error::{Error, Result};
pub use model::{Column, DataType, Row, RowBatch, Schema, Value};
pub use reader::{KeySelection, ReadSlice};
pub use crate::serde::{METADATA_NODE, decode_key, encode_key};
pub use table::{KeeperMapTable, MAX_CREATE_ATTEMPTS, TableDefinition};
pub use writer::KeeperMapSink;
