#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

//! # Marduk Memory
//!
//! Four typed memory stores (factual, event, concept, workflow) behind one
//! capability surface:
//!
//! - [`item`]: memory items with tagged content shapes and validation
//! - [`query`]: query records, field filters, and responses
//! - [`index`]: field-value multimaps used to pre-filter candidates
//! - [`store`]: the shared base — capacity-bound map with indexed query,
//!   eviction, and persistence hooks
//! - [`persist`]: atomic JSON persistence with checksums, batch mode, and
//!   best-effort backups
//! - [`snapshot`]: timestamped point-in-time copies with retention
//! - [`factory`]: composition root owning the four stores
//!
//! Each store owns its map exclusively; cross-subsystem access goes through
//! the [`factory::MemoryFactory`].

pub mod factory;
pub mod index;
pub mod item;
pub mod persist;
pub mod query;
pub mod snapshot;
pub mod store;

pub use factory::MemoryFactory;
pub use item::{ConceptRelationship, ItemMetadata, ItemPatch, MemoryContent, MemoryItem, Subsystem};
pub use persist::PersistenceConfig;
pub use query::{FieldFilter, MemoryQuery, QueryResponse};
pub use store::{MemoryStore, StoreConfig};
