#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

//! # Marduk Context
//!
//! Everything between a raw query and the ranked context handed to the LLM:
//!
//! - [`item`]: the uniform context-item record every source produces
//! - [`embedding`]: embedding provider trait, hashed embedding cache, cosine
//!   and batch similarity with a string-similarity fallback
//! - [`cache`]: weighted LRU cache over fingerprinted retrieval results
//! - [`persist`]: context-cache persistence with rolling snapshots
//! - [`validator`]: format/age/quality/redundancy/contradiction checks with
//!   idempotent fixers
//! - [`source`] and [`sources`]: the source capability and its concrete
//!   implementations (memory adapters, documents, user activity, web)
//! - [`manager`]: bounded concurrent fan-out with per-source timeouts

pub mod cache;
pub mod embedding;
pub mod item;
pub mod manager;
pub mod persist;
pub mod source;
pub mod sources;
pub mod validator;

pub use cache::{CacheStats, ContextCacheItem, WeightedCache, WeightedCacheConfig};
pub use embedding::{
    EmbeddingProvider, HashingEmbedder, OpenAiEmbedder, ScoredText, SimilarityEngine,
};
pub use item::{ContextItem, ContextItemMetadata};
pub use manager::{Recency, RetrievalOptions, SourceManager};
pub use persist::ContextPersistence;
pub use source::{ContextSource, SourceQueryOptions};
pub use validator::{ContextValidator, IssueKind, ValidationIssue, ValidationReport, ValidatorConfig};
