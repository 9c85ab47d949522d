//! Concrete context sources.

pub mod activity;
pub mod documents;
pub mod memory;
pub mod web;

pub use activity::{ActivityRecord, UserActivitySource};
pub use documents::DocumentSource;
pub use memory::MemorySource;
pub use web::WebSource;
