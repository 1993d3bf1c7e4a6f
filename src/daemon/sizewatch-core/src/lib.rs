//! Shared types for sizewatch: catalog records, aggregates, index lifecycle,
//! change events, the exclusion matcher, the size/age/type filter, and the
//! size/duration string parsers.
//!
//! This crate has no knowledge of the scan engine, the watcher, or the RPC
//! wire format — it is the vocabulary the rest of the workspace shares.

pub mod error;
pub mod event;
pub mod exclude;
pub mod filter;
pub mod index_types;
pub mod parse;
pub mod record;

pub use error::{CoreError, CoreResult, ScanErrorRecord, StatusCode};
pub use event::{ChangeEvent, ChangeKind};
pub use exclude::ExclusionMatcher;
pub use filter::{Filter, SortDirection, SortKey};
pub use index_types::{IndexState, IndexStatus};
pub use record::{DirAggregate, FileRecord, TreeNode};
