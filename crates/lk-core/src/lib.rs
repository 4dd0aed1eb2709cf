//! ListKeeper Core Library
//!
//! This crate provides the subscription model shared by the ListKeeper engine
//! and tools. It has no async runtime dependency.
//!
//! # Architecture
//!
//! A subscription is a named filter list, either downloaded from a URL or kept
//! locally for user rules. Its metadata stays resident while its filters live
//! on disk in a compressed record and are only loaded when needed. Both
//! records carry a content hash so corruption is detected on load without ever
//! refusing the data.
//!
//! # Modules
//!
//! - `hash`: xxHash content hashes over sorted line sets
//! - `record`: compressed metadata/filters record format and codec
//! - `subscription`: subscription entity, line classification, freshness policy
//! - `types`: identifiers, kinds and reserved metadata keys

pub mod hash;
pub mod record;
pub mod subscription;
pub mod types;

// Re-export commonly used types
pub use hash::{content_hash, metadata_hash};
pub use record::RecordError;
pub use subscription::{now_millis, Subscription};
pub use types::{SubscriptionId, SubscriptionKind};
