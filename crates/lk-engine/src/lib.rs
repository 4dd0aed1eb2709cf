//! ListKeeper Engine
//!
//! Keeps a set of filter-list subscriptions fresh and compiles them into one
//! aggregate file for a content-blocking host.
//!
//! # Architecture
//!
//! The [`Engine`] owns the subscription registry behind a single lock. A
//! coordinator task applies every mutation, a downloader task fetches lists
//! with retry and connectivity gating, and rebuilds of the aggregate are
//! debounced so a burst of changes produces one new file.
//!
//! # Modules
//!
//! - `aggregate`: aggregate file naming, placeholder and cleanup
//! - `catalog`: catalog of known lists and default list selection
//! - `config`: engine configuration
//! - `connectivity`: network policy for downloads
//! - `downloader`: download queue with retry and backoff
//! - `engine`: coordinator loop and public API
//! - `registry`: subscription registry and persistence
//! - `state`: persistent engine state

pub mod aggregate;
pub mod catalog;
pub mod config;
pub mod connectivity;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod event;
pub mod fetch;
pub mod notification;
pub mod registry;
pub mod request;
pub mod state;

// Re-export commonly used types
pub use aggregate::AggregateStore;
pub use catalog::{Catalog, CatalogEntry};
pub use config::{EngineConfig, FirstRunMetered, UpdatePolicy};
pub use connectivity::{Connectivity, NetworkMonitor, NetworkState};
pub use downloader::{Downloader, RetryPolicy};
pub use engine::{Collaborators, Engine, FetchScheduler, HostNotifier, LogHost};
pub use error::{EngineError, NetworkErrorKind, Result};
pub use event::{EngineEvent, EngineNotice};
pub use fetch::{FetchResponse, Fetcher, HttpFetcher};
pub use registry::{BundledLists, Registry, RegistryHooks, SubscriptionInfo};
pub use request::DownloadRequest;
pub use state::EngineState;
