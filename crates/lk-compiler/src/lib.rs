//! ListKeeper Aggregate Compiler
//!
//! This crate merges the filters of all enabled subscriptions into the single
//! plain-text file handed to the content-blocking host. Filters are treated as
//! opaque strings: they are deduplicated, a small set of syntactically
//! unsupported prefixes is dropped, and allowlisted sites are appended as
//! document exception rules.

pub mod builder;
pub mod optimizer;

pub use builder::{
    allowlist_rule, normalize_site, render_aggregate, write_aggregate, write_placeholder,
    CompileError, AGGREGATE_HEADER,
};
pub use optimizer::{is_unsupported, optimize_filters, OptimizeStats};
