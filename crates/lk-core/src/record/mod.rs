//! Subscription Record Format and Codec
//!
//! Every subscription is stored as two files: `<prefix>.sub.meta` with its
//! metadata and `<prefix>.sub` with its filters. Both are lz4 compressed.

mod codec;
mod format;

pub use codec::*;
pub use format::*;
