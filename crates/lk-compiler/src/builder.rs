//! Aggregate file writer
//!
//! Output layout:
//!
//! ```text
//! [Adblock Plus 2.0]
//! ! This file was automatically created.
//! <filter>
//! ...
//! @@||<allowlisted host>^$document
//! ```

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use url::Url;

/// Header every aggregate starts with. The placeholder is only this header.
pub const AGGREGATE_HEADER: &str = "[Adblock Plus 2.0]\n! This file was automatically created.\n";

/// Error type for aggregate compilation.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Reduce user input such as `https://Shop.Example/cart` to a bare host.
/// Returns `None` when no host can be extracted.
pub fn normalize_site(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let url = if trimmed.contains("://") {
        Url::parse(trimmed).ok()?
    } else {
        Url::parse(&format!("http://{}", trimmed)).ok()?
    };
    let host = url.host_str()?.trim_end_matches('.').to_lowercase();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Document-level exception rule for an allowlisted host.
pub fn allowlist_rule(host: &str) -> String {
    format!("@@||{}^$document", host)
}

fn write_body<W: Write>(out: &mut W, filters: &[String], allowlist: &[String]) -> io::Result<()> {
    out.write_all(AGGREGATE_HEADER.as_bytes())?;
    for filter in filters {
        out.write_all(filter.as_bytes())?;
        out.write_all(b"\n")?;
    }
    for host in allowlist {
        out.write_all(allowlist_rule(host).as_bytes())?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

/// Render the aggregate into memory.
pub fn render_aggregate(filters: &[String], allowlist: &[String]) -> String {
    let mut buf = Vec::with_capacity(
        AGGREGATE_HEADER.len() + filters.iter().map(|f| f.len() + 1).sum::<usize>(),
    );
    // Writing into a Vec cannot fail.
    let _ = write_body(&mut buf, filters, allowlist);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Write the aggregate to `path`, replacing any existing file.
pub fn write_aggregate(path: &Path, filters: &[String], allowlist: &[String]) -> Result<(), CompileError> {
    let wrap = |source| CompileError::Write {
        path: path.display().to_string(),
        source,
    };
    let file = File::create(path).map_err(wrap)?;
    let mut out = BufWriter::new(file);
    write_body(&mut out, filters, allowlist).map_err(wrap)?;
    out.flush().map_err(wrap)?;
    log::debug!(
        "Wrote aggregate {} ({} filters, {} allowlisted sites)",
        path.display(),
        filters.len(),
        allowlist.len()
    );
    Ok(())
}

/// Write the header-only placeholder used before the first rebuild.
pub fn write_placeholder(path: &Path) -> Result<(), CompileError> {
    write_aggregate(path, &[], &[])
}
