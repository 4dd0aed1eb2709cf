use std::fs;
use std::path::Path;
use std::time::Instant;

use lk_compiler::{normalize_site, optimize_filters, write_aggregate};
use lk_core::record::{self, FILTERS_EXTENSION, METADATA_EXTENSION};
use lk_core::Subscription;
use lk_engine::{AggregateStore, EngineConfig, EngineState};

pub fn cmd_compile(inputs: &[String], output: &str, allow: &[String], verbose: bool) -> Result<(), String> {
    if inputs.is_empty() {
        return Err("No input files specified".to_string());
    }

    let start = Instant::now();
    let mut filters = Vec::new();
    let mut total_lines = 0usize;

    for (index, path) in inputs.iter().enumerate() {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read '{}': {}", path, e))?;
        let line_count = content.lines().count();
        total_lines += line_count;

        let mut list = Subscription::local(path);
        list.parse_text(&content);

        if verbose {
            println!(
                "  [{}] {} - {} lines, {} filters",
                index,
                Path::new(path).file_name().unwrap_or_default().to_string_lossy(),
                line_count,
                list.filter_count()
            );
        }
        filters.extend(list.take_filters());
    }

    let allowlist = allow
        .iter()
        .map(|site| normalize_site(site).ok_or_else(|| format!("'{}' has no host", site)))
        .collect::<Result<Vec<_>, _>>()?;

    let stats = optimize_filters(&mut filters);
    write_aggregate(Path::new(output), &filters, &allowlist).map_err(|e| e.to_string())?;

    println!("Compiled {} filter lists to '{}'", inputs.len(), output);
    println!("  Lines:       {}", total_lines);
    println!(
        "  Filters:     {} -> {} (dedupe removed {}, unsupported {})",
        stats.before, stats.after, stats.deduped, stats.unsupported
    );
    println!("  Allowlisted: {}", allowlist.len());
    println!("  Time:        {:.1}ms", start.elapsed().as_secs_f64() * 1000.0);

    Ok(())
}

pub fn cmd_inspect(input: &str, show_filters: bool) -> Result<(), String> {
    let path = Path::new(input);
    if input.ends_with(METADATA_EXTENSION) {
        let sub = record::read_metadata(path).map_err(|e| format!("Invalid record '{}': {}", input, e))?;
        println!("Metadata record: {}", input);
        println!("  Id:          {}", sub.id());
        println!("  Kind:        {}", sub.kind());
        println!("  Valid:       {}", sub.is_metadata_valid());
        println!();
        for (key, value) in sub.metadata() {
            println!("  {:<24} {}", key, value);
        }
        return Ok(());
    }

    if !input.ends_with(FILTERS_EXTENSION) {
        return Err(format!(
            "'{}' is neither a {} nor a {} record",
            input, FILTERS_EXTENSION, METADATA_EXTENSION
        ));
    }

    let bytes = fs::read(path).map_err(|e| format!("Failed to read '{}': {}", input, e))?;
    let mut scratch = Subscription::local(input);
    record::decode_filters_into(&bytes, &mut scratch).map_err(|e| format!("Invalid record '{}': {}", input, e))?;

    println!("Filters record: {}", input);
    println!("  Filters:     {}", scratch.filter_count());
    println!("  Valid:       {}", scratch.is_filters_valid());
    println!("  Size:        {} bytes", bytes.len());
    if show_filters {
        let mut filters: Vec<&String> = scratch.filters().collect();
        filters.sort();
        println!();
        for filter in filters {
            println!("  {}", filter);
        }
    }
    Ok(())
}

pub fn cmd_aggregate(config: &EngineConfig, print: bool) -> Result<(), String> {
    let state = EngineState::load(&config.state_path());
    let store = AggregateStore::open(&config.cache_dir).map_err(|e| e.to_string())?;
    store.ensure_placeholder().map_err(|e| e.to_string())?;
    let path = store.current_or_placeholder(state.active_aggregate.as_deref());

    if print {
        let text = fs::read_to_string(&path).map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?;
        print!("{}", text);
    } else {
        println!("{}", path.display());
    }
    Ok(())
}
