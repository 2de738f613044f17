use crate::index::reader::IndexReader;
use crate::index::types::IndexConfig;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;

fn open(dir: &Path, config: &IndexConfig) -> Result<IndexReader> {
    IndexReader::open_with_config(dir, config)
        .with_context(|| format!("Cannot open global module index in {}", dir.display()))
}

/// Display index statistics
pub fn show_stats(dir: &Path, config: &IndexConfig) -> Result<()> {
    let reader = open(dir, config)?;
    print!("{}", render_stats(&reader));
    Ok(())
}

fn render_stats(reader: &IndexReader) -> String {
    let table = reader.table_stats();
    let registry = reader.registry();
    let mut out = String::new();

    let _ = writeln!(out, "Global Module Index");
    let _ = writeln!(out, "===================");
    let _ = writeln!(out);
    let _ = writeln!(out, "Directory:        {}", reader.directory().display());
    let _ = writeln!(out, "Index file:       {}", reader.index_path().display());
    let _ = writeln!(out, "Generation:       {}", reader.generation());
    let _ = writeln!(out, "Index size:       {}", format_size(reader.file_size() as u64));
    let _ = writeln!(
        out,
        "Modules:          {} ({} slots, {} stale)",
        registry.module_count(),
        registry.slot_count(),
        reader.stale_modules().len()
    );

    let _ = writeln!(out);
    let _ = writeln!(out, "Identifier table:");
    let _ = writeln!(out, "  Entries:        {}", table.entry_count);
    let _ = writeln!(out, "  Buckets:        {}", table.bucket_count);
    let _ = writeln!(out, "  Load factor:    {:.2}", table.load_factor());
    let _ = writeln!(
        out,
        "  Module sets:    {} inline, {} bitmap, {} spilled",
        table.inline_sets, table.bitmap_sets, table.spilled_sets
    );
    let _ = writeln!(
        out,
        "  Probe length:   {:.2} mean, {} max",
        table.mean_probe_len, table.max_probe_len
    );

    let mut largest: Vec<_> = registry
        .iter()
        .filter(|record| record.identifier_count > 0)
        .collect();
    largest.sort_by(|a, b| b.identifier_count.cmp(&a.identifier_count));
    if !largest.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Largest modules:");
        for record in largest.iter().take(10) {
            let _ = writeln!(
                out,
                "  {:30} {}",
                record.file.path.display(),
                record.identifier_count
            );
        }
        if largest.len() > 10 {
            let _ = writeln!(out, "  ... and {} more", largest.len() - 10);
        }
    }

    if let Some(info) = reader.build_info() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Built:            {}", format_timestamp(info.created_at));
        let _ = writeln!(out, "Built by:         gmindex {}", info.tool_version);
    }
    out
}

/// List the modules the index knows about
pub fn list_modules(dir: &Path, config: &IndexConfig) -> Result<()> {
    let reader = open(dir, config)?;

    for module in reader.known_modules() {
        println!("{:>6}  {}", module.id, module.path.display());
    }
    for module in reader.stale_modules() {
        println!("{:>6}  {} [stale]", module.id, module.path.display());
    }
    Ok(())
}

/// List the direct dependencies of one module
pub fn show_dependencies(dir: &Path, module: &Path, config: &IndexConfig) -> Result<()> {
    let reader = open(dir, config)?;
    if reader.module_id(module).is_none() {
        anyhow::bail!("{} is not in the index", module.display());
    }

    for dependency in reader.dependencies_of(module) {
        println!("{}", dependency.path.display());
    }
    Ok(())
}

/// Look up identifiers and print the modules declaring each one
pub fn show_lookups(dir: &Path, names: &[String], config: &IndexConfig) -> Result<()> {
    let reader = open(dir, config)?;

    for name in names {
        let lookup = reader.lookup_identifier(name);
        if !lookup.found {
            println!("{name}: not found");
            continue;
        }
        let modules: Vec<String> = lookup
            .hits
            .iter()
            .map(|m| m.path.display().to_string())
            .collect();
        println!("{name}: {}", modules.join(" "));
    }

    if tracing::enabled!(tracing::Level::DEBUG) {
        reader.print_stats();
    }
    Ok(())
}

/// Format byte size to human readable
fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Format unix timestamp as seconds ago
fn format_timestamp(ts: u64) -> String {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};
    let when = UNIX_EPOCH + Duration::from_secs(ts);
    match SystemTime::now().duration_since(when) {
        Ok(age) => format!("{ts} ({}s ago)", age.as_secs()),
        Err(_) => ts.to_string(),
    }
}
