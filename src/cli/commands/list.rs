//! List command - show cached images

use crate::cache::{CacheKey, CacheMetadata, CacheRoot};
use crate::cli::args::{ListArgs, OutputFormat};
use crate::cli::commands::{format_bytes, open_store};
use crate::config::Config;
use crate::error::ImgkeepResult;
use crate::ui::{self, UiContext};
use console::style;
use serde::Serialize;

/// One row of the listing
#[derive(Debug, Serialize)]
struct Entry<'a> {
    key: &'a CacheKey,
    source: &'a str,
    size_bytes: u64,
    width: Option<u32>,
    height: Option<u32>,
    retained_by: Vec<&'a str>,
    last_access_at: String,
}

/// Execute the list command
pub async fn execute(args: ListArgs, config: &Config) -> ImgkeepResult<()> {
    let store = open_store(config).await?;
    let root = store.snapshot().await;
    store.close().await?;

    if root.items.is_empty() {
        match args.format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => {
                let ctx = UiContext::detect();
                ui::step_info(&ctx, "No cached images");
            }
        }
        return Ok(());
    }

    let entries = entries(&root);
    match args.format {
        OutputFormat::Table => print_table(&entries),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Plain => print_plain(&entries),
    }

    Ok(())
}

fn entries(root: &CacheRoot) -> Vec<Entry<'_>> {
    root.items
        .iter()
        .map(|(key, meta): (&CacheKey, &CacheMetadata)| Entry {
            key,
            source: &meta.file.source_url,
            size_bytes: meta.file.size_bytes,
            width: meta.image.as_ref().and_then(|i| i.width),
            height: meta.image.as_ref().and_then(|i| i.height),
            retained_by: root
                .retainers
                .iter()
                .filter(|(_, record)| record.refs.contains(key))
                .map(|(path, _)| path.as_str())
                .collect(),
            last_access_at: meta.time.last_access_at.format("%Y-%m-%d %H:%M").to_string(),
        })
        .collect()
}

fn print_table(entries: &[Entry<'_>]) {
    let ctx = UiContext::detect();
    ui::intro(&ctx, "Cached images");

    println!(
        "{:<18} {:<10} {:<11} {:<5} {:<17} {}",
        style("KEY").bold(),
        style("SIZE").bold(),
        style("DIMENSIONS").bold(),
        style("REFS").bold(),
        style("LAST ACCESS").bold(),
        style("SOURCE").bold()
    );
    println!("{}", "-".repeat(96));

    let mut total = 0;
    for entry in entries {
        total += entry.size_bytes;
        let dimensions = match (entry.width, entry.height) {
            (Some(w), Some(h)) => format!("{}x{}", w, h),
            _ => "-".to_string(),
        };
        let refs = if entry.retained_by.is_empty() {
            style("0".to_string()).dim()
        } else {
            style(entry.retained_by.len().to_string()).green()
        };
        println!(
            "{:<18} {:<10} {:<11} {:<5} {:<17} {}",
            entry.key.as_str(),
            format_bytes(entry.size_bytes),
            dimensions,
            refs,
            entry.last_access_at,
            entry.source
        );
    }

    println!();
    println!("{} image(s), {}", entries.len(), format_bytes(total));
}

fn print_plain(entries: &[Entry<'_>]) {
    for entry in entries {
        println!("{}\t{}", entry.key, entry.source);
    }
}
