//! Sync command - reconcile documents with the cache

use crate::cli::args::{OutputFormat, SyncArgs};
use crate::cli::commands::open_store;
use crate::config::Config;
use crate::document::{MarkdownView, PlaceholderOutcome};
use crate::error::{ImgkeepError, ImgkeepResult};
use crate::sync::{PassReport, Reconciler, SerialQueue, SyncEvent, SyncOptions};
use crate::ui::{self, SyncProgress, UiContext};
use console::style;
use std::sync::Arc;
use tracing::{debug, warn};

/// Execute the sync command
pub async fn execute(args: SyncArgs, config: &Config) -> ImgkeepResult<()> {
    let ctx = match args.format {
        OutputFormat::Table => UiContext::detect(),
        _ => UiContext::detect().plain(),
    };

    let store = open_store(config).await?;
    let queue = Arc::new(SerialQueue::new());
    let reconciler = Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        SyncOptions::from_config(config),
    );

    let progress = (args.format == OutputFormat::Table)
        .then(|| SyncProgress::new(&ctx, args.documents.len()));
    let mut reports = Vec::new();
    let mut unreadable = Vec::new();

    for path in &args.documents {
        if let Some(progress) = &progress {
            progress.start_document(&path.display().to_string());
        }

        match sync_document(&reconciler, path).await {
            Ok(report) => reports.push(report),
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                unreadable.push((path.display().to_string(), e));
            }
        }

        if let Some(progress) = &progress {
            progress.finish_document();
        }
    }
    if let Some(progress) = &progress {
        progress.finish();
    }

    drop(reconciler);
    store.close().await?;
    if let Ok(queue) = Arc::try_unwrap(queue) {
        queue.shutdown().await;
    }

    match args.format {
        OutputFormat::Table => print_table(&ctx, &reports, &unreadable),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
        OutputFormat::Plain => print_plain(&reports),
    }

    if unreadable.is_empty() {
        Ok(())
    } else {
        Err(ImgkeepError::User(format!(
            "{} document(s) could not be synced",
            unreadable.len()
        )))
    }
}

/// Open one document and run its initial pass
async fn sync_document(
    reconciler: &Reconciler,
    path: &std::path::Path,
) -> ImgkeepResult<PassReport> {
    let view = Arc::new(MarkdownView::open(path).await?);
    let report = reconciler.handle(view.clone(), SyncEvent::Opened).await?;

    for (id, locator, outcome) in view.outcomes() {
        if let Some(PlaceholderOutcome::Cached { path }) = outcome {
            debug!(placeholder = id.0, %locator, path = %path.display(), "image cached");
        }
    }
    view.close();
    reconciler
        .handle(
            view.clone(),
            SyncEvent::DocumentClosed {
                path: view.document_path(),
            },
        )
        .await?;
    Ok(report)
}

fn print_table(ctx: &UiContext, reports: &[PassReport], unreadable: &[(String, ImgkeepError)]) {
    ui::intro(ctx, "Sync");

    for report in reports {
        let detail = format!(
            "{} cached, {} failed, {} skipped",
            report.succeeded, report.failed, report.invalid
        );
        if report.failed == 0 {
            ui::step_ok_detail(ctx, &report.document, &detail);
        } else {
            ui::step_warn_hint(ctx, &report.document, &detail);
        }
        for failure in &report.failures {
            let marker = if failure.retryable {
                style("retry later").yellow()
            } else {
                style("gave up").red()
            };
            ui::remark(ctx, &format!("{} [{}] {}", failure.locator, marker, failure.error));
        }
    }

    for (path, error) in unreadable {
        ui::step_error_detail(ctx, path, &error.to_string());
    }

    let added: usize = reports.iter().map(|r| r.added.len()).sum();
    let deleted: usize = reports.iter().map(|r| r.deleted.len()).sum();
    let message = format!(
        "{} document(s) synced, {} reference(s) added, {} image(s) deleted",
        reports.len(),
        added,
        deleted
    );
    if unreadable.is_empty() && reports.iter().all(|r| r.failed == 0) {
        ui::outro_success(ctx, &message);
    } else {
        ui::outro_warn(ctx, &message);
    }
}

fn print_plain(reports: &[PassReport]) {
    for report in reports {
        println!(
            "{}\t{}\t{}\t{}",
            report.document, report.succeeded, report.failed, report.invalid
        );
    }
}
