//! Cache command - list and prune cached archives

use crate::cache::{format_bytes, CacheRecord, CacheSizeStatus, ContentCache};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::{Config, ConfigManager};
use crate::error::DocpackResult;
use crate::ui::{self, UiContext};
use console::style;
use std::time::Duration;
use tracing::debug;

const MB: u64 = 1024 * 1024;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> DocpackResult<()> {
    let cache = ContentCache::open(ConfigManager::cache_dir(config)).await?;
    debug!("Using cache at {}", cache.dir().display());

    match args.action {
        CacheAction::List { format } => list_archives(&cache, config, format).await,
        CacheAction::Gc {
            days,
            max_mb,
            dry_run,
        } => gc_archives(&cache, config, days, max_mb, dry_run).await,
        CacheAction::Clear { yes } => clear_archives(&cache, yes).await,
    }
}

async fn list_archives(
    cache: &ContentCache,
    config: &Config,
    format: OutputFormat,
) -> DocpackResult<()> {
    let records = cache.list().await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Plain => {
            for record in &records {
                println!("{}", record.key);
            }
        }
        OutputFormat::Table if records.is_empty() => {
            println!("No cached archives in {}", cache.dir().display());
        }
        OutputFormat::Table => print_table(&records, config),
    }

    Ok(())
}

fn print_table(records: &[CacheRecord], config: &Config) {
    println!("{:<14} {:>10} {:<18} {:>6}", "KEY", "SIZE", "CREATED", "AGE");
    println!("{}", "-".repeat(52));

    for record in records {
        println!(
            "{:<14} {:>10} {:<18} {:>5}d",
            record.key.short(),
            format_bytes(record.size_bytes),
            record.created_at.format("%Y-%m-%d %H:%M"),
            record.age().as_secs() / 86_400
        );
    }

    let total: u64 = records.iter().map(|r| r.size_bytes).sum();
    println!();
    match config.cache.max_total_bytes() {
        Some(limit) => {
            let percent = CacheSizeStatus::percentage(total, limit);
            let usage = format!(
                "{} of {} ({:.0}%)",
                format_bytes(total),
                format_bytes(limit),
                percent
            );
            let usage = match CacheSizeStatus::from_usage(total, limit) {
                CacheSizeStatus::Ok => style(usage).green(),
                CacheSizeStatus::Warning => style(usage).yellow(),
                CacheSizeStatus::Exceeded => style(usage).red(),
            };
            println!("Total: {} archive(s), {}", records.len(), usage);
        }
        None => println!(
            "Total: {} archive(s), {}",
            records.len(),
            format_bytes(total)
        ),
    }
}

async fn gc_archives(
    cache: &ContentCache,
    config: &Config,
    days_override: Option<u32>,
    max_mb_override: Option<u64>,
    dry_run: bool,
) -> DocpackResult<()> {
    let ctx = UiContext::detect();

    let max_age = match days_override {
        Some(0) => None,
        Some(days) => Some(Duration::from_secs(u64::from(days) * 86_400)),
        None => config.cache.ttl(),
    };
    let max_total = match max_mb_override {
        Some(0) => None,
        Some(mb) => Some(mb * MB),
        None => config.cache.max_total_bytes(),
    };

    if max_age.is_none() && max_total.is_none() {
        println!("Cache GC is disabled (no age or size limit)");
        return Ok(());
    }

    let candidates = cache.eviction_candidates(max_age, max_total).await?;
    if candidates.is_empty() {
        println!("Nothing to remove.");
        return Ok(());
    }

    let freed: u64 = candidates.iter().map(|r| r.size_bytes).sum();
    println!(
        "Found {} archive(s) to remove ({}):",
        candidates.len(),
        format_bytes(freed)
    );
    for record in &candidates {
        ui::bullet(
            &ctx,
            &format!(
                "{} ({}, {} days old)",
                record.key.short(),
                format_bytes(record.size_bytes),
                record.age().as_secs() / 86_400
            ),
        );
    }

    if dry_run {
        ui::remark(&ctx, "Dry run - no archives removed.");
        return Ok(());
    }

    let report = cache.remove_records(&candidates).await?;
    ui::step_ok(
        &ctx,
        &format!(
            "Removed {} archive(s), freed {}",
            report.count(),
            format_bytes(report.bytes_freed)
        ),
    );
    Ok(())
}

async fn clear_archives(cache: &ContentCache, yes: bool) -> DocpackResult<()> {
    let ctx = UiContext::detect().with_auto_yes(yes);

    let records = cache.list().await?;
    if records.is_empty() {
        println!("No cached archives to clear.");
        return Ok(());
    }

    let total: u64 = records.iter().map(|r| r.size_bytes).sum();
    println!(
        "This will remove {} cached archive(s) ({}).",
        records.len(),
        format_bytes(total)
    );

    if !ui::confirm(&ctx, "Are you sure?", false).await? {
        ui::step_warn_hint(&ctx, "Aborted", "Pass --yes to clear without asking");
        return Ok(());
    }

    let report = cache.clear().await?;
    ui::step_ok(
        &ctx,
        &format!(
            "Cleared {} archive(s), freed {}",
            report.count(),
            format_bytes(report.bytes_freed)
        ),
    );
    Ok(())
}
