//! Build command - pack inputs into an archive through the cache

use crate::archive::{ArchiveEntry, ArchiveRequest};
use crate::builder::{ArchiveBuilder, ArchiveResult, BuildMetrics, BuilderSettings};
use crate::cache::{format_bytes, CacheKey, ContentCache};
use crate::cli::args::BuildArgs;
use crate::config::{Config, ConfigManager};
use crate::error::{DocpackError, DocpackResult};
use crate::monitor::ResourceMonitor;
use crate::ui::{self, ArchiveProgress, UiContext};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config) -> DocpackResult<()> {
    let ctx = UiContext::detect().with_progress(!args.no_progress && !args.json);

    let entries = collect_entries(&args.inputs)?;
    let mut archive_config = config.archive.request_config();
    if let Some(level) = args.level {
        archive_config.compression_level = level;
    }
    if args.flatten {
        archive_config.preserve_directory_structure = false;
    }
    if args.skip_oversized {
        archive_config.skip_oversized_entries = true;
    }
    let request = ArchiveRequest::new(entries, archive_config)?;
    info!(
        "Packing {} entries ({}) into {}",
        request.len(),
        format_bytes(request.total_declared_size()),
        args.output.display()
    );

    let cache = ContentCache::open(ConfigManager::cache_dir(config)).await?;
    let label = args
        .output
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    let progress = ArchiveProgress::new(&ctx, &label, request.len());

    let mut builder = ArchiveBuilder::new(cache, BuilderSettings::from_config(config))
        .with_monitor(ResourceMonitor::system(config.monitor.thresholds()));
    if progress.is_visible() {
        let bar = progress.clone();
        builder = builder.with_progress(move |p| bar.update(p));
    }

    let outcome = builder.build_or_fetch(request).await;
    progress.finish();
    let result = outcome?;

    result.data.write_to(&args.output).await?;
    debug!("Metrics: {:?}", builder.snapshot_metrics());

    if args.json {
        print_json(&args.output, &result)
    } else {
        print_summary(&ctx, &args.output, &result);
        Ok(())
    }
}

fn print_summary(ctx: &UiContext, output: &Path, result: &ArchiveResult) {
    ui::step_ok_detail(ctx, "Archive written", &output.display().to_string());

    let metrics = &result.metrics;
    let source = if metrics.cache_hit {
        "cache".to_string()
    } else if metrics.coalesced {
        "shared build".to_string()
    } else {
        format!(
            "built in {:.2?} ({} entries, {} streamed)",
            metrics.duration, metrics.entries_written, metrics.chunked_entries
        )
    };
    ui::key_value(ctx, "Source", &source);
    ui::key_value(ctx, "Size", &format_bytes(metrics.archive_bytes));
    ui::key_value(ctx, "Key", result.key.short());

    for warning in &result.warnings {
        ui::step_warn(ctx, warning);
    }
}

fn print_json(output: &Path, result: &ArchiveResult) -> DocpackResult<()> {
    #[derive(Serialize)]
    struct BuildReport<'a> {
        output: &'a Path,
        key: &'a CacheKey,
        integrity_hash: &'a str,
        metrics: &'a BuildMetrics,
        warnings: &'a [String],
    }

    let report = BuildReport {
        output,
        key: &result.key,
        integrity_hash: &result.integrity_hash,
        metrics: &result.metrics,
        warnings: &result.warnings,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Turn command-line inputs into archive entries
///
/// An existing path is packed under its file name, or its directory name
/// followed by the relative path of each file inside it. Otherwise the input
/// is read as `NAME=PATH`.
pub fn collect_entries(inputs: &[String]) -> DocpackResult<Vec<ArchiveEntry>> {
    let mut entries = Vec::new();
    for input in inputs {
        let (name, path) = parse_input(input)?;
        add_path(name.as_deref(), &path, &mut entries)?;
    }
    Ok(entries)
}

fn parse_input(input: &str) -> DocpackResult<(Option<String>, PathBuf)> {
    let path = PathBuf::from(input);
    if path.exists() {
        return Ok((None, path));
    }

    match input.split_once('=') {
        Some((name, target)) if !name.is_empty() && !target.is_empty() => {
            Ok((Some(name.to_string()), PathBuf::from(target)))
        }
        _ => Err(DocpackError::PathNotFound(path)),
    }
}

fn add_path(name: Option<&str>, path: &Path, entries: &mut Vec<ArchiveEntry>) -> DocpackResult<()> {
    let metadata = fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => DocpackError::PathNotFound(path.to_path_buf()),
        _ => DocpackError::io(format!("reading {}", path.display()), e),
    })?;

    let base = name
        .map(str::to_string)
        .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()));

    if metadata.is_dir() {
        walk_dir(path, path, base.as_deref(), entries)
    } else {
        let name = base.ok_or_else(|| DocpackError::InvalidEntryName {
            name: path.display().to_string(),
            reason: "input has no file name".to_string(),
        })?;
        entries.push(ArchiveEntry::from_path(name, path)?);
        Ok(())
    }
}

/// Depth-first walk in sorted order; symlinked directories are not followed
fn walk_dir(
    root: &Path,
    dir: &Path,
    prefix: Option<&str>,
    entries: &mut Vec<ArchiveEntry>,
) -> DocpackResult<()> {
    let read_err =
        |e: std::io::Error| DocpackError::io(format!("reading directory {}", dir.display()), e);
    let mut children = fs::read_dir(dir)
        .map_err(read_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err)?;
    children.sort_by_key(|child| child.file_name());

    for child in children {
        let path = child.path();
        let file_type = child.file_type().map_err(read_err)?;
        let metadata = fs::metadata(&path)
            .map_err(|e| DocpackError::io(format!("reading {}", path.display()), e))?;

        if metadata.is_dir() {
            if file_type.is_symlink() {
                debug!("Not following directory symlink {}", path.display());
                continue;
            }
            walk_dir(root, &path, prefix, entries)?;
        } else if metadata.is_file() {
            let relative = path.strip_prefix(root).unwrap_or(&path);
            let mut parts: Vec<String> = prefix.map(str::to_string).into_iter().collect();
            parts.extend(
                relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned()),
            );
            entries.push(ArchiveEntry::from_path(parts.join("/"), &path)?);
        }
    }
    Ok(())
}
