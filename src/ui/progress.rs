//! Build progress bar with CI fallback

use super::context::UiContext;
use crate::builder::BuildProgress;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const BAR_TEMPLATE: &str =
    "  {spinner:.cyan} Packing {prefix}  {bar:20.cyan/dim} {pos}/{len} {msg:.dim}  {elapsed:.dim}";

/// Progress indicator for one archive build
///
/// Draws an indicatif bar when the context allows it; otherwise stays silent
/// so piped and JSON output are not interleaved with progress lines.
#[derive(Clone)]
pub struct ArchiveProgress {
    bar: Option<ProgressBar>,
}

impl ArchiveProgress {
    pub fn new(ctx: &UiContext, label: &str, entries_total: usize) -> Self {
        if !ctx.show_progress() {
            return Self { bar: None };
        }

        let bar = ProgressBar::new(entries_total as u64);
        let style = ProgressStyle::default_bar()
            .template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
            .progress_chars("━╸─");
        bar.set_style(style);
        bar.set_prefix(label.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar: Some(bar) }
    }

    /// Disabled indicator
    pub fn hidden() -> Self {
        Self { bar: None }
    }

    pub fn is_visible(&self) -> bool {
        self.bar.is_some()
    }

    /// Apply a progress report from the builder
    pub fn update(&self, progress: BuildProgress) {
        if let Some(bar) = &self.bar {
            bar.set_length(progress.entries_total as u64);
            bar.set_position(progress.entries_done as u64);
            bar.set_message(crate::cache::format_bytes(progress.bytes_done));
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_when_not_interactive() {
        let ctx = UiContext::non_interactive();
        let progress = ArchiveProgress::new(&ctx, "docs.zip", 3);
        assert!(!progress.is_visible());

        progress.update(BuildProgress {
            entries_done: 1,
            entries_total: 3,
            bytes_done: 2048,
        });
        progress.finish();
    }

    #[test]
    fn hidden_ignores_updates() {
        let progress = ArchiveProgress::hidden();
        progress.update(BuildProgress {
            entries_done: 3,
            entries_total: 3,
            bytes_done: 0,
        });
        progress.finish();
        assert!(!progress.is_visible());
    }
}
