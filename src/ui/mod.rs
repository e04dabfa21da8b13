//! Terminal output for the CLI
//!
//! Styled symbols and an indicatif progress bar in a terminal, bracketed
//! tags and no progress in CI or when piped.
//!
//! # Example
//!
//! ```rust,ignore
//! use docpack::ui::{self, ArchiveProgress, UiContext};
//!
//! let ctx = UiContext::detect().with_progress(!args.no_progress);
//! let progress = ArchiveProgress::new(&ctx, "docs.zip", request.len());
//! let bar = progress.clone();
//! let builder = builder.with_progress(move |p| bar.update(p));
//! // ... build ...
//! progress.finish();
//! ui::step_ok_detail(&ctx, "Archive written", "docs.zip");
//! ```

mod context;
mod output;
mod progress;
mod prompts;

pub use context::UiContext;
pub use output::{bullet, key_value, remark, step_ok, step_ok_detail, step_warn, step_warn_hint};
pub use progress::ArchiveProgress;
pub use prompts::confirm;
