//! Confirmation prompts with non-interactive fallback

use super::context::UiContext;
use crate::error::{DocpackError, DocpackResult};
use std::io::{self, Write};

/// Ask a yes/no question
///
/// Auto-yes answers true; a non-interactive context answers `default`
/// without reading stdin.
pub async fn confirm(ctx: &UiContext, message: &str, default: bool) -> DocpackResult<bool> {
    if ctx.auto_yes() {
        return Ok(true);
    }

    if !ctx.is_interactive() {
        return Ok(default);
    }

    let prompt = if default { "[Y/n]" } else { "[y/N]" };
    let message = format!("  {} {} ", message, prompt);
    tokio::task::spawn_blocking(move || read_answer(&message, default))
        .await
        .map_err(|e| DocpackError::User(format!("Prompt task failed: {}", e)))?
}

fn read_answer(message: &str, default: bool) -> DocpackResult<bool> {
    print!("{}", message);
    io::stdout()
        .flush()
        .map_err(|e| DocpackError::io("writing prompt", e))?;

    let mut input = String::new();
    io::stdin()
        .read_line(&mut input)
        .map_err(|e| DocpackError::io("reading answer", e))?;

    Ok(match input.trim().to_ascii_lowercase().as_str() {
        "" => default,
        "y" | "yes" => true,
        _ => false,
    })
}
