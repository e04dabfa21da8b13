//! Terminal detection for choosing between styled and plain output

use std::io::IsTerminal;

/// CI environment indicators; any of these forces plain output
const CI_VARS: [&str; 9] = [
    "CI",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "CIRCLECI",
    "TRAVIS",
    "JENKINS_URL",
    "BUILDKITE",
    "TEAMCITY_VERSION",
    "TF_BUILD",
];

/// How the current invocation talks to the user
#[derive(Debug, Clone)]
pub struct UiContext {
    /// Both stdin and stdout are terminals outside CI
    interactive: bool,
    /// Confirmations are answered yes without asking
    auto_yes: bool,
    /// Progress bars may be drawn
    progress: bool,
}

impl UiContext {
    /// Detect the current environment
    pub fn detect() -> Self {
        let interactive = Self::detect_interactive();
        Self {
            interactive,
            auto_yes: false,
            progress: interactive,
        }
    }

    /// Plain output, no prompts, no progress bars
    pub fn non_interactive() -> Self {
        Self {
            interactive: false,
            auto_yes: false,
            progress: false,
        }
    }

    pub fn with_auto_yes(mut self, yes: bool) -> Self {
        self.auto_yes = yes;
        self
    }

    /// Allow or suppress progress bars; they never show when not interactive
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled && self.interactive;
        self
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn auto_yes(&self) -> bool {
        self.auto_yes
    }

    /// Symbols and colors instead of bracketed tags
    pub fn use_fancy_output(&self) -> bool {
        self.interactive
    }

    pub fn show_progress(&self) -> bool {
        self.progress
    }

    fn detect_interactive() -> bool {
        if !std::io::stdout().is_terminal() || !std::io::stdin().is_terminal() {
            return false;
        }

        !CI_VARS.iter().any(|var| std::env::var_os(var).is_some())
    }
}
