//! Interactive vs CI detection

use std::io::IsTerminal;

/// Environment variables that mark a CI runner
const CI_ENV_VARS: &[&str] = &[
    "CI",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "BUILDKITE",
    "JENKINS_URL",
    "TF_BUILD",
];

/// Decides how the CLI talks to the user
#[derive(Debug, Clone)]
pub struct UiContext {
    interactive: bool,
    auto_yes: bool,
}

impl UiContext {
    /// Interactive only when both ends are terminals and no CI marker is set
    pub fn detect() -> Self {
        let terminals = std::io::stdout().is_terminal() && std::io::stdin().is_terminal();
        let ci = CI_ENV_VARS.iter().any(|var| std::env::var_os(var).is_some());
        Self {
            interactive: terminals && !ci,
            auto_yes: false,
        }
    }

    pub fn non_interactive() -> Self {
        Self {
            interactive: false,
            auto_yes: false,
        }
    }

    /// Skip confirmation prompts
    pub fn with_auto_yes(mut self, yes: bool) -> Self {
        self.auto_yes = yes;
        self
    }

    /// Force plain output, e.g. when stdout carries JSON
    pub fn plain(mut self) -> Self {
        self.interactive = false;
        self
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn auto_yes(&self) -> bool {
        self.auto_yes
    }

    /// Spinners, bars, and cliclack framing
    pub fn use_fancy_output(&self) -> bool {
        self.interactive
    }
}
