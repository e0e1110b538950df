use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::defaults::DEFAULT_UPDATE_COMMAND;

/// Agent names that may appear in `general.agents`.
pub const KNOWN_AGENTS: [&str; 3] = ["emissary", "ping", "stats"];

/// Per-agent sections under `[agents]`.
///
/// Sections for agents this build does not ship are tolerated so that a
/// fleet can roll out configuration ahead of binaries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AgentsConfig {
    #[serde(default)]
    emissary: EmissaryAgentConfig,
}

impl AgentsConfig {
    /// Settings for the `emissary` control agent.
    #[must_use]
    pub fn emissary(&self) -> &EmissaryAgentConfig {
        &self.emissary
    }
}

/// Settings for the `emissary` control agent (`[agents.emissary]`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EmissaryAgentConfig {
    #[serde(default)]
    config_path: Option<PathBuf>,
    #[serde(default)]
    release_manifest: Option<PathBuf>,
    #[serde(default)]
    update_command: Option<String>,
}

impl EmissaryAgentConfig {
    /// File that `reconfig` is allowed to replace.
    #[must_use]
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// JSON manifest listing the releases available for `selfupdate`.
    #[must_use]
    pub fn release_manifest(&self) -> Option<&Path> {
        self.release_manifest.as_deref()
    }

    /// Shell command run by the detached self-update task.
    ///
    /// `{version}` in the command is replaced with the requested release.
    #[must_use]
    pub fn update_command(&self) -> &str {
        self.update_command
            .as_deref()
            .unwrap_or(DEFAULT_UPDATE_COMMAND)
    }
}
