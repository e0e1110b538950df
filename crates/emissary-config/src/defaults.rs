use std::env;
use std::path::PathBuf;

#[cfg(unix)]
use dirs::runtime_dir;
#[cfg(unix)]
use nix::unistd::geteuid;

/// Configuration file read when `--config` is not supplied.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/emissary/config.toml";

/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_ENV_VAR: &str = "EMISSARY_CONFIG";

/// Operator kind enabled when `general.operators` is omitted.
pub const DEFAULT_OPERATOR: &str = "amqp";

/// Restart sequence run by the detached self-update task.
pub const DEFAULT_UPDATE_COMMAND: &str = "emissary stop; sleep 2; emissary start -d";

/// Directory for pid, lock and health files when `general.pid_dir` is unset.
#[must_use]
pub fn default_pid_dir() -> PathBuf {
    #[cfg(unix)]
    {
        if let Some(mut dir) = runtime_dir() {
            dir.push("emissary");
            return dir;
        }
        let mut dir = env::temp_dir();
        dir.push("emissary");
        dir.push(format!("uid-{}", geteuid().as_raw()));
        dir
    }

    #[cfg(not(unix))]
    {
        let mut dir = env::temp_dir();
        dir.push("emissary");
        dir
    }
}
