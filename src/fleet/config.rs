//! Configuration resolution for the orchestration server.
//!
//! Every tunable resolves with a three-tier priority:
//!
//! 1. **Parameter** - Value given on the command line (highest priority)
//! 2. **Environment Variable** - Value from the environment (or `.env`)
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! Unparseable environment values are ignored and fall through to the default.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FLEET_CONNECT_TIMEOUT` | 30s | Dial and authentication timeout per attempt |
//! | `FLEET_SCRIPT_TIMEOUT` | 180s | Upload + execute deadline for one script |
//! | `FLEET_CLEANUP_TIMEOUT` | 30s | Bound on removing a script from the device |
//! | `FLEET_PROBE_TIMEOUT` | 30s | Bound on each diagnostic probe command |
//! | `FLEET_MAX_CONCURRENCY` | 8 | Scripts running at once per device |
//! | `FLEET_MAX_RETRIES` | 3 | Dial retries on transient errors |
//! | `FLEET_RETRY_DELAY_MS` | 1000ms | Initial retry delay |
//! | `FLEET_COMPRESSION` | true | Enable zlib compression |
//! | `FLEET_REMOTE_DIR` | /tmp | Remote directory scripts are written to |
//! | `FLEET_PRIVILEGED_SHELL` | sudo bash | Command prefix used to run scripts |
//! | `FLEET_REMOVE_COMMAND` | sudo rm -f | Command prefix used to remove scripts |
//! | `FLEET_SSH_PORT` | 22 | Port used when a device address has none |
//! | `FLEET_HOST_KEY_POLICY` | known-hosts | known-hosts, fingerprint or insecure |
//! | `FLEET_KNOWN_HOSTS` | ~/.ssh/known_hosts | known_hosts file for the known-hosts policy |
//! | `FLEET_HOST_FINGERPRINTS` | (empty) | Comma-separated pinned SHA256 fingerprints |
//! | `FLEET_ALLOW_INLINE_SECRETS` | false | Accept raw passwords in the device list |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::error::ConfigError;
use super::trust::HostKeyPolicy;

pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub(crate) const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 180;
pub(crate) const DEFAULT_CLEANUP_TIMEOUT_SECS: u64 = 30;
pub(crate) const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 30;
pub(crate) const DEFAULT_MAX_CONCURRENCY: usize = 8;
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
pub(crate) const DEFAULT_REMOTE_DIR: &str = "/tmp";
pub(crate) const DEFAULT_PRIVILEGED_SHELL: &str = "sudo bash";
pub(crate) const DEFAULT_REMOVE_COMMAND: &str = "sudo rm -f";
pub(crate) const DEFAULT_SSH_PORT: u16 = 22;
pub(crate) const DEFAULT_HOST_KEY_POLICY: &str = "known-hosts";

/// Maximum retry delay cap
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "FLEET_CONNECT_TIMEOUT";
pub(crate) const SCRIPT_TIMEOUT_ENV_VAR: &str = "FLEET_SCRIPT_TIMEOUT";
pub(crate) const CLEANUP_TIMEOUT_ENV_VAR: &str = "FLEET_CLEANUP_TIMEOUT";
pub(crate) const PROBE_TIMEOUT_ENV_VAR: &str = "FLEET_PROBE_TIMEOUT";
pub(crate) const MAX_CONCURRENCY_ENV_VAR: &str = "FLEET_MAX_CONCURRENCY";
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "FLEET_MAX_RETRIES";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "FLEET_RETRY_DELAY_MS";
pub(crate) const COMPRESSION_ENV_VAR: &str = "FLEET_COMPRESSION";
pub(crate) const REMOTE_DIR_ENV_VAR: &str = "FLEET_REMOTE_DIR";
pub(crate) const PRIVILEGED_SHELL_ENV_VAR: &str = "FLEET_PRIVILEGED_SHELL";
pub(crate) const REMOVE_COMMAND_ENV_VAR: &str = "FLEET_REMOVE_COMMAND";
pub(crate) const SSH_PORT_ENV_VAR: &str = "FLEET_SSH_PORT";
pub(crate) const HOST_KEY_POLICY_ENV_VAR: &str = "FLEET_HOST_KEY_POLICY";
pub(crate) const KNOWN_HOSTS_ENV_VAR: &str = "FLEET_KNOWN_HOSTS";
pub(crate) const HOST_FINGERPRINTS_ENV_VAR: &str = "FLEET_HOST_FINGERPRINTS";
pub(crate) const ALLOW_INLINE_SECRETS_ENV_VAR: &str = "FLEET_ALLOW_INLINE_SECRETS";

/// Values supplied on the command line; `None` defers to env and defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub connect_timeout_secs: Option<u64>,
    pub script_timeout_secs: Option<u64>,
    pub cleanup_timeout_secs: Option<u64>,
    pub probe_timeout_secs: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub compression: Option<bool>,
    pub remote_dir: Option<String>,
    pub privileged_shell: Option<String>,
    pub remove_command: Option<String>,
    pub ssh_port: Option<u16>,
    pub host_key_policy: Option<String>,
    pub known_hosts: Option<PathBuf>,
    pub host_fingerprints: Option<String>,
    pub allow_inline_secrets: Option<bool>,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub connect_timeout: Duration,
    pub script_timeout: Duration,
    pub cleanup_timeout: Duration,
    pub probe_timeout: Duration,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub compression: bool,
    pub remote_dir: String,
    pub privileged_shell: String,
    /// Must run with the same privileges as `privileged_shell`.
    pub remove_command: String,
    pub default_port: u16,
    pub host_key_policy: HostKeyPolicy,
    pub allow_inline_secrets: bool,
}

impl FleetConfig {
    pub fn resolve(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let policy_name = resolve_string(
            overrides.host_key_policy.clone(),
            HOST_KEY_POLICY_ENV_VAR,
            DEFAULT_HOST_KEY_POLICY,
        );
        let known_hosts = overrides
            .known_hosts
            .clone()
            .or_else(|| env::var(KNOWN_HOSTS_ENV_VAR).ok().map(PathBuf::from))
            .unwrap_or_else(default_known_hosts);
        let fingerprints = resolve_string(
            overrides.host_fingerprints.clone(),
            HOST_FINGERPRINTS_ENV_VAR,
            "",
        );

        Ok(Self {
            connect_timeout: resolve_secs(
                overrides.connect_timeout_secs,
                CONNECT_TIMEOUT_ENV_VAR,
                DEFAULT_CONNECT_TIMEOUT_SECS,
            ),
            script_timeout: resolve_secs(
                overrides.script_timeout_secs,
                SCRIPT_TIMEOUT_ENV_VAR,
                DEFAULT_SCRIPT_TIMEOUT_SECS,
            ),
            cleanup_timeout: resolve_secs(
                overrides.cleanup_timeout_secs,
                CLEANUP_TIMEOUT_ENV_VAR,
                DEFAULT_CLEANUP_TIMEOUT_SECS,
            ),
            probe_timeout: resolve_secs(
                overrides.probe_timeout_secs,
                PROBE_TIMEOUT_ENV_VAR,
                DEFAULT_PROBE_TIMEOUT_SECS,
            ),
            max_concurrency: resolve_max_concurrency(overrides.max_concurrency),
            max_retries: resolve_parsed(
                overrides.max_retries,
                MAX_RETRIES_ENV_VAR,
                DEFAULT_MAX_RETRIES,
            ),
            retry_delay: Duration::from_millis(resolve_parsed(
                overrides.retry_delay_ms,
                RETRY_DELAY_MS_ENV_VAR,
                DEFAULT_RETRY_DELAY_MS,
            )),
            compression: resolve_flag(overrides.compression, COMPRESSION_ENV_VAR, true),
            remote_dir: resolve_string(
                overrides.remote_dir.clone(),
                REMOTE_DIR_ENV_VAR,
                DEFAULT_REMOTE_DIR,
            ),
            privileged_shell: resolve_string(
                overrides.privileged_shell.clone(),
                PRIVILEGED_SHELL_ENV_VAR,
                DEFAULT_PRIVILEGED_SHELL,
            ),
            remove_command: resolve_string(
                overrides.remove_command.clone(),
                REMOVE_COMMAND_ENV_VAR,
                DEFAULT_REMOVE_COMMAND,
            ),
            default_port: resolve_parsed(overrides.ssh_port, SSH_PORT_ENV_VAR, DEFAULT_SSH_PORT),
            host_key_policy: HostKeyPolicy::from_parts(&policy_name, known_hosts, &fingerprints)?,
            allow_inline_secrets: resolve_flag(
                overrides.allow_inline_secrets,
                ALLOW_INLINE_SECRETS_ENV_VAR,
                false,
            ),
        })
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            script_timeout: Duration::from_secs(DEFAULT_SCRIPT_TIMEOUT_SECS),
            cleanup_timeout: Duration::from_secs(DEFAULT_CLEANUP_TIMEOUT_SECS),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            compression: true,
            remote_dir: DEFAULT_REMOTE_DIR.to_string(),
            privileged_shell: DEFAULT_PRIVILEGED_SHELL.to_string(),
            remove_command: DEFAULT_REMOVE_COMMAND.to_string(),
            default_port: DEFAULT_SSH_PORT,
            host_key_policy: HostKeyPolicy::KnownHosts(default_known_hosts()),
            allow_inline_secrets: false,
        }
    }
}

fn default_known_hosts() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".ssh")
        .join("known_hosts")
}

/// Resolve a parseable value with priority: parameter -> env var -> default
fn resolve_parsed<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    default
}

fn resolve_secs(param: Option<u64>, env_var: &str, default: u64) -> Duration {
    Duration::from_secs(resolve_parsed(param, env_var, default))
}

fn resolve_string(param: Option<String>, env_var: &str, default: &str) -> String {
    if let Some(value) = param {
        return value;
    }

    match env::var(env_var) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

/// Resolve a boolean flag; the env var accepts `true`/`1` (anything else is false)
fn resolve_flag(param: Option<bool>, env_var: &str, default: bool) -> bool {
    if let Some(flag) = param {
        return flag;
    }

    if let Ok(raw) = env::var(env_var) {
        return raw.eq_ignore_ascii_case("true") || raw == "1";
    }

    default
}

/// Worker pool size; never below one.
pub(crate) fn resolve_max_concurrency(param: Option<usize>) -> usize {
    resolve_parsed(param, MAX_CONCURRENCY_ENV_VAR, DEFAULT_MAX_CONCURRENCY).max(1)
}
