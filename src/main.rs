#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use poem::{Server, listener::TcpListener};
use tracing::info;

use switchyard::fleet::config::ConfigOverrides;
use switchyard::fleet::routes::{self, AppState};
use switchyard::{FleetConfig, Orchestrator};

/// Run scripts on network switches over SSH and serve the results over HTTP.
#[derive(Parser)]
#[command(name = "switchyard")]
#[command(version, about)]
struct Cli {
    /// Device list: CSV with a header row, `name,address,username,secret`
    device_list: PathBuf,

    /// Script list: one local script path per line
    script_list: PathBuf,

    /// HTTP port to listen on
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Dial and authentication timeout in seconds [env: FLEET_CONNECT_TIMEOUT]
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Upload + execute deadline per script in seconds [env: FLEET_SCRIPT_TIMEOUT]
    #[arg(long)]
    script_timeout: Option<u64>,

    /// Remote cleanup timeout in seconds [env: FLEET_CLEANUP_TIMEOUT]
    #[arg(long)]
    cleanup_timeout: Option<u64>,

    /// Timeout per diagnostic probe in seconds [env: FLEET_PROBE_TIMEOUT]
    #[arg(long)]
    probe_timeout: Option<u64>,

    /// Scripts run at once per device [env: FLEET_MAX_CONCURRENCY]
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Dial retries on transient errors [env: FLEET_MAX_RETRIES]
    #[arg(long)]
    max_retries: Option<u32>,

    /// Initial retry delay in milliseconds [env: FLEET_RETRY_DELAY_MS]
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    /// Disable zlib compression [env: FLEET_COMPRESSION]
    #[arg(long)]
    no_compression: bool,

    /// Remote directory scripts are written to [env: FLEET_REMOTE_DIR]
    #[arg(long)]
    remote_dir: Option<String>,

    /// Command prefix used to run scripts [env: FLEET_PRIVILEGED_SHELL]
    #[arg(long)]
    privileged_shell: Option<String>,

    /// Command prefix used to remove scripts [env: FLEET_REMOVE_COMMAND]
    #[arg(long)]
    remove_command: Option<String>,

    /// SSH port for addresses without one [env: FLEET_SSH_PORT]
    #[arg(long)]
    ssh_port: Option<u16>,

    /// known-hosts, fingerprint or insecure [env: FLEET_HOST_KEY_POLICY]
    #[arg(long)]
    host_key_policy: Option<String>,

    /// known_hosts file for the known-hosts policy [env: FLEET_KNOWN_HOSTS]
    #[arg(long)]
    known_hosts: Option<PathBuf>,

    /// Comma-separated pinned SHA256 fingerprints [env: FLEET_HOST_FINGERPRINTS]
    #[arg(long)]
    host_fingerprints: Option<String>,

    /// Accept raw passwords in the device list [env: FLEET_ALLOW_INLINE_SECRETS]
    #[arg(long)]
    allow_inline_secrets: bool,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            connect_timeout_secs: self.connect_timeout,
            script_timeout_secs: self.script_timeout,
            cleanup_timeout_secs: self.cleanup_timeout,
            probe_timeout_secs: self.probe_timeout,
            max_concurrency: self.max_concurrency,
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay_ms,
            compression: self.no_compression.then_some(false),
            remote_dir: self.remote_dir.clone(),
            privileged_shell: self.privileged_shell.clone(),
            remove_command: self.remove_command.clone(),
            ssh_port: self.ssh_port,
            host_key_policy: self.host_key_policy.clone(),
            known_hosts: self.known_hosts.clone(),
            host_fingerprints: self.host_fingerprints.clone(),
            allow_inline_secrets: self.allow_inline_secrets.then_some(true),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = FleetConfig::resolve(&cli.overrides())?;
    info!(
        "Host key policy: {}, up to {} script(s) per device in parallel",
        config.host_key_policy.name(),
        config.max_concurrency
    );

    let orchestrator = Orchestrator::ssh(config, cli.device_list, cli.script_list);
    let app = routes::app(AppState {
        orchestrator: Arc::new(orchestrator),
        port: cli.port,
    });

    let addr = format!("{}:{}", cli.bind, cli.port);
    info!("Starting switchyard on {}", addr);

    Server::new(TcpListener::bind(addr))
        .name("switchyard")
        .run(app)
        .await?;

    Ok(())
}
