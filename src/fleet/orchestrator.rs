//! Ties a device, its session and a script batch together.
//!
//! # Request lifecycle
//!
//! 1. Load the registry and look the device up (`UnknownDevice` on a miss).
//! 2. Load the script list.
//! 3. Resolve the device credential and open one session.
//! 4. Spawn the run: the dispatcher fans the jobs out, the result sink writes
//!    their blocks into a pipe whose read half is handed back to the caller.
//! 5. After the join barrier the session is closed, exactly once.
//!
//! Steps 1-3 fail the request before anything runs on the device. From
//! step 4 on, failures are per script and show up in the stream.
//!
//! The registry and script list are read again for every request, so edits
//! take effect without a restart.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, info, warn};

use super::config::FleetConfig;
use super::dispatcher::Dispatcher;
use super::error::{OrchestrationError, RegistryError};
use super::inspector;
use super::registry::DeviceRegistry;
use super::scripts;
use super::secrets::{ReferenceSecretProvider, SecretProvider};
use super::session::{RemoteSession, SessionConnector, SshConnector};
use super::sink::{ResultSink, SinkOrder};
use super::task::TaskSettings;
use super::types::{DeviceRecord, DeviceSnapshot};

/// Pipe capacity between the result sink and the response body.
const STREAM_BUFFER: usize = 64 * 1024;

/// Outcome of a finished run, for logs and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub device: String,
    pub scripts: usize,
    pub failed: usize,
    pub cleanup_failed: usize,
    /// The response reader went away before the run finished.
    pub client_gone: bool,
}

/// Read half of a run's response pipe.
///
/// Dropping it before the trailer was read cancels the run, so a client that
/// goes away stops its scripts even when nothing is being written.
pub struct RunBody {
    pipe: DuplexStream,
    _cancel_on_drop: DropGuard,
}

impl AsyncRead for RunBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.pipe).poll_read(cx, buf)
    }
}

/// A started orchestration run.
pub struct Run {
    /// Response stream: one block per script, then the trailer.
    pub body: RunBody,
    /// Resolves once every task finished and the session is closed.
    pub handle: JoinHandle<RunSummary>,
}

pub struct Orchestrator {
    config: Arc<FleetConfig>,
    connector: Arc<dyn SessionConnector>,
    secrets: Arc<dyn SecretProvider>,
    device_list: PathBuf,
    script_list: PathBuf,
}

impl Orchestrator {
    pub fn new(
        config: Arc<FleetConfig>,
        connector: Arc<dyn SessionConnector>,
        secrets: Arc<dyn SecretProvider>,
        device_list: PathBuf,
        script_list: PathBuf,
    ) -> Self {
        Self {
            config,
            connector,
            secrets,
            device_list,
            script_list,
        }
    }

    /// Orchestrator dialing real devices over SSH.
    pub fn ssh(config: FleetConfig, device_list: PathBuf, script_list: PathBuf) -> Self {
        let config = Arc::new(config);
        let secrets = Arc::new(ReferenceSecretProvider::new(config.allow_inline_secrets));
        let connector = Arc::new(SshConnector::new(config.clone()));
        Self::new(config, connector, secrets, device_list, script_list)
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Fresh snapshot of the device registry.
    pub async fn registry(&self) -> Result<DeviceRegistry, RegistryError> {
        DeviceRegistry::load(&self.device_list).await
    }

    async fn lookup(&self, name: &str) -> Result<DeviceRecord, OrchestrationError> {
        self.registry()
            .await?
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestrationError::UnknownDevice(name.to_string()))
    }

    async fn open_session(
        &self,
        device: &DeviceRecord,
    ) -> Result<Arc<dyn RemoteSession>, OrchestrationError> {
        let credential = self.secrets.resolve(device).await?;
        let session = self.connector.open(device, &credential).await.map_err(|e| {
            error!("Cannot open session to {}: {}", device.name, e);
            e
        })?;
        Ok(session)
    }

    /// Run the configured script list on the registered device `name`.
    pub async fn run_device(
        &self,
        name: &str,
        order: SinkOrder,
        cancel: CancellationToken,
    ) -> Result<Run, OrchestrationError> {
        let device = self.lookup(name).await?;
        let scripts = scripts::load(&self.script_list).await?;
        self.run(&device, scripts, order, cancel).await
    }

    /// Run `scripts` on `device`.
    ///
    /// Returns once the session is open; the run continues in the background
    /// and ends when every script has been cleaned up. Cancelling `cancel`
    /// stops the scripts, but never their cleanup.
    pub async fn run(
        &self,
        device: &DeviceRecord,
        scripts: Vec<PathBuf>,
        order: SinkOrder,
        cancel: CancellationToken,
    ) -> Result<Run, OrchestrationError> {
        let session = self.open_session(device).await?;
        let jobs = scripts::jobs(&scripts, &self.config.remote_dir);
        let dispatcher = Dispatcher::new(
            TaskSettings::from(self.config.as_ref()),
            self.config.max_concurrency,
        );
        let (writer, pipe) = tokio::io::duplex(STREAM_BUFFER);
        let run_cancel = cancel.child_token();
        let body = RunBody {
            pipe,
            _cancel_on_drop: run_cancel.clone().drop_guard(),
        };
        let device_name = device.name.clone();

        info!(
            "Running {} script(s) on {} ({:?} order)",
            jobs.len(),
            device_name,
            order
        );

        let handle = tokio::spawn(async move {
            let total = jobs.len();
            let dispatch = dispatcher.spawn(session.clone(), jobs, run_cancel.clone());
            let drained = ResultSink::new(writer, order, run_cancel.clone())
                .drain(dispatch.results)
                .await;
            if let Err(e) = dispatch.handle.await {
                error!("Dispatcher for {} failed: {}", device_name, e);
            }
            session.close().await;

            let mut summary = RunSummary {
                device: device_name,
                scripts: total,
                ..Default::default()
            };
            match drained {
                Ok(report) => {
                    summary.failed = report.failed;
                    summary.cleanup_failed = report.cleanup_failed;
                }
                Err(e) => {
                    warn!("Response for {} was not delivered: {}", summary.device, e);
                    summary.client_gone = true;
                }
            }
            info!(
                "Finished {} script(s) on {}: {} failed, {} not cleaned up",
                summary.scripts, summary.device, summary.failed, summary.cleanup_failed
            );
            summary
        });

        Ok(Run { body, handle })
    }

    /// Probe the registered device `name`.
    ///
    /// The probes run in their own task, so the session is closed even when
    /// the caller stops waiting. Cancelling `cancel` cuts the probes short.
    pub async fn inspect(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<DeviceSnapshot, OrchestrationError> {
        let device = self.lookup(name).await?;
        let session = self.open_session(&device).await?;
        let probe_timeout = self.config.probe_timeout;

        tokio::spawn(async move {
            let snapshot = inspector::inspect(session.as_ref(), probe_timeout, &cancel).await;
            session.close().await;
            snapshot
        })
        .await
        .map_err(|e| {
            error!("Inspection of {} failed: {}", device.name, e);
            OrchestrationError::Inspection {
                device: device.name.clone(),
                reason: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::fleet::error::SessionError;
    use crate::fleet::secrets::Credential;
    use crate::fleet::testing::{self, MockConnector, MockReply, MockSession, Scratch};

    struct Fixture {
        orchestrator: Orchestrator,
        session: Arc<MockSession>,
        connector: Arc<MockConnector>,
        _scratch: Scratch,
    }

    fn fixture(devices: &str, scripts: &[(&str, &str)]) -> Fixture {
        let session = MockSession::new();
        fixture_with(MockConnector::new(session.clone()), session, devices, scripts)
    }

    fn fixture_with(
        connector: Arc<MockConnector>,
        session: Arc<MockSession>,
        devices: &str,
        scripts: &[(&str, &str)],
    ) -> Fixture {
        let (orchestrator, scratch) = testing::orchestrator(connector.clone(), devices, scripts);
        Fixture {
            orchestrator,
            session,
            connector,
            _scratch: scratch,
        }
    }

    async fn read_all(mut body: RunBody) -> String {
        let mut out = String::new();
        body.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_mixed_batch_on_sw1() {
        let fx = fixture(
            "sw1,10.0.0.1,admin,hunter2\n",
            &[("a.sh", "echo ok-a\n"), ("b.sh", "exit 1\n")],
        );
        fx.session.script("a.sh", MockReply::ok("ok-a"));
        fx.session.script("b.sh", MockReply::exit(1, "", "b broke"));

        let run = fx
            .orchestrator
            .run_device("sw1", SinkOrder::Completion, CancellationToken::new())
            .await
            .unwrap();
        let body = read_all(run.body).await;
        let summary = run.handle.await.unwrap();

        assert!(body.contains("ok-a\n"));
        assert!(body.contains("Failed to run script_file /tmp/"));
        assert!(body.contains("b.sh):\nERROR: exited with status 1\nb broke\n"));
        assert!(body.ends_with("\n#EOF\n"));
        assert_eq!(summary.scripts, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.cleanup_failed, 0);

        let removals = fx
            .session
            .commands()
            .iter()
            .filter(|c| c.starts_with("sudo rm -f "))
            .count();
        assert_eq!(removals, 2);
        assert!(fx.session.files().is_empty());
        assert_eq!(fx.session.close_count(), 1);
        assert_eq!(
            fx.connector.credentials(),
            vec![Credential::Password("hunter2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_script_list_order() {
        let fx = fixture(
            "sw1,10.0.0.1,admin,hunter2\n",
            &[("slow.sh", ""), ("fast.sh", "")],
        );
        fx.session
            .script("slow.sh", MockReply::ok("slow").after(Duration::from_millis(50)));
        fx.session.script("fast.sh", MockReply::ok("fast"));

        let run = fx
            .orchestrator
            .run_device("sw1", SinkOrder::ScriptList, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(read_all(run.body).await, "slow\nfast\n\n#EOF\n");
    }

    #[tokio::test]
    async fn test_unknown_device_never_dials() {
        let fx = fixture("sw1,10.0.0.1,admin,hunter2\n", &[("a.sh", "")]);

        let err = fx
            .orchestrator
            .run_device("sw9", SinkOrder::Completion, CancellationToken::new())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, OrchestrationError::UnknownDevice(name) if name == "sw9"));
        assert_eq!(fx.connector.open_count(), 0);
    }

    #[tokio::test]
    async fn test_dial_failure_is_fatal_to_request() {
        let session = MockSession::new();
        let connector = MockConnector::failing(SessionError::Dial {
            address: "10.0.0.1:22".to_string(),
            reason: "Connection refused".to_string(),
        });
        let fx = fixture_with(
            connector,
            session,
            "sw1,10.0.0.1,admin,hunter2\n",
            &[("a.sh", "")],
        );

        let err = fx
            .orchestrator
            .run_device("sw1", SinkOrder::Completion, CancellationToken::new())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, OrchestrationError::Session(SessionError::Dial { .. })));
        assert!(fx.session.commands().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_secret_never_dials() {
        let fx = fixture("sw1,10.0.0.1,admin,env:SWITCHYARD_TEST_UNSET_SECRET\n", &[]);

        let err = fx
            .orchestrator
            .run_device("sw1", SinkOrder::Completion, CancellationToken::new())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, OrchestrationError::Secret(_)));
        assert_eq!(fx.connector.open_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_reader_still_cleans_up() {
        let fx = fixture(
            "sw1,10.0.0.1,admin,hunter2\n",
            &[("a.sh", ""), ("b.sh", "")],
        );
        fx.session.script("a.sh", MockReply::ok("ok-a"));
        fx.session.script("b.sh", MockReply::hang());

        let run = fx
            .orchestrator
            .run_device("sw1", SinkOrder::Completion, CancellationToken::new())
            .await
            .unwrap();
        drop(run.body);
        // b.sh only ends through the cancel raised by the failed write of a.sh
        let summary = tokio::time::timeout(Duration::from_secs(5), run.handle)
            .await
            .unwrap()
            .unwrap();

        assert!(summary.client_gone);
        assert!(fx.session.files().is_empty());
        assert_eq!(fx.session.close_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_body_stops_silent_script() {
        let fx = fixture("sw1,10.0.0.1,admin,hunter2\n", &[("hang.sh", "")]);
        fx.session.script("hang.sh", MockReply::hang());

        let run = fx
            .orchestrator
            .run_device("sw1", SinkOrder::Completion, CancellationToken::new())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(3), async {
            while !fx.session.commands().iter().any(|c| c.starts_with("sudo bash ")) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        drop(run.body);
        let summary = tokio::time::timeout(Duration::from_secs(3), run.handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.scripts, 1);
        assert!(fx.session.files().is_empty());
        assert!(fx.session.commands().iter().any(|c| c.starts_with("sudo rm -f ")));
        assert_eq!(fx.session.close_count(), 1);
    }

    #[tokio::test]
    async fn test_caller_cancel_stops_run() {
        let fx = fixture("sw1,10.0.0.1,admin,hunter2\n", &[("a.sh", "")]);
        fx.session.script("a.sh", MockReply::hang());
        let cancel = CancellationToken::new();

        let run = fx
            .orchestrator
            .run_device("sw1", SinkOrder::Completion, cancel.clone())
            .await
            .unwrap();
        cancel.cancel();
        let body = read_all(run.body).await;

        assert!(body.contains("cancelled during"));
        assert!(body.ends_with("\n#EOF\n"));
        assert_eq!(run.handle.await.unwrap().failed, 1);
        assert!(fx.session.files().is_empty());
    }

    #[tokio::test]
    async fn test_inspect_closes_session() {
        let fx = fixture("sw1,10.0.0.1,admin,hunter2\n", &[]);

        let snapshot = fx
            .orchestrator
            .inspect("sw1", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(snapshot.memory_types.len(), 4);
        assert_eq!(fx.session.close_count(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_inspect_still_closes_session() {
        let Fixture {
            orchestrator,
            session,
            _scratch,
            ..
        } = fixture("sw1,10.0.0.1,admin,hunter2\n", &[]);
        session.command("redis-cli", MockReply::hang());
        let orchestrator = Arc::new(orchestrator);

        let request = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move {
                let cancel = CancellationToken::new();
                let _cancel_on_drop = cancel.clone().drop_guard();
                orchestrator.inspect("sw1", cancel).await
            }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        request.abort();
        assert!(request.await.unwrap_err().is_cancelled());

        tokio::time::timeout(Duration::from_secs(3), async {
            while session.close_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(session.close_count(), 1);
    }
}
