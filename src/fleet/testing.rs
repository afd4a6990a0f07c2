//! In-memory session doubles for engine and route tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use super::deadline::Deadline;
use super::error::{CommandError, SessionError, TransferError};
use super::secrets::Credential;
use super::session::{RemoteFile, RemoteSession, SessionConnector};
use super::types::{CommandOutput, DeviceRecord};

/// Scripted answer to a command.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockReply {
    pub stdout: String,
    pub stderr: String,
    pub exit: Option<CommandError>,
    pub delay: Duration,
    /// Never finish; only the deadline ends the command.
    pub hang: bool,
}

impl MockReply {
    pub fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            ..Default::default()
        }
    }

    pub fn exit(status: u32, stdout: &str, stderr: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit: Some(CommandError::ExitStatus(status)),
            ..Default::default()
        }
    }

    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

struct Rule {
    prefix: String,
    contains: String,
    reply: MockReply,
}

/// A fake device: files live in a map, commands answer from rules.
///
/// Unmatched commands succeed with no output, except `rm -f <path>` which
/// removes the file from the map.
pub(crate) struct MockSession {
    peer: String,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    commands: Mutex<Vec<String>>,
    rules: Mutex<Vec<Rule>>,
    fail_create: Mutex<Vec<String>>,
    write_delay: Mutex<Duration>,
    active: AtomicUsize,
    peak: AtomicUsize,
    closes: AtomicUsize,
}

impl MockSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peer: "admin@mock:22".to_string(),
            files: Arc::new(Mutex::new(HashMap::new())),
            commands: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
            fail_create: Mutex::new(Vec::new()),
            write_delay: Mutex::new(Duration::ZERO),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    /// Answer commands starting with `prefix` and containing `contains`.
    pub fn reply_when(&self, prefix: &str, contains: &str, reply: MockReply) {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.to_string(),
            contains: contains.to_string(),
            reply,
        });
    }

    /// Answer the execution of the script whose remote name contains `name`.
    pub fn script(&self, name: &str, reply: MockReply) {
        self.reply_when("sudo bash ", name, reply);
    }

    /// Answer the exact command `command`.
    pub fn command(&self, command: &str, reply: MockReply) {
        self.reply_when(command, "", reply);
    }

    /// Make creating a remote file whose path contains `name` fail.
    pub fn fail_create(&self, name: &str) {
        self.fail_create.lock().unwrap().push(name.to_string());
    }

    /// Slow down every remote write.
    pub fn slow_writes(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = delay;
    }

    pub fn files(&self) -> HashMap<String, Vec<u8>> {
        self.files.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn find_reply(&self, command: &str) -> Option<MockReply> {
        self.rules
            .lock()
            .unwrap()
            .iter()
            .find(|r| command.starts_with(&r.prefix) && command.contains(&r.contains))
            .map(|r| r.reply.clone())
    }

    fn remove_quoted_path(&self, command: &str) {
        if let Some(rest) = command.split_once("rm -f ").map(|(_, rest)| rest) {
            let path = rest.trim().trim_matches('\'');
            self.files.lock().unwrap().remove(path);
        }
    }
}

struct MockFile {
    path: String,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    delay: Duration,
}

#[async_trait]
impl RemoteFile for MockFile {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.files
            .lock()
            .unwrap()
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), String> {
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    fn peer(&self) -> &str {
        &self.peer
    }

    async fn create_file(&self, remote_path: &str) -> Result<Box<dyn RemoteFile>, TransferError> {
        let refused = self
            .fail_create
            .lock()
            .unwrap()
            .iter()
            .any(|name| remote_path.contains(name.as_str()));
        if refused {
            return Err(TransferError::Create {
                path: remote_path.to_string(),
                reason: "Permission denied".to_string(),
            });
        }

        self.files
            .lock()
            .unwrap()
            .insert(remote_path.to_string(), Vec::new());
        Ok(Box::new(MockFile {
            path: remote_path.to_string(),
            files: self.files.clone(),
            delay: *self.write_delay.lock().unwrap(),
        }))
    }

    async fn exec(&self, command: &str, deadline: &Deadline) -> CommandOutput {
        self.commands.lock().unwrap().push(command.to_string());
        let in_flight = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(in_flight, Ordering::SeqCst);

        let reply = self.find_reply(command).unwrap_or_default();
        let waited = if reply.hang {
            deadline.run(std::future::pending::<()>()).await
        } else if reply.delay.is_zero() {
            deadline.check()
        } else {
            deadline.run(tokio::time::sleep(reply.delay)).await
        };
        self.active.fetch_sub(1, Ordering::SeqCst);

        if let Err(interrupted) = waited {
            return CommandOutput::failed(CommandError::Interrupted(interrupted));
        }

        if reply.exit.is_none() && command.contains("rm -f ") {
            self.remove_quoted_path(command);
        }

        CommandOutput {
            stdout: reply.stdout.into_bytes(),
            stderr: reply.stderr.into_bytes(),
            exit_err: reply.exit,
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector handing out one shared [`MockSession`], or failing.
pub(crate) struct MockConnector {
    session: Arc<MockSession>,
    error: Option<SessionError>,
    opens: AtomicUsize,
    credentials: Mutex<Vec<Credential>>,
}

impl MockConnector {
    pub fn new(session: Arc<MockSession>) -> Arc<Self> {
        Arc::new(Self {
            session,
            error: None,
            opens: AtomicUsize::new(0),
            credentials: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(error: SessionError) -> Arc<Self> {
        Arc::new(Self {
            session: MockSession::new(),
            error: Some(error),
            opens: AtomicUsize::new(0),
            credentials: Mutex::new(Vec::new()),
        })
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn credentials(&self) -> Vec<Credential> {
        self.credentials.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionConnector for MockConnector {
    async fn open(
        &self,
        _device: &DeviceRecord,
        credential: &Credential,
    ) -> Result<Arc<dyn RemoteSession>, SessionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.credentials.lock().unwrap().push(credential.clone());
        match &self.error {
            Some(error) => Err(error.clone()),
            None => Ok(self.session.clone()),
        }
    }
}

/// Directory for test input files, removed when dropped.
pub(crate) struct Scratch {
    dir: TempDir,
}

impl Scratch {
    pub fn new() -> Self {
        Self {
            dir: tempfile::Builder::new()
                .prefix("switchyard-test-")
                .tempdir()
                .unwrap(),
        }
    }

    /// Write `contents` to `name` inside the scratch dir and return its path.
    pub fn file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }
}

/// Orchestrator over scratch registry and script files, with inline secrets
/// allowed. The files live as long as the returned [`Scratch`].
///
/// `devices` are rows after the header; `scripts` are `(file name, contents)`.
pub(crate) fn orchestrator(
    connector: Arc<dyn SessionConnector>,
    devices: &str,
    scripts: &[(&str, &str)],
) -> (super::orchestrator::Orchestrator, Scratch) {
    let scratch = Scratch::new();
    let device_list = scratch.file(
        "devices.csv",
        &format!("name,address,username,secret\n{}", devices),
    );
    let paths: Vec<String> = scripts
        .iter()
        .map(|(name, body)| scratch.file(name, body).display().to_string())
        .collect();
    let script_list = scratch.file("scripts.txt", &paths.join("\n"));
    let orchestrator = super::orchestrator::Orchestrator::new(
        Arc::new(super::config::FleetConfig::default()),
        connector,
        Arc::new(super::secrets::ReferenceSecretProvider::new(true)),
        device_list,
        script_list,
    );
    (orchestrator, scratch)
}
