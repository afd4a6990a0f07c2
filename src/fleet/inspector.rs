//! Sequential diagnostic probe of a device.
//!
//! Each probe is one command on its own sub-channel, run strictly one after
//! the other. A failed probe leaves its snapshot field empty, is noted in
//! `probe_errors`, and never stops the remaining probes.

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::command;
use super::deadline::Deadline;
use super::error::CommandError;
use super::session::RemoteSession;
use super::types::{CommandOutput, DeviceSnapshot};

/// Memory categories reported for every device.
pub const MEMORY_TYPES: [&str; 4] = ["free", "used", "shared", "cache"];

/// Snapshot field filled by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeField {
    TemperatureSensors,
    Containers,
    OsVersion,
    AsicType,
    KernelVersion,
    SaiVersion,
    ActiveInterfaces,
}

impl fmt::Display for ProbeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeField::TemperatureSensors => "temperature_sensors",
            ProbeField::Containers => "containers",
            ProbeField::OsVersion => "os_version",
            ProbeField::AsicType => "asic_type",
            ProbeField::KernelVersion => "kernel_version",
            ProbeField::SaiVersion => "sai_version",
            ProbeField::ActiveInterfaces => "active_interfaces",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Probe {
    pub field: ProbeField,
    pub command: &'static str,
}

/// Probes in execution order.
pub const PROBES: &[Probe] = &[
    Probe {
        field: ProbeField::TemperatureSensors,
        command: r#"redis-cli -n 6 keys "*TEMPERATURE_INFO*" | cut -d'|' -f 2"#,
    },
    Probe {
        field: ProbeField::Containers,
        command: r#"docker ps -a --format "{{.Names}}""#,
    },
    Probe {
        field: ProbeField::OsVersion,
        command: "show version | grep 'SONiC Software Version' | cut -d':' -f 2",
    },
    Probe {
        field: ProbeField::AsicType,
        command: "show version | grep 'ASIC:' | cut -d':' -f 2",
    },
    Probe {
        field: ProbeField::KernelVersion,
        command: "show version | grep 'Kernel' | cut -d':' -f 2",
    },
    Probe {
        field: ProbeField::SaiVersion,
        command: r#"docker exec syncd bash -c "dpkg -l | grep sai" | head -1 | awk '{print $2" "$3}'"#,
    },
    Probe {
        field: ProbeField::ActiveInterfaces,
        command: "show interfaces status | grep -c ' up '",
    },
];

/// Run every probe against `session` and fold the output into a snapshot.
pub async fn inspect(
    session: &dyn RemoteSession,
    probe_timeout: Duration,
    cancel: &CancellationToken,
) -> DeviceSnapshot {
    let mut snapshot = DeviceSnapshot {
        memory_types: MEMORY_TYPES.iter().map(|m| m.to_string()).collect(),
        ..Default::default()
    };

    for probe in PROBES {
        let deadline = Deadline::after(probe_timeout, cancel.clone());
        let output = command::run(session, probe.command, &deadline).await;

        match probe_failure(probe, &output) {
            Some(e) => {
                warn!("Probe {} on {} failed: {}", probe.field, session.peer(), e);
                snapshot.probe_errors.push(format!("{}: {}", probe.field, e));
            }
            None => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                apply(&mut snapshot, probe.field, &stdout);
            }
        }
    }

    snapshot.collected_at = chrono::Utc::now().to_rfc3339();
    info!(
        "Inspected {} ({} probe(s) failed)",
        session.peer(),
        snapshot.probe_errors.len()
    );
    snapshot
}

fn probe_failure<'a>(probe: &Probe, output: &'a CommandOutput) -> Option<&'a CommandError> {
    match &output.exit_err {
        // grep -c exits 1 when it counted zero matches
        Some(CommandError::ExitStatus(1))
            if probe.field == ProbeField::ActiveInterfaces && !output.stdout.is_empty() =>
        {
            None
        }
        other => other.as_ref(),
    }
}

fn apply(snapshot: &mut DeviceSnapshot, field: ProbeField, stdout: &str) {
    debug!("Probe {} returned {} bytes", field, stdout.len());
    match field {
        ProbeField::TemperatureSensors => snapshot.temperature_sensors = parse_list(stdout),
        ProbeField::Containers => snapshot.containers = parse_list(stdout),
        ProbeField::OsVersion => snapshot.os_version = parse_value(stdout),
        ProbeField::AsicType => snapshot.asic_type = parse_value(stdout),
        ProbeField::KernelVersion => snapshot.kernel_version = parse_value(stdout),
        ProbeField::SaiVersion => snapshot.sai_version = parse_value(stdout),
        ProbeField::ActiveInterfaces => snapshot.active_interfaces = parse_value(stdout),
    }
}

/// One entry per non-empty line, trimmed.
pub fn parse_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Trimmed first line.
pub fn parse_value(stdout: &str) -> String {
    stdout.lines().next().unwrap_or_default().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::testing::{MockReply, MockSession};

    fn probe_command(field: ProbeField) -> &'static str {
        PROBES.iter().find(|p| p.field == field).unwrap().command
    }

    fn healthy_switch() -> std::sync::Arc<MockSession> {
        let session = MockSession::new();
        session.command(
            probe_command(ProbeField::TemperatureSensors),
            MockReply::ok("CPU\nASIC\n\n"),
        );
        session.command(
            probe_command(ProbeField::Containers),
            MockReply::ok("swss\nsyncd\nbgp\n"),
        );
        session.command(
            probe_command(ProbeField::OsVersion),
            MockReply::ok(" SONiC.202305.1\n"),
        );
        session.command(probe_command(ProbeField::AsicType), MockReply::ok(" broadcom\n"));
        session.command(
            probe_command(ProbeField::KernelVersion),
            MockReply::ok(" 5.10.0-18-2-amd64\n"),
        );
        session.command(
            probe_command(ProbeField::SaiVersion),
            MockReply::ok("libsaibcm 8.4.0.2\n"),
        );
        session.command(probe_command(ProbeField::ActiveInterfaces), MockReply::ok("12\n"));
        session
    }

    mod parsing {
        use super::*;

        #[test]
        fn test_list_drops_blank_lines() {
            assert_eq!(parse_list("a\n\n b \n\n"), vec!["a", "b"]);
        }

        #[test]
        fn test_empty_list() {
            assert!(parse_list("").is_empty());
            assert!(parse_list("\n").is_empty());
        }

        #[test]
        fn test_value_takes_first_line() {
            assert_eq!(parse_value(" 5.10\nignored\n"), "5.10");
            assert_eq!(parse_value(""), "");
        }
    }

    mod probing {
        use super::*;

        #[tokio::test]
        async fn test_full_snapshot() {
            let session = healthy_switch();

            let snapshot =
                inspect(session.as_ref(), Duration::from_secs(5), &CancellationToken::new()).await;

            assert_eq!(snapshot.temperature_sensors, vec!["CPU", "ASIC"]);
            assert_eq!(snapshot.containers, vec!["swss", "syncd", "bgp"]);
            assert_eq!(snapshot.memory_types, vec!["free", "used", "shared", "cache"]);
            assert_eq!(snapshot.os_version, "SONiC.202305.1");
            assert_eq!(snapshot.asic_type, "broadcom");
            assert_eq!(snapshot.kernel_version, "5.10.0-18-2-amd64");
            assert_eq!(snapshot.sai_version, "libsaibcm 8.4.0.2");
            assert_eq!(snapshot.active_interfaces, "12");
            assert!(snapshot.probe_errors.is_empty());
            assert!(!snapshot.collected_at.is_empty());
        }

        #[tokio::test]
        async fn test_probes_run_in_order() {
            let session = healthy_switch();

            inspect(session.as_ref(), Duration::from_secs(5), &CancellationToken::new()).await;

            let expected: Vec<String> = PROBES.iter().map(|p| p.command.to_string()).collect();
            assert_eq!(session.commands(), expected);
        }

        #[tokio::test]
        async fn test_empty_containers_is_empty_list() {
            let session = MockSession::new();
            session.command(
                probe_command(ProbeField::OsVersion),
                MockReply::ok(" SONiC.202305.1\n"),
            );

            let snapshot =
                inspect(session.as_ref(), Duration::from_secs(5), &CancellationToken::new()).await;

            assert_eq!(snapshot.containers, Vec::<String>::new());
            assert_eq!(snapshot.os_version, "SONiC.202305.1");
            assert!(snapshot.probe_errors.is_empty());
        }

        #[tokio::test]
        async fn test_failed_probe_degrades_one_field() {
            let session = MockSession::new();
            session.command(
                probe_command(ProbeField::KernelVersion),
                MockReply::exit(127, "junk", "show: not found"),
            );
            for probe in PROBES {
                if probe.field != ProbeField::KernelVersion {
                    session.command(probe.command, MockReply::ok("value\n"));
                }
            }

            let snapshot =
                inspect(session.as_ref(), Duration::from_secs(5), &CancellationToken::new()).await;

            assert_eq!(snapshot.kernel_version, "");
            assert_eq!(snapshot.os_version, "value");
            assert_eq!(snapshot.sai_version, "value");
            assert_eq!(snapshot.probe_errors.len(), 1);
            assert!(snapshot.probe_errors[0].starts_with("kernel_version: "));
        }

        #[tokio::test]
        async fn test_zero_active_interfaces() {
            let session = MockSession::new();
            session.command(
                probe_command(ProbeField::ActiveInterfaces),
                MockReply::exit(1, "0\n", ""),
            );

            let snapshot =
                inspect(session.as_ref(), Duration::from_secs(5), &CancellationToken::new()).await;

            assert_eq!(snapshot.active_interfaces, "0");
            assert!(snapshot.probe_errors.is_empty());
        }

        #[tokio::test(start_paused = true)]
        async fn test_hung_probe_times_out_and_rest_continue() {
            let session = MockSession::new();
            session.command(probe_command(ProbeField::TemperatureSensors), MockReply::hang());
            session.command(probe_command(ProbeField::AsicType), MockReply::ok("broadcom\n"));

            let snapshot =
                inspect(session.as_ref(), Duration::from_secs(2), &CancellationToken::new()).await;

            assert!(snapshot.temperature_sensors.is_empty());
            assert_eq!(snapshot.asic_type, "broadcom");
            assert_eq!(snapshot.probe_errors, vec!["temperature_sensors: command timed out"]);
        }
    }
}
