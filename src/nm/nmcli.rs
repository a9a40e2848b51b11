//! `nmcli`-backed NetworkManager client
//!
//! Mutations and lookups go through `nmcli`; the ConnectivityCheckEnabled
//! property is not reachable from nmcli, so that one pair of calls uses
//! `busctl` against the daemon's D-Bus object. Argument construction and
//! output parsing are kept as pure functions so they stay testable without a
//! running daemon.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{ConnectionSpec, IpFamilyConfig, NmClient, NmConnection, NmError};

/// nmcli exit code when the daemon is not running.
const EXIT_NOT_RUNNING: i32 = 8;
/// nmcli exit code when the referenced connection does not exist.
const EXIT_NOT_FOUND: i32 = 10;

const DEFAULT_TIMEOUT_SECS: u64 = 15;

const NM_BUS_NAME: &str = "org.freedesktop.NetworkManager";
const NM_BUS_PATH: &str = "/org/freedesktop/NetworkManager";

pub struct NmCli {
    timeout: Duration,
}

impl NmCli {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(
        &self,
        tool: &'static str,
        label: &str,
        args: &[String],
    ) -> Result<CmdOutput, NmError> {
        debug!("Running {} {}", tool, args.join(" "));

        // A child that outlives the timeout must not land its mutation later
        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(tool)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| NmError::Timeout {
            command: label.to_string(),
            seconds: self.timeout.as_secs(),
        })?
        .map_err(|source| NmError::Launch { tool, source })?;

        Ok(CmdOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn nmcli(&self, label: &str, args: Vec<String>) -> Result<CmdOutput, NmError> {
        self.run("nmcli", label, &args).await
    }

    async fn busctl(&self, label: &str, args: Vec<String>) -> Result<CmdOutput, NmError> {
        let out = self.run("busctl", label, &args).await?;
        if out.code != 0 {
            return Err(out.failure(label));
        }
        Ok(out)
    }
}

impl Default for NmCli {
    fn default() -> Self {
        Self::new()
    }
}

struct CmdOutput {
    code: i32,
    stdout: String,
    stderr: String,
}

impl CmdOutput {
    fn failure(&self, label: &str) -> NmError {
        NmError::CommandFailed {
            command: label.to_string(),
            code: self.code,
            stderr: self.stderr.clone(),
        }
    }
}

#[async_trait]
impl NmClient for NmCli {
    async fn add_connection(&self, spec: &ConnectionSpec) -> Result<(), NmError> {
        let label = "nmcli connection add";
        let out = self.nmcli(label, add_args(spec)).await?;
        match out.code {
            0 => Ok(()),
            EXIT_NOT_RUNNING => Err(NmError::NotRunning),
            _ => Err(out.failure(label)),
        }
    }

    async fn delete_connection(&self, uuid: &str) -> Result<(), NmError> {
        let label = "nmcli connection delete";
        let out = self.nmcli(label, delete_args(uuid)).await?;
        match out.code {
            0 => Ok(()),
            EXIT_NOT_FOUND => Err(NmError::NotFound(uuid.to_string())),
            EXIT_NOT_RUNNING => Err(NmError::NotRunning),
            _ => Err(out.failure(label)),
        }
    }

    async fn get_connection(&self, id: &str) -> Result<Option<NmConnection>, NmError> {
        let label = "nmcli connection show";
        let out = self.nmcli(label, show_args(id)).await?;
        match out.code {
            0 => parse_connection(label, id, &out.stdout).map(Some),
            EXIT_NOT_FOUND => Ok(None),
            EXIT_NOT_RUNNING => Err(NmError::NotRunning),
            _ => Err(out.failure(label)),
        }
    }

    async fn is_running(&self) -> Result<bool, NmError> {
        let label = "nmcli general";
        let args = vec![
            "-t".to_string(),
            "-f".to_string(),
            "RUNNING".to_string(),
            "general".to_string(),
        ];
        let out = self.nmcli(label, args).await?;
        match out.code {
            0 => Ok(out.stdout.trim() == "running"),
            EXIT_NOT_RUNNING => Ok(false),
            _ => Err(out.failure(label)),
        }
    }

    async fn connectivity_check_enabled(&self) -> Result<bool, NmError> {
        let label = "busctl get-property";
        let args = vec![
            "get-property".to_string(),
            NM_BUS_NAME.to_string(),
            NM_BUS_PATH.to_string(),
            NM_BUS_NAME.to_string(),
            "ConnectivityCheckEnabled".to_string(),
        ];
        let out = self.busctl(label, args).await?;
        parse_bus_bool(label, &out.stdout)
    }

    async fn set_connectivity_check(&self, enabled: bool) -> Result<(), NmError> {
        let label = "busctl set-property";
        let args = vec![
            "set-property".to_string(),
            NM_BUS_NAME.to_string(),
            NM_BUS_PATH.to_string(),
            NM_BUS_NAME.to_string(),
            "ConnectivityCheckEnabled".to_string(),
            "b".to_string(),
            if enabled { "true" } else { "false" }.to_string(),
        ];
        self.busctl(label, args).await?;
        Ok(())
    }
}

/// Build the `nmcli connection add` argument list for a dummy profile.
fn add_args(spec: &ConnectionSpec) -> Vec<String> {
    let mut args: Vec<String> = [
        "connection",
        "add",
        "type",
        "dummy",
        "con-name",
        &spec.id,
        "ifname",
        &spec.interface,
        "autoconnect",
        "yes",
        "save",
        if spec.persist { "yes" } else { "no" },
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.extend(family_args("ipv4", spec.ipv4.as_ref()));
    args.extend(family_args("ipv6", spec.ipv6.as_ref()));
    args
}

fn family_args(family: &str, config: Option<&IpFamilyConfig>) -> Vec<String> {
    let Some(config) = config else {
        return vec![format!("{family}.method"), "disabled".to_string()];
    };

    let mut args = vec![format!("{family}.method"), "manual".to_string()];

    let addresses = config
        .addresses
        .iter()
        .map(|net| net.to_string())
        .collect::<Vec<_>>()
        .join(",");
    args.push(format!("{family}.addresses"));
    args.push(addresses);

    if let Some(gateway) = config.gateway {
        args.push(format!("{family}.gateway"));
        args.push(gateway.to_string());
    }

    if !config.dns.is_empty() {
        let dns = config
            .dns
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(",");
        args.push(format!("{family}.dns"));
        args.push(dns);
    }

    args.push(format!("{family}.dns-priority"));
    args.push(config.dns_priority.to_string());
    args.push(format!("{family}.ignore-auto-dns"));
    args.push(if config.ignore_auto_dns { "yes" } else { "no" }.to_string());
    args.push(format!("{family}.route-metric"));
    args.push(config.route_metric.to_string());

    args
}

fn delete_args(uuid: &str) -> Vec<String> {
    vec![
        "connection".to_string(),
        "delete".to_string(),
        "uuid".to_string(),
        uuid.to_string(),
    ]
}

fn show_args(id: &str) -> Vec<String> {
    vec![
        "-g".to_string(),
        "connection.id,connection.uuid,connection.interface-name".to_string(),
        "connection".to_string(),
        "show".to_string(),
        "id".to_string(),
        id.to_string(),
    ]
}

/// Parse `nmcli -g` output, one value per line. When several profiles share
/// the id, the first match wins.
fn parse_connection(label: &str, id: &str, stdout: &str) -> Result<NmConnection, NmError> {
    let mut lines = stdout.lines();
    let conn_id = lines.next().unwrap_or(id).trim();
    let uuid = lines.next().map(str::trim).unwrap_or_default();
    if uuid.is_empty() {
        return Err(NmError::UnexpectedOutput {
            command: label.to_string(),
            output: stdout.trim().to_string(),
        });
    }
    let interface = lines
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(NmConnection {
        id: conn_id.to_string(),
        uuid: uuid.to_string(),
        interface,
    })
}

/// busctl prints property values as `<signature> <value>`, e.g. `b true`.
fn parse_bus_bool(label: &str, stdout: &str) -> Result<bool, NmError> {
    match stdout.trim() {
        "b true" => Ok(true),
        "b false" => Ok(false),
        other => Err(NmError::UnexpectedOutput {
            command: label.to_string(),
            output: other.to_string(),
        }),
    }
}
