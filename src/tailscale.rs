// src/tailscale.rs
//! Boundary to the local tailscaled daemon.
//!
//! Everything the GUI knows about the network comes through [`LocalClient`].
//! [`TailscaleCli`] drives the `tailscale` command-line tool; tests use the
//! in-memory client from the `fake` module.

use chrono::{DateTime, Datelike, Utc};
use ipnet::IpNet;
use log::{debug, info};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::Command as TokioCommand;
use tokio::time::{Duration, timeout};

use crate::config::ClientSettings;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("could not decode output of `{command}`: {source}")]
    Decode {
        command: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },
    #[error("no peer with id {0}")]
    UnknownPeer(String),
    #[error("daemon returned no preferences")]
    NoPrefs,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// The daemon reports "never" as the zero time (`0001-01-01T00:00:00Z`).
pub fn non_zero_time(ts: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    ts.filter(|t| t.year() > 1)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Status {
    #[serde(rename = "BackendState", default)]
    pub backend_state: String,
    #[serde(rename = "Self", default)]
    pub self_node: Option<PeerStatus>,
    #[serde(rename = "Peer", default, deserialize_with = "null_as_default")]
    pub peers: BTreeMap<String, PeerStatus>,
    #[serde(rename = "User", default, deserialize_with = "null_as_default")]
    pub users: BTreeMap<String, UserProfile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PeerStatus {
    #[serde(rename = "ID")]
    pub id: String,
    pub host_name: String,
    #[serde(rename = "DNSName")]
    pub dns_name: String,
    #[serde(rename = "OS")]
    pub os: String,
    #[serde(rename = "TailscaleIPs", deserialize_with = "null_as_default")]
    pub tailscale_ips: Vec<String>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_handshake: Option<DateTime<Utc>>,
    pub online: bool,
    pub exit_node: bool,
    pub exit_node_option: bool,
    pub relay: String,
    pub key_expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UserProfile {
    #[serde(rename = "ID")]
    pub id: i64,
    pub login_name: String,
    pub display_name: String,
}

/// Snapshot of the daemon's preferences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Prefs {
    #[serde(rename = "ControlURL")]
    pub control_url: String,
    pub want_running: bool,
    pub logged_out: bool,
    pub route_all: bool,
    #[serde(rename = "ExitNodeID")]
    pub exit_node_id: String,
    #[serde(rename = "ExitNodeAllowLANAccess")]
    pub exit_node_allow_lan_access: bool,
    #[serde(rename = "CorpDNS")]
    pub corp_dns: bool,
    #[serde(rename = "RunSSH")]
    pub run_ssh: bool,
    pub shields_up: bool,
    pub hostname: String,
    #[serde(deserialize_with = "null_as_default")]
    pub advertise_tags: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub advertise_routes: Vec<IpNet>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefField {
    WantRunning,
    AdvertiseRoutes,
    ExitNodeId,
    CorpDns,
    RouteAll,
    ExitNodeAllowLanAccess,
    RunSsh,
    AdvertiseTags,
}

/// A full [`Prefs`] record plus one flag per editable field. Only fields whose
/// flag is set are applied by the daemon; the rest of the record is ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaskedPrefs {
    pub prefs: Prefs,
    pub want_running_set: bool,
    pub advertise_routes_set: bool,
    pub exit_node_id_set: bool,
    pub corp_dns_set: bool,
    pub route_all_set: bool,
    pub exit_node_allow_lan_access_set: bool,
    pub run_ssh_set: bool,
    pub advertise_tags_set: bool,
}

impl MaskedPrefs {
    pub fn only(prefs: Prefs, field: PrefField) -> Self {
        let mut masked = Self {
            prefs,
            ..Default::default()
        };
        match field {
            PrefField::WantRunning => masked.want_running_set = true,
            PrefField::AdvertiseRoutes => masked.advertise_routes_set = true,
            PrefField::ExitNodeId => masked.exit_node_id_set = true,
            PrefField::CorpDns => masked.corp_dns_set = true,
            PrefField::RouteAll => masked.route_all_set = true,
            PrefField::ExitNodeAllowLanAccess => masked.exit_node_allow_lan_access_set = true,
            PrefField::RunSsh => masked.run_ssh_set = true,
            PrefField::AdvertiseTags => masked.advertise_tags_set = true,
        }
        masked
    }

    pub fn is_set(&self, field: PrefField) -> bool {
        match field {
            PrefField::WantRunning => self.want_running_set,
            PrefField::AdvertiseRoutes => self.advertise_routes_set,
            PrefField::ExitNodeId => self.exit_node_id_set,
            PrefField::CorpDns => self.corp_dns_set,
            PrefField::RouteAll => self.route_all_set,
            PrefField::ExitNodeAllowLanAccess => self.exit_node_allow_lan_access_set,
            PrefField::RunSsh => self.run_ssh_set,
            PrefField::AdvertiseTags => self.advertise_tags_set,
        }
    }

    /// Returns `base` with the masked fields replaced.
    pub fn apply_to(&self, base: &Prefs) -> Prefs {
        let mut out = base.clone();
        let p = &self.prefs;
        if self.want_running_set {
            out.want_running = p.want_running;
        }
        if self.advertise_routes_set {
            out.advertise_routes = p.advertise_routes.clone();
        }
        if self.exit_node_id_set {
            out.exit_node_id = p.exit_node_id.clone();
        }
        if self.corp_dns_set {
            out.corp_dns = p.corp_dns;
        }
        if self.route_all_set {
            out.route_all = p.route_all;
        }
        if self.exit_node_allow_lan_access_set {
            out.exit_node_allow_lan_access = p.exit_node_allow_lan_access;
        }
        if self.run_ssh_set {
            out.run_ssh = p.run_ssh;
        }
        if self.advertise_tags_set {
            out.advertise_tags = p.advertise_tags.clone();
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PingKind {
    Disco,
    Tsmp,
    #[default]
    Icmp,
}

impl PingKind {
    pub const ALL: [PingKind; 3] = [PingKind::Icmp, PingKind::Disco, PingKind::Tsmp];

    pub fn label(self) -> &'static str {
        match self {
            PingKind::Disco => "Disco",
            PingKind::Tsmp => "TSMP",
            PingKind::Icmp => "ICMP",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PingResult {
    pub peer: IpAddr,
    pub summary: String,
    pub latency: Option<Duration>,
}

/// Typed access to the local daemon.
pub trait LocalClient: Send + Sync + 'static {
    fn status(&self) -> impl Future<Output = Result<Status, ClientError>> + Send;
    fn get_preferences(&self) -> impl Future<Output = Result<Prefs, ClientError>> + Send;
    fn edit_preferences(
        &self,
        edit: MaskedPrefs,
    ) -> impl Future<Output = Result<Prefs, ClientError>> + Send;
    /// Starts an interactive login. Returns the URL the user must visit, if
    /// the daemon printed one.
    fn start_interactive_login(
        &self,
    ) -> impl Future<Output = Result<Option<String>, ClientError>> + Send;
    fn logout(&self) -> impl Future<Output = Result<(), ClientError>> + Send;
    fn ping(
        &self,
        addr: IpAddr,
        kind: PingKind,
    ) -> impl Future<Output = Result<PingResult, ClientError>> + Send;
}

pub struct TailscaleCli {
    binary: String,
    socket: Option<PathBuf>,
    login_timeout: Duration,
    command_timeout: Duration,
}

impl TailscaleCli {
    pub fn new(settings: &ClientSettings) -> Self {
        Self {
            binary: settings.binary.clone(),
            socket: settings.socket.clone(),
            login_timeout: settings.login_timeout,
            command_timeout: settings.command_timeout,
        }
    }

    fn describe(&self, args: &[String]) -> String {
        format!("{} {}", self.binary, args.join(" "))
    }

    fn command(&self, args: &[String]) -> TokioCommand {
        let mut cmd = TokioCommand::new(&self.binary);
        if let Some(socket) = &self.socket {
            cmd.arg(format!("--socket={}", socket.display()));
        }
        cmd.args(args).stdin(Stdio::null());
        cmd
    }

    async fn run(&self, args: Vec<String>) -> Result<String, ClientError> {
        let command = self.describe(&args);
        debug!("running {}", command);
        // `up` on a node that needs login waits for browser auth indefinitely.
        let output = timeout(
            self.command_timeout,
            self.command(&args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| ClientError::Timeout {
            command: command.clone(),
            after: self.command_timeout,
        })?
        .map_err(|source| ClientError::Spawn {
            command: command.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(ClientError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn run_json<T: serde::de::DeserializeOwned>(
        &self,
        args: Vec<String>,
    ) -> Result<T, ClientError> {
        let command = self.describe(&args);
        let stdout = self.run(args).await?;
        serde_json::from_str(&stdout).map_err(|source| ClientError::Decode { command, source })
    }

    /// The CLI selects exit nodes by address, not by stable id.
    async fn resolve_exit_node(&self, id: &str) -> Result<Option<IpAddr>, ClientError> {
        if id.is_empty() {
            return Ok(None);
        }
        let status = self.status().await?;
        status
            .peers
            .values()
            .find(|peer| peer.id == id)
            .and_then(|peer| peer.tailscale_ips.first())
            .and_then(|ip| ip.parse().ok())
            .map(Some)
            .ok_or_else(|| ClientError::UnknownPeer(id.to_string()))
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn join_routes(routes: &[IpNet]) -> String {
    routes
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn exit_node_flag(exit_node: Option<IpAddr>) -> String {
    format!(
        "--exit-node={}",
        exit_node.map(|ip| ip.to_string()).unwrap_or_default()
    )
}

/// Builds the CLI invocations that carry out a masked edit, in order.
///
/// Tags can only be changed through `tailscale up`, which must restate every
/// non-default setting, so that path spells out the whole record.
pub fn edit_invocations(edit: &MaskedPrefs, exit_node: Option<IpAddr>) -> Vec<Vec<String>> {
    let p = &edit.prefs;
    let mut invocations = Vec::new();

    if edit.is_set(PrefField::AdvertiseTags) {
        let mut up = args(&["up"]);
        up.push(format!("--advertise-tags={}", p.advertise_tags.join(",")));
        up.push(format!("--advertise-routes={}", join_routes(&p.advertise_routes)));
        up.push(format!("--accept-dns={}", p.corp_dns));
        up.push(format!("--accept-routes={}", p.route_all));
        if exit_node.is_some() {
            up.push(format!(
                "--exit-node-allow-lan-access={}",
                p.exit_node_allow_lan_access
            ));
        }
        up.push(format!("--ssh={}", p.run_ssh));
        up.push(format!("--shields-up={}", p.shields_up));
        if !p.hostname.is_empty() {
            up.push(format!("--hostname={}", p.hostname));
        }
        up.push(exit_node_flag(exit_node));
        invocations.push(up);
        if !p.want_running && !edit.is_set(PrefField::WantRunning) {
            invocations.push(args(&["down"]));
        }
    } else {
        let mut set = args(&["set"]);
        if edit.is_set(PrefField::AdvertiseRoutes) {
            set.push(format!("--advertise-routes={}", join_routes(&p.advertise_routes)));
        }
        if edit.is_set(PrefField::ExitNodeId) {
            set.push(exit_node_flag(exit_node));
        }
        if edit.is_set(PrefField::CorpDns) {
            set.push(format!("--accept-dns={}", p.corp_dns));
        }
        if edit.is_set(PrefField::RouteAll) {
            set.push(format!("--accept-routes={}", p.route_all));
        }
        if edit.is_set(PrefField::ExitNodeAllowLanAccess) {
            set.push(format!(
                "--exit-node-allow-lan-access={}",
                p.exit_node_allow_lan_access
            ));
        }
        if edit.is_set(PrefField::RunSsh) {
            set.push(format!("--ssh={}", p.run_ssh));
        }
        if set.len() > 1 {
            invocations.push(set);
        }
    }

    if edit.is_set(PrefField::WantRunning) {
        invocations.push(args(&[if p.want_running { "up" } else { "down" }]));
    }
    invocations
}

pub fn ping_args(addr: IpAddr, kind: PingKind) -> Vec<String> {
    let mut out = args(&["ping", "-c", "1"]);
    match kind {
        PingKind::Disco => {}
        PingKind::Tsmp => out.push("--tsmp".to_string()),
        PingKind::Icmp => out.push("--icmp".to_string()),
    }
    out.push(addr.to_string());
    out
}

/// Picks the `pong` line out of `tailscale ping` output, e.g.
/// `pong from host (100.64.0.2) via DERP(fra) in 34ms`.
pub fn parse_ping_output(output: &str) -> Option<(String, Option<Duration>)> {
    let line = output
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("pong"))
        .last()?;
    let latency = line
        .rsplit_once(" in ")
        .and_then(|(_, tail)| tail.trim().strip_suffix("ms"))
        .and_then(|ms| ms.parse::<f64>().ok())
        .map(|ms| Duration::from_secs_f64(ms / 1000.0));
    Some((line.to_string(), latency))
}

pub fn extract_login_url(line: &str) -> Option<String> {
    line.split_whitespace()
        .find(|word| word.starts_with("https://"))
        .map(|url| url.to_string())
}

async fn drain<R: AsyncBufRead + Unpin>(mut lines: Lines<R>) {
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("tailscale login: {}", line);
    }
}

fn exit_status_text(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => e.to_string(),
    }
}

impl LocalClient for TailscaleCli {
    async fn status(&self) -> Result<Status, ClientError> {
        self.run_json(args(&["status", "--json"])).await
    }

    async fn get_preferences(&self) -> Result<Prefs, ClientError> {
        self.run_json::<Option<Prefs>>(args(&["debug", "prefs"]))
            .await?
            .ok_or(ClientError::NoPrefs)
    }

    async fn edit_preferences(&self, edit: MaskedPrefs) -> Result<Prefs, ClientError> {
        let exit_node = if edit.exit_node_id_set || edit.advertise_tags_set {
            self.resolve_exit_node(&edit.prefs.exit_node_id).await?
        } else {
            None
        };
        for invocation in edit_invocations(&edit, exit_node) {
            self.run(invocation).await?;
        }
        self.get_preferences().await
    }

    async fn start_interactive_login(&self) -> Result<Option<String>, ClientError> {
        let login = args(&["login"]);
        let command = self.describe(&login);
        let mut child = self
            .command(&login)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ClientError::Spawn {
                command: command.clone(),
                source,
            })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ClientError::CommandFailed {
                command,
                status: "no output pipes".to_string(),
                stderr: String::new(),
            });
        };
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut seen = Vec::new();

        let scan = async {
            let (mut out_open, mut err_open) = (true, true);
            while out_open || err_open {
                tokio::select! {
                    line = out_lines.next_line(), if out_open => match line {
                        Ok(Some(line)) => {
                            if let Some(url) = extract_login_url(&line) {
                                return Some(url);
                            }
                            seen.push(line);
                        }
                        _ => out_open = false,
                    },
                    line = err_lines.next_line(), if err_open => match line {
                        Ok(Some(line)) => {
                            if let Some(url) = extract_login_url(&line) {
                                return Some(url);
                            }
                            seen.push(line);
                        }
                        _ => err_open = false,
                    },
                }
            }
            None
        };

        let scanned = timeout(self.login_timeout, scan).await;
        match scanned {
            Ok(Some(url)) => {
                info!("login started, waiting for browser authentication");
                // `tailscale login` keeps running until the user finishes in the browser.
                tokio::spawn(async move {
                    tokio::join!(drain(out_lines), drain(err_lines));
                    let status = child.wait().await;
                    info!("tailscale login finished: {}", exit_status_text(status));
                });
                Ok(Some(url))
            }
            Ok(None) => {
                let status = child.wait().await;
                match status {
                    Ok(s) if s.success() => Ok(None),
                    other => Err(ClientError::CommandFailed {
                        command,
                        status: exit_status_text(other),
                        stderr: seen.join("\n"),
                    }),
                }
            }
            Err(_) => {
                let _ = child.kill().await;
                Err(ClientError::Timeout {
                    command,
                    after: self.login_timeout,
                })
            }
        }
    }

    async fn logout(&self) -> Result<(), ClientError> {
        self.run(args(&["logout"])).await.map(|_| ())
    }

    async fn ping(&self, addr: IpAddr, kind: PingKind) -> Result<PingResult, ClientError> {
        let output = self.run(ping_args(addr, kind)).await?;
        let (summary, latency) = parse_ping_output(&output).unwrap_or_else(|| {
            let last = output.lines().rev().find(|l| !l.trim().is_empty());
            (last.unwrap_or("no reply").trim().to_string(), None)
        });
        Ok(PingResult {
            peer: addr,
            summary,
            latency,
        })
    }
}
