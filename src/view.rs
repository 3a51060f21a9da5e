// src/view.rs
//! Read-only view model rebuilt from the daemon on every poll.

use chrono::{DateTime, Local, Utc};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use log::{error, warn};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use crate::tailscale::{ClientError, LocalClient, Prefs, Status, non_zero_time};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendState {
    #[default]
    Unknown,
    NeedsLogin,
    NeedsMachineAuth,
    InUseOtherUser,
    Starting,
    Running,
    Stopped,
    Error,
}

impl BackendState {
    pub fn from_wire(state: &str) -> Self {
        match state {
            "NeedsLogin" => Self::NeedsLogin,
            "NeedsMachineAuth" => Self::NeedsMachineAuth,
            "InUseOtherUser" => Self::InUseOtherUser,
            "Starting" => Self::Starting,
            "Running" => Self::Running,
            "Stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::NeedsLogin => "NeedsLogin",
            Self::NeedsMachineAuth => "NeedsMachineAuth",
            Self::InUseOtherUser => "InUseOtherUser",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerView {
    pub id: String,
    pub dns_name: String,
    pub host_name: String,
    pub address: IpAddr,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub last_handshake: Option<DateTime<Utc>>,
    pub online: bool,
    pub exit_node_option: bool,
    pub active_exit_node: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitNodeOption {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreferenceFlags {
    pub want_running: bool,
    pub corp_dns: bool,
    pub route_all: bool,
    pub exit_node_allow_lan_access: bool,
    pub run_ssh: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceDetails {
    pub host_name: String,
    pub os: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_exit_node: bool,
    pub relay: String,
}

/// Everything the window shows for one poll. Replaced wholesale each time.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionView {
    pub state: BackendState,
    pub tunnel_address: Option<IpAddr>,
    pub dns_name: Option<String>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub peers: Vec<PeerView>,
    pub routes: Vec<String>,
    pub exit_node_capable: bool,
    pub exit_node_options: Vec<ExitNodeOption>,
    pub selected_exit_node: Option<String>,
    /// Exit node configured in the daemon, even when it is not offered now.
    pub exit_node_id: Option<String>,
    pub flags: PreferenceFlags,
    pub tags: Vec<String>,
    pub key_expiry: Option<DateTime<Utc>>,
    pub details: Option<DeviceDetails>,
    pub user_login: Option<String>,
    pub last_error: Option<String>,
    pub diagnostics: Vec<String>,
    pub polled_at: DateTime<Local>,
}

impl Default for ConnectionView {
    fn default() -> Self {
        Self {
            state: BackendState::Unknown,
            tunnel_address: None,
            dns_name: None,
            rx_bytes: 0,
            tx_bytes: 0,
            peers: Vec::new(),
            routes: Vec::new(),
            exit_node_capable: false,
            exit_node_options: Vec::new(),
            selected_exit_node: None,
            exit_node_id: None,
            flags: PreferenceFlags::default(),
            tags: Vec::new(),
            key_expiry: None,
            details: None,
            user_login: None,
            last_error: None,
            diagnostics: Vec::new(),
            polled_at: Local::now(),
        }
    }
}

pub fn default_routes() -> [IpNet; 2] {
    [IpNet::V4(Ipv4Net::default()), IpNet::V6(Ipv6Net::default())]
}

/// Only advertising both `0.0.0.0/0` and `::/0` makes this node an exit node.
pub fn is_exit_node_capable(routes: &[IpNet]) -> bool {
    default_routes().iter().all(|d| routes.contains(d))
}

impl ConnectionView {
    /// The view shown when the daemon could not be reached.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            state: BackendState::Error,
            last_error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn from_status(status: &Status, prefs: Option<&Prefs>) -> Self {
        let mut view = Self {
            state: BackendState::from_wire(&status.backend_state),
            ..Default::default()
        };

        if let Some(me) = &status.self_node {
            view.tunnel_address = me.tailscale_ips.first().and_then(|ip| ip.parse().ok());
            view.dns_name = Some(me.dns_name.clone());
            view.rx_bytes = me.rx_bytes;
            view.tx_bytes = me.tx_bytes;
            view.details = Some(DeviceDetails {
                host_name: me.host_name.clone(),
                os: me.os.clone(),
                last_seen: non_zero_time(me.last_seen),
                is_exit_node: me.exit_node,
                relay: me.relay.clone(),
            });
        }

        let mut peers: Vec<_> = status.peers.values().collect();
        peers.sort_by(|a, b| a.dns_name.cmp(&b.dns_name).then_with(|| a.id.cmp(&b.id)));
        for peer in peers {
            let name = if peer.dns_name.is_empty() {
                &peer.id
            } else {
                &peer.dns_name
            };
            let Some(first) = peer.tailscale_ips.first() else {
                view.diagnostics
                    .push(format!("Peer {} has no tunnel address", name));
                continue;
            };
            let address = match first.parse::<IpAddr>() {
                Ok(address) => address,
                Err(e) => {
                    view.diagnostics
                        .push(format!("Invalid IP {} for peer {}: {}", first, name, e));
                    continue;
                }
            };
            if peer.exit_node_option {
                view.exit_node_options.push(ExitNodeOption {
                    name: if peer.host_name.is_empty() {
                        format!("Peer {}", peer.id)
                    } else {
                        peer.host_name.clone()
                    },
                    id: peer.id.clone(),
                });
            }
            view.peers.push(PeerView {
                id: peer.id.clone(),
                dns_name: peer.dns_name.clone(),
                host_name: peer.host_name.clone(),
                address,
                rx_bytes: peer.rx_bytes,
                tx_bytes: peer.tx_bytes,
                last_handshake: non_zero_time(peer.last_handshake),
                online: peer.online,
                exit_node_option: peer.exit_node_option,
                active_exit_node: peer.exit_node,
            });
        }

        view.user_login = status.users.values().next().map(|u| u.login_name.clone());

        if let Some(prefs) = prefs {
            view.routes = prefs
                .advertise_routes
                .iter()
                .map(|r| r.to_string())
                .collect();
            view.exit_node_capable = is_exit_node_capable(&prefs.advertise_routes);
            view.flags = PreferenceFlags {
                want_running: prefs.want_running,
                corp_dns: prefs.corp_dns,
                route_all: prefs.route_all,
                exit_node_allow_lan_access: prefs.exit_node_allow_lan_access,
                run_ssh: prefs.run_ssh,
            };
            view.tags = prefs.advertise_tags.clone();
            view.key_expiry = status.self_node.as_ref().and_then(|me| me.key_expiry);
            view.exit_node_id = Some(prefs.exit_node_id.clone()).filter(|id| !id.is_empty());
            view.selected_exit_node = view
                .exit_node_options
                .iter()
                .find(|o| view.exit_node_id.as_deref() == Some(o.id.as_str()))
                .map(|o| o.id.clone());
        }

        view
    }

    pub fn is_running(&self) -> bool {
        self.state == BackendState::Running
    }

    pub fn logged_in(&self) -> bool {
        self.user_login.is_some()
    }

    pub fn selected_exit_node_name(&self) -> Option<&str> {
        let id = self.selected_exit_node.as_deref()?;
        self.exit_node_options
            .iter()
            .find(|o| o.id == id)
            .map(|o| o.name.as_str())
    }

    /// Text for the exit-node selector.
    pub fn exit_node_label(&self) -> String {
        match (self.selected_exit_node_name(), &self.exit_node_id) {
            (Some(name), _) => name.to_string(),
            (None, Some(id)) => format!("{} (unavailable)", id),
            (None, None) => "None".to_string(),
        }
    }
}

/// Builds a fresh [`ConnectionView`] from the daemon. Never edits preferences.
pub struct StatusPoller<C> {
    client: Arc<C>,
}

impl<C: LocalClient> StatusPoller<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    pub async fn poll(&self) -> Result<ConnectionView, ClientError> {
        let status = self.client.status().await?;
        match self.client.get_preferences().await {
            Ok(prefs) => Ok(ConnectionView::from_status(&status, Some(&prefs))),
            Err(e) => {
                warn!("Error getting preferences: {}", e);
                let mut view = ConnectionView::from_status(&status, None);
                view.diagnostics
                    .push(format!("Failed to get preferences: {}", e));
                Ok(view)
            }
        }
    }

    /// Like [`poll`](Self::poll), but a failure yields the all-empty error view.
    pub async fn refresh(&self) -> ConnectionView {
        match self.poll().await {
            Ok(view) => view,
            Err(e) => {
                error!("Error getting status: {}", e);
                ConnectionView::error(e.to_string())
            }
        }
    }
}
