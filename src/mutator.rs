// src/mutator.rs
use ipnet::IpNet;
use log::debug;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

use crate::tailscale::{ClientError, LocalClient, MaskedPrefs, PrefField, Prefs};
use crate::view::default_routes;

/// One user-level change to the daemon's preferences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreferenceEdit {
    SetRunning(bool),
    AddRoute(String),
    /// Index into the advertised routes, in display order.
    RemoveRoute(usize),
    SetExitNode(Option<String>),
    RunAsExitNode(bool),
    SetDnsManaged(bool),
    SetAcceptRoutes(bool),
    SetAllowLanWithExitNode(bool),
    SetSshEnabled(bool),
    SetTags(String),
}

impl fmt::Display for PreferenceEdit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetRunning(true) => write!(f, "connect"),
            Self::SetRunning(false) => write!(f, "disconnect"),
            Self::AddRoute(cidr) => write!(f, "add route {}", cidr.trim()),
            Self::RemoveRoute(idx) => write!(f, "remove route #{}", idx),
            Self::SetExitNode(Some(id)) => write!(f, "set exit node {}", id),
            Self::SetExitNode(None) => write!(f, "clear exit node"),
            Self::RunAsExitNode(v) => write!(f, "set Run Exit Node to {}", v),
            Self::SetDnsManaged(v) => write!(f, "set Corp DNS to {}", v),
            Self::SetAcceptRoutes(v) => write!(f, "set Route All to {}", v),
            Self::SetAllowLanWithExitNode(v) => write!(f, "set Allow Local Networks to {}", v),
            Self::SetSshEnabled(v) => write!(f, "set SSH to {}", v),
            Self::SetTags(raw) => write!(f, "set tags to '{}'", raw.trim()),
        }
    }
}

#[derive(Debug, Error)]
pub enum MutationError {
    #[error(transparent)]
    Transport(ClientError),
    #[error("Invalid CIDR '{input}': {reason}")]
    Validation { input: String, reason: String },
    #[error("Invalid route index {index} (have {len} routes)")]
    Range { index: usize, len: usize },
    #[error("Route {0} is already being advertised")]
    Duplicate(String),
    #[error("Preferences are unusable: {0}")]
    Inconsistent(String),
}

impl From<ClientError> for MutationError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::NoPrefs => Self::Inconsistent(err.to_string()),
            other => Self::Transport(other),
        }
    }
}

impl MutationError {
    /// Duplicates are reported to the user but are not failures.
    pub fn is_informational(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Splits `raw` on commas, trims each part and drops empty ones.
pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses a CIDR prefix and clears its host bits, so `10.0.0.1/8` becomes
/// `10.0.0.0/8`.
pub fn parse_route(raw: &str) -> Result<IpNet, MutationError> {
    let cidr = raw.trim();
    if cidr.is_empty() {
        return Err(MutationError::Validation {
            input: String::new(),
            reason: "Please enter a subnet in CIDR format.".to_string(),
        });
    }
    cidr.parse()
        .map(|net: IpNet| net.trunc())
        .map_err(|e: ipnet::AddrParseError| MutationError::Validation {
            input: cidr.to_string(),
            reason: e.to_string(),
        })
}

/// Applies a single [`PreferenceEdit`] with fetch, change one field, submit.
///
/// The fetch and the submit are not atomic: a change made elsewhere in
/// between is overwritten (last writer wins).
pub struct PreferenceMutator<C> {
    client: Arc<C>,
    refresh: Arc<Notify>,
}

impl<C: LocalClient> PreferenceMutator<C> {
    pub fn new(client: Arc<C>, refresh: Arc<Notify>) -> Self {
        Self { client, refresh }
    }

    pub async fn apply(&self, edit: PreferenceEdit) -> Result<(), MutationError> {
        let masked = match edit {
            PreferenceEdit::SetRunning(running) => MaskedPrefs::only(
                Prefs {
                    want_running: running,
                    ..Default::default()
                },
                PrefField::WantRunning,
            ),
            PreferenceEdit::AddRoute(raw) => {
                let route = parse_route(&raw)?;
                let mut prefs = self.fetch().await?;
                if prefs.advertise_routes.contains(&route) {
                    return Err(MutationError::Duplicate(route.to_string()));
                }
                prefs.advertise_routes.push(route);
                MaskedPrefs::only(prefs, PrefField::AdvertiseRoutes)
            }
            PreferenceEdit::RemoveRoute(index) => {
                let mut prefs = self.fetch().await?;
                let len = prefs.advertise_routes.len();
                if index >= len {
                    return Err(MutationError::Range { index, len });
                }
                prefs.advertise_routes.remove(index);
                MaskedPrefs::only(prefs, PrefField::AdvertiseRoutes)
            }
            PreferenceEdit::SetExitNode(id) => {
                let mut prefs = self.fetch().await?;
                prefs.exit_node_id = id.unwrap_or_default();
                MaskedPrefs::only(prefs, PrefField::ExitNodeId)
            }
            PreferenceEdit::RunAsExitNode(enable) => {
                let mut prefs = self.fetch().await?;
                let defaults = default_routes();
                if enable {
                    for route in defaults {
                        if !prefs.advertise_routes.contains(&route) {
                            prefs.advertise_routes.push(route);
                        }
                    }
                } else {
                    prefs.advertise_routes.retain(|r| !defaults.contains(r));
                }
                MaskedPrefs::only(prefs, PrefField::AdvertiseRoutes)
            }
            PreferenceEdit::SetDnsManaged(v) => {
                let mut prefs = self.fetch().await?;
                prefs.corp_dns = v;
                MaskedPrefs::only(prefs, PrefField::CorpDns)
            }
            PreferenceEdit::SetAcceptRoutes(v) => {
                let mut prefs = self.fetch().await?;
                prefs.route_all = v;
                MaskedPrefs::only(prefs, PrefField::RouteAll)
            }
            PreferenceEdit::SetAllowLanWithExitNode(v) => {
                let mut prefs = self.fetch().await?;
                prefs.exit_node_allow_lan_access = v;
                MaskedPrefs::only(prefs, PrefField::ExitNodeAllowLanAccess)
            }
            PreferenceEdit::SetSshEnabled(v) => {
                let mut prefs = self.fetch().await?;
                prefs.run_ssh = v;
                MaskedPrefs::only(prefs, PrefField::RunSsh)
            }
            PreferenceEdit::SetTags(raw) => {
                let tags = parse_tags(&raw);
                let mut prefs = self.fetch().await?;
                prefs.advertise_tags = tags;
                MaskedPrefs::only(prefs, PrefField::AdvertiseTags)
            }
        };

        let updated = self.client.edit_preferences(masked).await?;
        debug!("preferences now advertise {} routes", updated.advertise_routes.len());
        self.refresh.notify_one();
        Ok(())
    }

    async fn fetch(&self) -> Result<Prefs, MutationError> {
        Ok(self.client.get_preferences().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tailscale::fake::FakeClient;
    use std::time::Duration;

    fn routes(list: &[&str]) -> Vec<IpNet> {
        list.iter().map(|r| r.parse().unwrap()).collect()
    }

    fn setup(prefs: Prefs) -> (Arc<FakeClient>, PreferenceMutator<FakeClient>, Arc<Notify>) {
        let client = Arc::new(FakeClient::with_prefs(prefs));
        let refresh = Arc::new(Notify::new());
        let mutator = PreferenceMutator::new(client.clone(), refresh.clone());
        (client, mutator, refresh)
    }

    #[test]
    fn tags_are_trimmed_and_empty_segments_dropped() {
        assert_eq!(parse_tags(" a, b ,,c "), vec!["a", "b", "c"]);
        assert_eq!(parse_tags("b,a,b"), vec!["b", "a", "b"]);
        assert!(parse_tags("  ").is_empty());
    }

    #[test]
    fn bad_cidr_is_a_validation_error() {
        assert!(matches!(parse_route("10.0.0.0/33"), Err(MutationError::Validation { .. })));
        assert!(matches!(parse_route("nope"), Err(MutationError::Validation { .. })));
        assert!(matches!(parse_route("   "), Err(MutationError::Validation { .. })));
        assert_eq!(parse_route(" 10.0.0.0/8 ").unwrap().to_string(), "10.0.0.0/8");
    }

    #[tokio::test]
    async fn duplicate_route_is_informational_and_not_added_twice() {
        let (client, mutator, _) = setup(Prefs::default());
        mutator
            .apply(PreferenceEdit::AddRoute("10.0.0.0/8".to_string()))
            .await
            .unwrap();
        let err = mutator
            .apply(PreferenceEdit::AddRoute("10.0.0.0/8".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::Duplicate(_)));
        assert!(err.is_informational());
        assert_eq!(client.routes(), vec!["10.0.0.0/8"]);
        assert_eq!(client.edits.lock().unwrap().len(), 1);
    }

    #[test]
    fn routes_are_stored_in_canonical_form() {
        assert_eq!(parse_route("10.0.0.1/8").unwrap().to_string(), "10.0.0.0/8");
        assert_eq!(parse_route("192.168.1.77/24").unwrap().to_string(), "192.168.1.0/24");
        assert_eq!(parse_route("fd00::1/64").unwrap().to_string(), "fd00::/64");
        assert_eq!(parse_route("10.1.2.3/32").unwrap().to_string(), "10.1.2.3/32");
    }

    #[tokio::test]
    async fn host_bits_are_masked_before_the_duplicate_check() {
        let (client, mutator, _) = setup(Prefs::default());
        mutator
            .apply(PreferenceEdit::AddRoute("10.0.0.1/8".to_string()))
            .await
            .unwrap();
        assert_eq!(client.routes(), vec!["10.0.0.0/8"]);

        let err = mutator
            .apply(PreferenceEdit::AddRoute("10.9.9.9/8".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(&err, MutationError::Duplicate(route) if route == "10.0.0.0/8"));
        assert_eq!(client.routes(), vec!["10.0.0.0/8"]);
        assert_eq!(client.edits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_route_never_reaches_the_client() {
        let (client, mutator, _) = setup(Prefs::default());
        let err = mutator
            .apply(PreferenceEdit::AddRoute("300.1.1.0/24".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::Validation { .. }));
        assert!(!err.is_informational());
        assert_eq!(client.prefs_reads.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn remove_route_out_of_range_leaves_routes_alone() {
        let (client, mutator, _) = setup(Prefs {
            advertise_routes: routes(&["10.0.0.0/8", "192.168.1.0/24"]),
            ..Default::default()
        });
        let err = mutator.apply(PreferenceEdit::RemoveRoute(2)).await.unwrap_err();
        assert!(matches!(err, MutationError::Range { index: 2, len: 2 }));
        assert_eq!(client.routes(), vec!["10.0.0.0/8", "192.168.1.0/24"]);
        assert!(client.edits.lock().unwrap().is_empty());

        mutator.apply(PreferenceEdit::RemoveRoute(0)).await.unwrap();
        assert_eq!(client.routes(), vec!["192.168.1.0/24"]);
    }

    #[tokio::test]
    async fn exit_node_toggle_round_trips() {
        let original = routes(&["10.0.0.0/8", "192.168.1.0/24"]);
        let (client, mutator, _) = setup(Prefs {
            advertise_routes: original.clone(),
            ..Default::default()
        });

        mutator.apply(PreferenceEdit::RunAsExitNode(true)).await.unwrap();
        assert_eq!(
            client.routes(),
            vec!["10.0.0.0/8", "192.168.1.0/24", "0.0.0.0/0", "::/0"]
        );
        mutator.apply(PreferenceEdit::RunAsExitNode(true)).await.unwrap();
        assert_eq!(client.routes().len(), 4);

        mutator.apply(PreferenceEdit::RunAsExitNode(false)).await.unwrap();
        assert_eq!(client.prefs.lock().unwrap().advertise_routes, original);
    }

    #[tokio::test]
    async fn enabling_exit_node_adds_only_the_missing_default() {
        let (client, mutator, _) = setup(Prefs {
            advertise_routes: routes(&["::/0"]),
            ..Default::default()
        });
        mutator.apply(PreferenceEdit::RunAsExitNode(true)).await.unwrap();
        assert_eq!(client.routes(), vec!["::/0", "0.0.0.0/0"]);
    }

    #[tokio::test]
    async fn set_tags_replaces_the_whole_list() {
        let (client, mutator, _) = setup(Prefs {
            advertise_tags: vec!["tag:old".to_string()],
            ..Default::default()
        });
        mutator
            .apply(PreferenceEdit::SetTags(" a, b ,,c ".to_string()))
            .await
            .unwrap();
        assert_eq!(client.prefs.lock().unwrap().advertise_tags, vec!["a", "b", "c"]);
        assert!(client.edits.lock().unwrap()[0].is_set(PrefField::AdvertiseTags));
    }

    #[tokio::test]
    async fn set_running_skips_the_fetch_and_masks_one_field() {
        let (client, mutator, _) = setup(Prefs {
            corp_dns: true,
            ..Default::default()
        });
        mutator.apply(PreferenceEdit::SetRunning(true)).await.unwrap();
        assert_eq!(client.prefs_reads.load(std::sync::atomic::Ordering::SeqCst), 0);
        let edits = client.edits.lock().unwrap();
        assert!(edits[0].want_running_set);
        assert!(!edits[0].corp_dns_set);
        let prefs = client.prefs.lock().unwrap();
        assert!(prefs.want_running);
        assert!(prefs.corp_dns);
    }

    #[tokio::test]
    async fn flag_edits_touch_only_their_field() {
        let (client, mutator, _) = setup(Prefs::default());
        mutator.apply(PreferenceEdit::SetDnsManaged(true)).await.unwrap();
        mutator.apply(PreferenceEdit::SetAcceptRoutes(true)).await.unwrap();
        mutator
            .apply(PreferenceEdit::SetAllowLanWithExitNode(true))
            .await
            .unwrap();
        mutator.apply(PreferenceEdit::SetSshEnabled(true)).await.unwrap();
        let prefs = client.prefs.lock().unwrap().clone();
        assert!(prefs.corp_dns && prefs.route_all && prefs.exit_node_allow_lan_access && prefs.run_ssh);
        let fields = [
            PrefField::CorpDns,
            PrefField::RouteAll,
            PrefField::ExitNodeAllowLanAccess,
            PrefField::RunSsh,
        ];
        for (edit, field) in client.edits.lock().unwrap().iter().zip(fields) {
            assert!(edit.is_set(field));
            assert!(!edit.advertise_routes_set);
        }
    }

    #[tokio::test]
    async fn exit_node_can_be_set_and_cleared() {
        let (client, mutator, _) = setup(Prefs::default());
        mutator
            .apply(PreferenceEdit::SetExitNode(Some("n1".to_string())))
            .await
            .unwrap();
        assert_eq!(client.prefs.lock().unwrap().exit_node_id, "n1");
        mutator.apply(PreferenceEdit::SetExitNode(None)).await.unwrap();
        assert_eq!(client.prefs.lock().unwrap().exit_node_id, "");
    }

    #[tokio::test]
    async fn submit_failure_leaves_prefs_and_skips_refresh() {
        let (client, mutator, refresh) = setup(Prefs::default());
        client.set_failing(false, false, true);
        let err = mutator
            .apply(PreferenceEdit::AddRoute("10.0.0.0/8".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::Transport(_)));
        assert!(client.routes().is_empty());
        let woke = tokio::time::timeout(Duration::from_millis(50), refresh.notified()).await;
        assert!(woke.is_err());
    }

    #[tokio::test]
    async fn fetch_failure_aborts() {
        let (client, mutator, _) = setup(Prefs::default());
        client.set_failing(false, true, false);
        let err = mutator.apply(PreferenceEdit::SetSshEnabled(true)).await.unwrap_err();
        assert!(matches!(err, MutationError::Transport(_)));
        assert!(client.edits.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_prefs_map_to_inconsistent() {
        let err = MutationError::from(ClientError::NoPrefs);
        assert!(matches!(err, MutationError::Inconsistent(_)));
    }

    #[tokio::test]
    async fn success_requests_a_refresh() {
        let (_client, mutator, refresh) = setup(Prefs::default());
        mutator.apply(PreferenceEdit::SetSshEnabled(true)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), refresh.notified())
            .await
            .expect("refresh was not requested");
    }
}
