// src/manager.rs
//! Background side of the window: one repeating poll task, one worker that
//! serves queued commands, and one-shot ping tasks.

use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::mpsc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc as async_mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};

use crate::config::ClientSettings;
use crate::mutator::{PreferenceEdit, PreferenceMutator};
use crate::tailscale::{LocalClient, PingKind, PingResult};
use crate::view::{ConnectionView, StatusPoller};

const COMMAND_QUEUE_DEPTH: usize = 32;

#[derive(Debug)]
pub enum ManagerMessage {
    LogMessage(String),
    /// Worth telling the user, but not a failure.
    Info(String),
    Error(String),
    Diagnostic(String),
    LoginUrl(String),
    PingResult(PingResult),
}

#[derive(Debug)]
pub enum ManagerCommand {
    Apply(PreferenceEdit),
    Login,
    Logout,
    Refresh,
    Shutdown,
}

fn send_message(tx: &mpsc::Sender<ManagerMessage>, message: ManagerMessage) {
    if let Err(e) = tx.send(message) {
        warn!("TailscaleManager: failed to send message to UI: {}", e);
    }
}

fn log_manager_message(tx: &mpsc::Sender<ManagerMessage>, message: String) {
    info!("{}", message);
    send_message(tx, ManagerMessage::LogMessage(format!("[MANAGER] {}", message)));
}

pub struct TailscaleManager<C> {
    client: Arc<C>,
    settings: ClientSettings,
    handle: Handle,
    command_tx: async_mpsc::Sender<ManagerCommand>,
    message_tx: mpsc::Sender<ManagerMessage>,
    view_rx: watch::Receiver<Arc<ConnectionView>>,
    poll_task: JoinHandle<()>,
}

impl<C: LocalClient> TailscaleManager<C> {
    pub fn spawn(
        handle: &Handle,
        client: Arc<C>,
        settings: ClientSettings,
        message_tx: mpsc::Sender<ManagerMessage>,
    ) -> Self {
        let refresh = Arc::new(Notify::new());
        let (view_tx, view_rx) = watch::channel(Arc::new(ConnectionView::default()));
        let (command_tx, command_rx) = async_mpsc::channel(COMMAND_QUEUE_DEPTH);

        let poll_task = handle.spawn(run_poll_loop(
            StatusPoller::new(Arc::clone(&client)),
            settings.clone(),
            Arc::clone(&refresh),
            view_tx,
            message_tx.clone(),
        ));

        let worker = Worker {
            mutator: PreferenceMutator::new(Arc::clone(&client), Arc::clone(&refresh)),
            client: Arc::clone(&client),
            refresh,
            message_tx: message_tx.clone(),
        };
        handle.spawn(worker.run(command_rx));

        log_manager_message(
            &message_tx,
            format!(
                "Manager started, polling every {}s.",
                settings.poll_interval.as_secs()
            ),
        );

        Self {
            client,
            settings,
            handle: handle.clone(),
            command_tx,
            message_tx,
            view_rx,
            poll_task,
        }
    }

    fn send(&self, command: ManagerCommand) -> Result<()> {
        self.command_tx.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => anyhow!("Too many pending operations, try again shortly"),
            TrySendError::Closed(_) => anyhow!("Manager has shut down"),
        })
    }

    pub fn apply(&self, edit: PreferenceEdit) -> Result<()> {
        self.send(ManagerCommand::Apply(edit))
    }

    pub fn login(&self) -> Result<()> {
        self.send(ManagerCommand::Login)
    }

    pub fn logout(&self) -> Result<()> {
        self.send(ManagerCommand::Logout)
    }

    pub fn refresh(&self) -> Result<()> {
        self.send(ManagerCommand::Refresh)
    }

    /// Pings `addr` on its own task, bounded by the configured timeout.
    pub fn ping(&self, addr: IpAddr, kind: PingKind) {
        let client = Arc::clone(&self.client);
        let message_tx = self.message_tx.clone();
        let limit = self.settings.ping_timeout;
        self.handle.spawn(async move {
            match timeout(limit, client.ping(addr, kind)).await {
                Ok(Ok(result)) => send_message(&message_tx, ManagerMessage::PingResult(result)),
                Ok(Err(e)) => {
                    send_message(&message_tx, ManagerMessage::Error(format!("Ping {}: {}", addr, e)))
                }
                Err(_) => send_message(
                    &message_tx,
                    ManagerMessage::Error(format!("Ping {}: timed out after {:?}", addr, limit)),
                ),
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ConnectionView>> {
        self.view_rx.clone()
    }

    pub fn current_view(&self) -> Arc<ConnectionView> {
        self.view_rx.borrow().clone()
    }

    pub fn shutdown(&self) -> Result<()> {
        self.poll_task.abort();
        self.send(ManagerCommand::Shutdown)
    }
}

async fn run_poll_loop<C: LocalClient>(
    poller: StatusPoller<C>,
    settings: ClientSettings,
    refresh: Arc<Notify>,
    view_tx: watch::Sender<Arc<ConnectionView>>,
    message_tx: mpsc::Sender<ManagerMessage>,
) {
    let mut ticker = interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_diagnostics: Vec<String> = Vec::new();
    let mut last_error: Option<String> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = refresh.notified() => debug!("refresh requested"),
        }

        let view = poller.refresh().await;

        for diagnostic in &view.diagnostics {
            if !last_diagnostics.contains(diagnostic) {
                send_message(&message_tx, ManagerMessage::Diagnostic(diagnostic.clone()));
            }
        }
        last_diagnostics = view.diagnostics.clone();

        if view.last_error != last_error {
            match &view.last_error {
                Some(e) => log_manager_message(&message_tx, format!("Status update error: {}", e)),
                None => log_manager_message(&message_tx, "Reconnected to tailscaled.".to_string()),
            }
            last_error = view.last_error.clone();
        }

        if view_tx.send(Arc::new(view)).is_err() {
            break;
        }
    }
    debug!("poll loop terminated");
}

struct Worker<C> {
    mutator: PreferenceMutator<C>,
    client: Arc<C>,
    refresh: Arc<Notify>,
    message_tx: mpsc::Sender<ManagerMessage>,
}

impl<C: LocalClient> Worker<C> {
    async fn run(self, mut command_rx: async_mpsc::Receiver<ManagerCommand>) {
        while let Some(command) = command_rx.recv().await {
            match command {
                ManagerCommand::Apply(edit) => {
                    let label = edit.to_string();
                    log_manager_message(&self.message_tx, format!("Requested: {}", label));
                    match self.mutator.apply(edit).await {
                        Ok(()) => log_manager_message(&self.message_tx, format!("Done: {}", label)),
                        Err(e) if e.is_informational() => {
                            send_message(&self.message_tx, ManagerMessage::Info(e.to_string()))
                        }
                        Err(e) => send_message(
                            &self.message_tx,
                            ManagerMessage::Error(format!("Failed to {}: {}", label, e)),
                        ),
                    }
                }
                ManagerCommand::Login => match self.client.start_interactive_login().await {
                    Ok(url) => {
                        if let Some(url) = url {
                            send_message(&self.message_tx, ManagerMessage::LoginUrl(url));
                        }
                        self.refresh.notify_one();
                    }
                    Err(e) => send_message(
                        &self.message_tx,
                        ManagerMessage::Error(format!("Login failed: {}", e)),
                    ),
                },
                ManagerCommand::Logout => match self.client.logout().await {
                    Ok(()) => {
                        log_manager_message(&self.message_tx, "Logged out.".to_string());
                        self.refresh.notify_one();
                    }
                    Err(e) => send_message(
                        &self.message_tx,
                        ManagerMessage::Error(format!("Logout failed: {}", e)),
                    ),
                },
                ManagerCommand::Refresh => self.refresh.notify_one(),
                ManagerCommand::Shutdown => {
                    log_manager_message(&self.message_tx, "Shutdown command received.".to_string());
                    break;
                }
            }
        }
        debug!("command worker terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tailscale::fake::FakeClient;
    use crate::tailscale::{PeerStatus, Prefs, Status};
    use crate::view::BackendState;
    use std::time::Duration;

    fn settings() -> ClientSettings {
        ClientSettings {
            poll_interval: Duration::from_secs(3600),
            ping_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn start(client: Arc<FakeClient>) -> (TailscaleManager<FakeClient>, mpsc::Receiver<ManagerMessage>) {
        let (tx, rx) = mpsc::channel();
        let manager = TailscaleManager::spawn(&Handle::current(), client, settings(), tx);
        (manager, rx)
    }

    fn running_client() -> Arc<FakeClient> {
        let client = Arc::new(FakeClient::with_prefs(Prefs::default()));
        *client.status.lock().unwrap() = Status {
            backend_state: "Running".to_string(),
            self_node: Some(PeerStatus {
                tailscale_ips: vec!["100.100.1.1".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        };
        client
    }

    async fn wait_for_view(
        rx: &mut watch::Receiver<Arc<ConnectionView>>,
        pred: impl Fn(&ConnectionView) -> bool,
    ) {
        timeout(Duration::from_secs(2), async {
            while !pred(&rx.borrow_and_update()) {
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("view never reached the expected state");
    }

    async fn next_message(
        rx: &mpsc::Receiver<ManagerMessage>,
        pred: impl Fn(&ManagerMessage) -> bool,
    ) -> ManagerMessage {
        for _ in 0..200 {
            while let Ok(message) = rx.try_recv() {
                if pred(&message) {
                    return message;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected message never arrived");
    }

    #[tokio::test]
    async fn applied_edit_shows_up_in_the_next_view() {
        let (manager, _rx) = start(running_client());
        let mut views = manager.subscribe();
        wait_for_view(&mut views, |v| v.is_running()).await;

        manager.apply(PreferenceEdit::SetSshEnabled(true)).unwrap();
        wait_for_view(&mut views, |v| v.flags.run_ssh).await;
        assert!(manager.current_view().flags.run_ssh);
        manager.shutdown().unwrap();
    }

    #[tokio::test]
    async fn duplicate_route_is_reported_as_info() {
        let (manager, rx) = start(running_client());
        manager
            .apply(PreferenceEdit::AddRoute("10.0.0.0/8".to_string()))
            .unwrap();
        manager
            .apply(PreferenceEdit::AddRoute("10.0.0.0/8".to_string()))
            .unwrap();
        let message = next_message(&rx, |m| matches!(m, ManagerMessage::Info(_))).await;
        assert!(matches!(message, ManagerMessage::Info(text) if text.contains("10.0.0.0/8")));
    }

    #[tokio::test]
    async fn failed_edit_is_reported_as_error() {
        let client = running_client();
        client.set_failing(false, false, true);
        let (manager, rx) = start(client);
        manager.apply(PreferenceEdit::SetDnsManaged(false)).unwrap();
        let message = next_message(&rx, |m| matches!(m, ManagerMessage::Error(_))).await;
        assert!(matches!(message, ManagerMessage::Error(text) if text.starts_with("Failed to set Corp DNS")));
    }

    #[tokio::test]
    async fn unreachable_daemon_publishes_error_view() {
        let client = running_client();
        client.set_failing(true, false, false);
        let (manager, _rx) = start(client);
        let mut views = manager.subscribe();
        wait_for_view(&mut views, |v| v.state == BackendState::Error).await;
        let view = manager.current_view();
        assert!(view.tunnel_address.is_none());
        assert!(view.peers.is_empty());
    }

    #[tokio::test]
    async fn login_forwards_the_auth_url() {
        let client = running_client();
        let (manager, rx) = start(client.clone());
        manager.login().unwrap();
        let message = next_message(&rx, |m| matches!(m, ManagerMessage::LoginUrl(_))).await;
        assert!(matches!(message, ManagerMessage::LoginUrl(url) if url.starts_with("https://")));
        manager.logout().unwrap();
        next_message(&rx, |m| matches!(m, ManagerMessage::LogMessage(t) if t.contains("Logged out"))).await;
        assert_eq!(client.logouts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ping_reports_result() {
        let (manager, rx) = start(running_client());
        let addr: IpAddr = "100.64.0.2".parse().unwrap();
        manager.ping(addr, PingKind::Disco);
        let message = next_message(&rx, |m| matches!(m, ManagerMessage::PingResult(_))).await;
        assert!(matches!(message, ManagerMessage::PingResult(r) if r.peer == addr));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn connect_waiting_for_auth_does_not_block_the_queue() {
        use crate::tailscale::fake::stub_cli;

        let (cli, dir) = stub_cli("queue", Duration::from_millis(300));
        let (tx, rx) = mpsc::channel();
        let manager = TailscaleManager::spawn(&Handle::current(), Arc::new(cli), settings(), tx);

        manager.apply(PreferenceEdit::SetRunning(true)).unwrap();
        manager.apply(PreferenceEdit::SetSshEnabled(true)).unwrap();

        let message = next_message(&rx, |m| matches!(m, ManagerMessage::Error(_))).await;
        assert!(
            matches!(&message, ManagerMessage::Error(text) if text.starts_with("Failed to connect") && text.contains("timed out")),
            "unexpected message: {message:?}"
        );
        next_message(&rx, |m| {
            matches!(m, ManagerMessage::LogMessage(t) if t.contains("Done: set SSH to true"))
        })
        .await;
        let set_log = std::fs::read_to_string(dir.join("set.log")).unwrap();
        assert!(set_log.contains("--ssh=true"));
        manager.shutdown().unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn new_diagnostics_are_forwarded_once() {
        let client = running_client();
        client.status.lock().unwrap().peers.insert(
            "k".to_string(),
            PeerStatus {
                id: "n7".to_string(),
                host_name: "ghost".to_string(),
                ..Default::default()
            },
        );
        let (manager, rx) = start(client.clone());
        let message = next_message(&rx, |m| matches!(m, ManagerMessage::Diagnostic(_))).await;
        assert!(matches!(message, ManagerMessage::Diagnostic(text) if text.contains("ghost")));

        manager.refresh().unwrap();
        timeout(Duration::from_secs(2), async {
            while client.prefs_reads.load(std::sync::atomic::Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("second poll never ran");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_iter().all(|m| !matches!(m, ManagerMessage::Diagnostic(_))));
        manager.shutdown().unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_the_queue() {
        let (manager, _rx) = start(running_client());
        manager.shutdown().unwrap();
        timeout(Duration::from_secs(2), async {
            while manager.refresh().is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queue stayed open after shutdown");
    }
}
