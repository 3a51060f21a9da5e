// src/app.rs
use crate::config::AppConfig;
use crate::manager::{ManagerMessage, TailscaleManager};
use crate::mutator::{PreferenceEdit, parse_route};
use crate::tailscale::{PingKind, TailscaleCli};
use crate::view::{BackendState, ConnectionView};
use chrono::{DateTime, Local, Utc};
use eframe::egui;
use egui_extras::{Column, TableBuilder};
use log::{error, info};
use std::net::IpAddr;
use std::sync::{Arc, mpsc};
use tokio::runtime::Runtime;
use tokio::sync::watch;

#[derive(PartialEq)]
enum ActiveTab {
    Connection,
    Routes,
    Peers,
    Settings,
    Logs,
}

pub struct TailscaleApp {
    config: AppConfig,
    manager: Option<TailscaleManager<TailscaleCli>>,
    runtime: Runtime,
    message_rx: mpsc::Receiver<ManagerMessage>,
    message_tx: mpsc::Sender<ManagerMessage>,
    view_rx: Option<watch::Receiver<Arc<ConnectionView>>>,
    view: Arc<ConnectionView>,

    // UI State
    active_tab: ActiveTab,
    route_input: String,
    tags_input: String,
    tags_dirty: bool,
    login_url: Option<String>,
    last_ping: Option<String>,
    ping_kind: PingKind,

    // Dialogs
    show_error_dialog: bool,
    current_error_message: String,
    show_info_dialog: bool,
    current_info_message: String,

    log_messages: Vec<String>,
    recent_errors: Vec<String>,
}

impl TailscaleApp {
    pub fn new(_cc: &eframe::CreationContext<'_>, config: AppConfig) -> Self {
        let (message_tx, message_rx) = mpsc::channel();
        let runtime = Runtime::new().expect("Failed to create Tokio runtime");

        Self {
            config,
            manager: None,
            runtime,
            message_rx,
            message_tx,
            view_rx: None,
            view: Arc::new(ConnectionView::default()),

            active_tab: ActiveTab::Connection,
            route_input: String::new(),
            tags_input: String::new(),
            tags_dirty: false,
            login_url: None,
            last_ping: None,
            ping_kind: PingKind::default(),

            show_error_dialog: false,
            current_error_message: String::new(),
            show_info_dialog: false,
            current_info_message: String::new(),

            log_messages: Vec::new(),
            recent_errors: Vec::new(),
        }
    }

    fn ensure_manager_started(&mut self) {
        if self.manager.is_none() {
            let settings = self.config.client_settings();
            let client = Arc::new(TailscaleCli::new(&settings));
            let manager = TailscaleManager::spawn(
                self.runtime.handle(),
                client,
                settings,
                self.message_tx.clone(),
            );
            self.view_rx = Some(manager.subscribe());
            self.manager = Some(manager);
        }
    }

    fn add_log_entry(&mut self, message: String) {
        let timestamp = Local::now().format("%H:%M:%S").to_string();
        self.log_messages
            .push(format!("[{}] {}", timestamp, message));
        if self.log_messages.len() > 1000 {
            self.log_messages.remove(0);
        }
    }

    fn add_error_entry(&mut self, error_message: String) {
        let timestamp = Local::now().format("%H:%M:%S").to_string();
        let formatted_error = format!("[{}] 🔴 ERROR: {}", timestamp, error_message);

        self.log_messages.push(formatted_error.clone());
        if self.log_messages.len() > 1000 {
            self.log_messages.remove(0);
        }

        self.recent_errors.push(formatted_error);
        if self.recent_errors.len() > 10 {
            self.recent_errors.remove(0);
        }

        self.current_error_message = error_message;
        self.show_error_dialog = true;
    }

    fn show_info(&mut self, message: String) {
        self.add_log_entry(message.clone());
        self.current_info_message = message;
        self.show_info_dialog = true;
    }

    fn process_messages(&mut self) {
        while let Ok(message) = self.message_rx.try_recv() {
            match message {
                ManagerMessage::LogMessage(msg) => self.add_log_entry(msg),
                ManagerMessage::Info(msg) => self.show_info(msg),
                ManagerMessage::Error(err_msg) => self.add_error_entry(err_msg),
                ManagerMessage::Diagnostic(msg) => self.add_log_entry(format!("⚠️ {}", msg)),
                ManagerMessage::LoginUrl(url) => {
                    self.add_log_entry(format!("To authenticate, visit: {}", url));
                    self.login_url = Some(url);
                }
                ManagerMessage::PingResult(result) => {
                    let text = match result.latency {
                        Some(latency) => format!(
                            "Ping {}: {} ({} ms)",
                            result.peer,
                            result.summary,
                            latency.as_millis()
                        ),
                        None => format!("Ping {}: {}", result.peer, result.summary),
                    };
                    self.add_log_entry(text.clone());
                    self.last_ping = Some(text);
                }
            }
        }
    }

    fn sync_view(&mut self) {
        let Some(view_rx) = self.view_rx.as_mut() else {
            return;
        };
        if !view_rx.has_changed().unwrap_or(false) {
            return;
        }
        self.view = view_rx.borrow_and_update().clone();
        if !self.tags_dirty {
            self.tags_input = self.view.tags.join(",");
        }
        if self.view.logged_in() {
            self.login_url = None;
        }
    }

    fn apply(&mut self, edit: PreferenceEdit) {
        self.ensure_manager_started();
        let result = match &self.manager {
            Some(manager) => manager.apply(edit.clone()),
            None => return,
        };
        match result {
            Ok(()) => self.add_log_entry(format!("Sending: {}", edit)),
            Err(e) => self.add_error_entry(format!("Failed to {}: {}", edit, e)),
        }
    }

    fn ping(&mut self, addr: IpAddr) {
        if let Some(ref manager) = self.manager {
            manager.ping(addr, self.ping_kind);
            self.add_log_entry(format!("Pinging {} ({})...", addr, self.ping_kind.label()));
        }
    }

    fn draw_tab_bar(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            ui.selectable_value(&mut self.active_tab, ActiveTab::Connection, "Connection");
            ui.selectable_value(&mut self.active_tab, ActiveTab::Routes, "Shared Routes");
            ui.selectable_value(&mut self.active_tab, ActiveTab::Peers, "Peers");
            ui.selectable_value(&mut self.active_tab, ActiveTab::Settings, "Settings");
            ui.selectable_value(&mut self.active_tab, ActiveTab::Logs, "Logs");
        });
        ui.separator();
    }

    fn draw_connection_tab(&mut self, ui: &mut egui::Ui) {
        let view = Arc::clone(&self.view);
        ui.heading("Connection Status");

        let mut clear_errors = false;
        let mut switch_to_logs = false;

        if !self.recent_errors.is_empty() {
            ui.group(|ui| {
                ui.colored_label(egui::Color32::RED, "⚠️ Recent Errors:");
                for error in self.recent_errors.iter().rev().take(3) {
                    ui.colored_label(egui::Color32::LIGHT_RED, error);
                }
                ui.horizontal(|ui| {
                    if ui.button("Clear Errors").clicked() {
                        clear_errors = true;
                    }
                    if ui.button("View All in Logs").clicked() {
                        switch_to_logs = true;
                    }
                });
            });
            ui.separator();
        }
        if clear_errors {
            self.recent_errors.clear();
        }
        if switch_to_logs {
            self.active_tab = ActiveTab::Logs;
        }

        ui.horizontal(|ui| {
            ui.label("Status:");
            let color = match view.state {
                BackendState::Running => egui::Color32::GREEN,
                BackendState::Starting | BackendState::NeedsLogin | BackendState::NeedsMachineAuth => {
                    egui::Color32::KHAKI
                }
                BackendState::Error => egui::Color32::RED,
                _ => egui::Color32::GRAY,
            };
            ui.colored_label(color, view.state.as_str());
        });
        if let Some(err) = &view.last_error {
            ui.colored_label(egui::Color32::LIGHT_RED, err);
        }

        let not_connected = if view.state == BackendState::Error {
            "Error"
        } else {
            "Not connected"
        };
        ui.label(format!(
            "IP: {}",
            view.tunnel_address
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| not_connected.to_string())
        ));
        ui.label(format!(
            "Network: {}",
            view.dns_name.as_deref().unwrap_or(not_connected)
        ));
        ui.label(format!("Received: {}", Self::format_bytes(view.rx_bytes)));
        ui.label(format!("Sent: {}", Self::format_bytes(view.tx_bytes)));

        let mut edit = None;
        let mut login = false;
        let mut logout = false;
        let mut refresh = false;
        ui.horizontal(|ui| {
            if ui
                .add_enabled(
                    !view.is_running() && view.state != BackendState::NeedsLogin,
                    egui::Button::new("Connect"),
                )
                .clicked()
            {
                edit = Some(PreferenceEdit::SetRunning(true));
            }
            if ui
                .add_enabled(view.is_running(), egui::Button::new("Disconnect"))
                .clicked()
            {
                edit = Some(PreferenceEdit::SetRunning(false));
            }
            if view.logged_in() {
                if ui.button("Logout").clicked() {
                    logout = true;
                }
            } else if view.state != BackendState::Error && ui.button("Login").clicked() {
                login = true;
            }
            if ui.button("Refresh Status").clicked() {
                refresh = true;
            }
        });

        if let Some(url) = &self.login_url {
            ui.horizontal(|ui| {
                ui.label("To authenticate, visit:");
                ui.hyperlink(url);
            });
        }

        ui.separator();
        ui.horizontal(|ui| {
            ui.label("Exit node:");
            let mut selected = view.exit_node_id.clone();
            egui::ComboBox::from_id_salt("exit_node_combobox")
                .selected_text(view.exit_node_label())
                .show_ui(ui, |ui| {
                    ui.selectable_value(&mut selected, None, "None");
                    for option in &view.exit_node_options {
                        ui.selectable_value(&mut selected, Some(option.id.clone()), &option.name);
                    }
                });
            if selected != view.exit_node_id {
                edit = Some(PreferenceEdit::SetExitNode(selected));
            }
            if view.exit_node_id.is_some() && ui.button("Clear Exit Node").clicked() {
                edit = Some(PreferenceEdit::SetExitNode(None));
            }
        });

        let details_label = if self.config.show_details {
            "Hide Details"
        } else {
            "Show Details"
        };
        if ui.button(details_label).clicked() {
            self.config.show_details = !self.config.show_details;
        }
        if self.config.show_details {
            ui.group(|ui| {
                if let Some(details) = &view.details {
                    ui.label(format!("Hostname: {}", details.host_name));
                    ui.label(format!("OS: {}", details.os));
                    ui.label(format!(
                        "Last seen: {}",
                        details
                            .last_seen
                            .map(Self::format_time)
                            .unwrap_or_else(|| "N/A".to_string())
                    ));
                    if details.is_exit_node {
                        ui.label("This device is an Exit Node");
                    }
                    if !details.relay.is_empty() {
                        ui.label(format!("Relay: {}", details.relay));
                    }
                }
                if let Some(user) = &view.user_login {
                    ui.label(format!("User: {}", user));
                }
                if let Some(name) = view.selected_exit_node_name() {
                    ui.label(format!("Current Exit Node: {}", name));
                }
                ui.label(format!(
                    "Last updated: {}",
                    view.polled_at.format("%H:%M:%S")
                ));
            });
        }

        if let Some(edit) = edit {
            self.apply(edit);
        }
        if let Some(ref manager) = self.manager {
            let result = if login {
                Some(manager.login())
            } else if logout {
                Some(manager.logout())
            } else if refresh {
                Some(manager.refresh())
            } else {
                None
            };
            if let Some(Err(e)) = result {
                self.add_error_entry(e.to_string());
            }
        }
    }

    fn draw_routes_tab(&mut self, ui: &mut egui::Ui) {
        let view = Arc::clone(&self.view);
        ui.heading("Shared Routes (Advertised)");

        let mut remove = None;
        if view.routes.is_empty() {
            ui.label("No routes advertised.");
        } else {
            for (i, route) in view.routes.iter().enumerate() {
                ui.horizontal(|ui| {
                    ui.label(route);
                    if ui.button("🗑 Remove").clicked() {
                        remove = Some(i);
                    }
                });
            }
        }

        ui.separator();
        let mut add = false;
        ui.horizontal(|ui| {
            let response = ui.add(
                egui::TextEdit::singleline(&mut self.route_input).hint_text("e.g. 192.168.1.0/24"),
            );
            if response.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter)) {
                add = true;
            }
            if ui.button("➕ Add Route").clicked() {
                add = true;
            }
        });

        if let Some(index) = remove {
            self.apply(PreferenceEdit::RemoveRoute(index));
        }
        if add {
            match parse_route(&self.route_input) {
                Ok(_) => {
                    let raw = std::mem::take(&mut self.route_input);
                    self.apply(PreferenceEdit::AddRoute(raw));
                }
                Err(e) => self.add_error_entry(e.to_string()),
            }
        }
    }

    fn draw_peers_tab(&mut self, ui: &mut egui::Ui) {
        let view = Arc::clone(&self.view);
        ui.heading("Connected Peers");

        ui.horizontal(|ui| {
            ui.label("Ping type:");
            egui::ComboBox::from_id_salt("ping_kind_combobox")
                .selected_text(self.ping_kind.label())
                .show_ui(ui, |ui| {
                    for kind in PingKind::ALL {
                        ui.selectable_value(&mut self.ping_kind, kind, kind.label());
                    }
                });
        });
        if let Some(result) = &self.last_ping {
            ui.label(result);
        }
        ui.separator();

        if view.peers.is_empty() {
            ui.label("No peers.");
            return;
        }

        let mut ping = None;
        TableBuilder::new(ui)
            .striped(true)
            .column(Column::auto())
            .column(Column::auto())
            .column(Column::auto())
            .column(Column::auto())
            .column(Column::remainder())
            .column(Column::auto())
            .header(20.0, |mut header| {
                for title in ["Peer", "Address", "Rx", "Tx", "Last handshake", ""] {
                    header.col(|ui| {
                        ui.strong(title);
                    });
                }
            })
            .body(|mut body| {
                for peer in &view.peers {
                    body.row(20.0, |mut row| {
                        row.col(|ui| {
                            let name = if peer.dns_name.is_empty() {
                                &peer.host_name
                            } else {
                                &peer.dns_name
                            };
                            let marker = if peer.active_exit_node {
                                " (exit node)"
                            } else if peer.exit_node_option {
                                " (exit node option)"
                            } else {
                                ""
                            };
                            let color = if peer.online {
                                egui::Color32::GREEN
                            } else {
                                egui::Color32::GRAY
                            };
                            ui.colored_label(color, format!("{}{}", name, marker));
                        });
                        row.col(|ui| {
                            ui.label(peer.address.to_string());
                        });
                        row.col(|ui| {
                            ui.label(Self::format_bytes(peer.rx_bytes));
                        });
                        row.col(|ui| {
                            ui.label(Self::format_bytes(peer.tx_bytes));
                        });
                        row.col(|ui| {
                            ui.label(
                                peer.last_handshake
                                    .map(|t| t.to_rfc3339())
                                    .unwrap_or_else(|| "-".to_string()),
                            );
                        });
                        row.col(|ui| {
                            if ui.button("Ping").clicked() {
                                ping = Some(peer.address);
                            }
                        });
                    });
                }
            });

        if let Some(addr) = ping {
            self.ping(addr);
        }
    }

    fn draw_settings_tab(&mut self, ui: &mut egui::Ui) {
        let view = Arc::clone(&self.view);
        ui.heading("Preferences");

        let mut edit = None;
        ui.group(|ui| {
            let mut corp_dns = view.flags.corp_dns;
            if ui.checkbox(&mut corp_dns, "Use Tailscale DNS Settings").changed() {
                edit = Some(PreferenceEdit::SetDnsManaged(corp_dns));
            }
            let mut route_all = view.flags.route_all;
            if ui.checkbox(&mut route_all, "Use Tailscale Subnets").changed() {
                edit = Some(PreferenceEdit::SetAcceptRoutes(route_all));
            }
            let mut allow_lan = view.flags.exit_node_allow_lan_access;
            if ui.checkbox(&mut allow_lan, "Allow Local Networks").changed() {
                edit = Some(PreferenceEdit::SetAllowLanWithExitNode(allow_lan));
            }
            let mut run_exit_node = view.exit_node_capable;
            if ui.checkbox(&mut run_exit_node, "Run Exit Node").changed() {
                edit = Some(PreferenceEdit::RunAsExitNode(run_exit_node));
            }
            let mut run_ssh = view.flags.run_ssh;
            if ui.checkbox(&mut run_ssh, "Enable SSH").changed() {
                edit = Some(PreferenceEdit::SetSshEnabled(run_ssh));
            }

            ui.horizontal(|ui| {
                ui.label("Node Tags");
                let response = ui.add(
                    egui::TextEdit::singleline(&mut self.tags_input)
                        .hint_text("tag:example,tag:server"),
                );
                if response.changed() {
                    self.tags_dirty = true;
                }
                if ui.button("Save Tags").clicked() {
                    edit = Some(PreferenceEdit::SetTags(self.tags_input.clone()));
                    self.tags_dirty = false;
                }
            });

            ui.label(format!(
                "Key Expiry: {}",
                view.key_expiry
                    .map(Self::format_time)
                    .unwrap_or_else(|| "N/A".to_string())
            ));
        });

        if let Some(edit) = edit {
            self.apply(edit);
        }

        ui.separator();
        ui.group(|ui| {
            ui.label("Application Settings (applied on next start):");
            ui.horizontal(|ui| {
                ui.label("Poll interval (s):");
                ui.add(egui::DragValue::new(&mut self.config.poll_interval_secs).range(1..=300));
            });
            ui.horizontal(|ui| {
                ui.label("Ping timeout (s):");
                ui.add(egui::DragValue::new(&mut self.config.ping_timeout_secs).range(1..=60));
            });
            ui.horizontal(|ui| {
                ui.label("Command timeout (s):");
                ui.add(egui::DragValue::new(&mut self.config.command_timeout_secs).range(1..=300));
            });
            ui.checkbox(&mut self.config.log_to_file, "Write log file");
            if ui.button("Save App Settings").clicked() {
                if let Err(e) = self.config.save() {
                    self.add_log_entry(format!("Failed to save settings: {}", e));
                } else {
                    self.add_log_entry("Settings saved successfully.".to_string());
                }
            }
        });
    }

    fn draw_logs_tab(&mut self, ui: &mut egui::Ui) {
        ui.heading("Application Logs");

        ui.horizontal(|ui| {
            if ui.button("Clear Displayed Logs").clicked() {
                self.log_messages.clear();
            }
            if ui.button("Clear Error History").clicked() {
                self.recent_errors.clear();
            }
        });
        ui.separator();

        egui::ScrollArea::vertical()
            .auto_shrink([false; 2])
            .stick_to_bottom(true)
            .show(ui, |ui| {
                for message in &self.log_messages {
                    if message.contains("🔴 ERROR") {
                        ui.colored_label(egui::Color32::RED, message);
                    } else if message.contains("[MANAGER]") {
                        ui.colored_label(egui::Color32::LIGHT_BLUE, message);
                    } else {
                        ui.label(message);
                    }
                }
            });
    }

    fn draw_error_dialog(&mut self, ctx: &egui::Context) {
        if self.show_error_dialog {
            egui::Window::new("⚠️ Error")
                .collapsible(false)
                .resizable(true)
                .anchor(egui::Align2::CENTER_CENTER, egui::Vec2::ZERO)
                .default_size([500.0, 200.0])
                .show(ctx, |ui| {
                    egui::ScrollArea::vertical()
                        .max_height(150.0)
                        .show(ui, |ui| {
                            ui.label(egui::RichText::new(&self.current_error_message).strong());
                        });

                    ui.add_space(10.0);
                    ui.horizontal(|ui| {
                        if ui.button("OK").clicked() {
                            self.show_error_dialog = false;
                            self.current_error_message.clear();
                        }
                        if ui.button("View Logs").clicked() {
                            self.show_error_dialog = false;
                            self.current_error_message.clear();
                            self.active_tab = ActiveTab::Logs;
                        }
                    });
                });
        }
    }

    fn draw_info_dialog(&mut self, ctx: &egui::Context) {
        if self.show_info_dialog {
            egui::Window::new("ℹ Information")
                .collapsible(false)
                .resizable(false)
                .anchor(egui::Align2::CENTER_CENTER, egui::Vec2::ZERO)
                .show(ctx, |ui| {
                    ui.label(&self.current_info_message);
                    if ui.button("OK").clicked() {
                        self.show_info_dialog = false;
                        self.current_info_message.clear();
                    }
                });
        }
    }

    fn format_time(ts: DateTime<Utc>) -> String {
        ts.with_timezone(&Local).to_rfc2822()
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
        if bytes == 0 {
            return "0 B".to_string();
        }
        let i = (bytes as f64).log2() / 10.0;
        let i = i.floor() as usize;
        let i = if i >= UNITS.len() { UNITS.len() - 1 } else { i };
        if i == 0 {
            return format!("{} B", bytes);
        }
        let size = bytes as f64 / (1024.0_f64.powi(i as i32));
        format!("{:.2} {}", size, UNITS.get(i).unwrap_or(&"B"))
    }
}

impl eframe::App for TailscaleApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.ensure_manager_started();
        self.process_messages();
        self.sync_view();

        egui::CentralPanel::default().show(ctx, |ui| {
            self.draw_tab_bar(ui);

            match self.active_tab {
                ActiveTab::Connection => self.draw_connection_tab(ui),
                ActiveTab::Routes => self.draw_routes_tab(ui),
                ActiveTab::Peers => self.draw_peers_tab(ui),
                ActiveTab::Settings => self.draw_settings_tab(ui),
                ActiveTab::Logs => self.draw_logs_tab(ui),
            }
        });

        self.draw_error_dialog(ctx);
        self.draw_info_dialog(ctx);

        ctx.request_repaint_after(std::time::Duration::from_millis(200));
    }

    fn on_exit(&mut self, _gl: Option<&eframe::glow::Context>) {
        info!("Application exiting. Shutting down manager.");
        if let Some(ref manager) = self.manager
            && let Err(e) = manager.shutdown()
        {
            error!("Failed to send shutdown command to manager: {}", e);
        }
        if let Err(e) = self.config.save() {
            error!("Failed to save app config on exit: {}", e);
        }
    }
}
