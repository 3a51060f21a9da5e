// src/main.rs
use eframe::egui;
use env_logger::{Env, Target};
use log::{info, warn};

mod app;
mod config;
mod manager;
mod mutator;
mod tailscale;
mod view;

use app::TailscaleApp;
use config::AppConfig;

fn init_logging(config: &AppConfig) {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    let mut log_file_error = None;
    if config.log_to_file {
        match AppConfig::log_file().and_then(|path| Ok(std::fs::File::create(path)?)) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => log_file_error = Some(e),
        }
    }
    builder.init();
    if let Some(e) = log_file_error {
        warn!("Could not open log file, logging to stderr: {}", e);
    }
}

fn main() -> Result<(), eframe::Error> {
    let (config, config_error) = match AppConfig::load() {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };
    init_logging(&config);
    if let Some(e) = config_error {
        warn!("Failed to load config, using defaults: {}", e);
    }
    info!("Starting Tailscale GUI...");

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([520.0, 700.0])
            .with_min_inner_size([420.0, 400.0]),
        ..Default::default()
    };

    eframe::run_native(
        "Tailscale",
        options,
        Box::new(|cc| Ok(Box::new(TailscaleApp::new(cc, config)))),
    )
}
