//! NetWarden - device health monitoring service.

use netwarden::config::ServerConfig;
use netwarden::db::{self, Store};
use netwarden::monitor::{LogNotifier, Monitor, MonitorConfig, NotificationGate, Notifier, WebhookNotifier};
use netwarden::probe::SystemProber;
use netwarden::scheduler::Scheduler;
use netwarden::web::Server;

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("netwarden=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting NetWarden on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Add sample device if none exist
    if store.get_devices()?.is_empty() {
        tracing::info!("Adding sample device: Loopback");
        let mut device = db::Device {
            name: "Loopback".to_string(),
            address: "127.0.0.1".to_string(),
            ..Default::default()
        };
        store.add_device(&mut device)?;
    }

    // Notification delivery
    let notifier: Arc<dyn Notifier> = match &cfg.webhook_url {
        Some(url) => {
            tracing::info!("Delivering notifications to webhook {}", url);
            Arc::new(WebhookNotifier::new(url.clone(), Duration::from_secs(10))?)
        }
        None => Arc::new(LogNotifier),
    };
    let gate = NotificationGate::start(notifier, cfg.notify_queue);

    let prober = Arc::new(SystemProber::new(cfg.probe_timeout, cfg.probe_timeout));
    let monitor = Monitor::new(store.clone(), prober, gate, MonitorConfig::from(&cfg));

    // Start scheduler
    let scheduler = Scheduler::new(monitor.clone(), store, cfg.check_interval, cfg.retention_days);
    scheduler.start().await;

    // Start web server
    let server = Server::new(cfg, monitor);
    server.start().await?;

    scheduler.stop().await;
    Ok(())
}
