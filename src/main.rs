use anyhow::Context;
use label_spooler::api::{self, ApiState};
use label_spooler::config::{AppConfig, PrinterBackend};
use label_spooler::hotplug;
use label_spooler::printer::{LpProvider, OutputTargetProvider};
use label_spooler::render::PdfRenderer;
use label_spooler::sentry_init;
use label_spooler::spooler::Spooler;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ============================================================================
// Logging
// ============================================================================

/// Console output always; a daily rolling file when `log_dir` is set.
///
/// The returned guard flushes the file writer and must outlive `main`.
fn init_logging(config: &AppConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "label-spooler.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(file_layer)
        .with(sentry_tracing::layer())
        .init();

    guard
}

// ============================================================================
// Background Tasks
// ============================================================================

/// Re-check printers whenever a USB device comes or goes.
fn start_hotplug_task(state: ApiState) {
    let mut events = match hotplug::spawn_watcher() {
        Ok(events) => events,
        Err(e) => {
            warn!("USB hot-plug watching unavailable: {}", e);
            return;
        }
    };

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!("{}", event);
            api::publish_printer_status(&state).await;
        }
    });
}

fn build_provider(backend: PrinterBackend) -> anyhow::Result<Arc<dyn OutputTargetProvider>> {
    match backend {
        PrinterBackend::Lp => Ok(Arc::new(LpProvider::new())),
        #[cfg(feature = "native-printers")]
        PrinterBackend::Native => Ok(Arc::new(label_spooler::printer::NativePrinterProvider)),
        #[cfg(not(feature = "native-printers"))]
        PrinterBackend::Native => anyhow::bail!(
            "printer_backend \"native\" requires building with --features native-printers"
        ),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, config_source) = AppConfig::load().context("Failed to load configuration")?;
    let _log_guard = init_logging(&config);

    info!("========================================");
    info!("Label Spooler Starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("========================================");

    // Must stay alive until exit
    let _sentry_guard = sentry_init::init();

    info!("{}", config_source);
    info!("Printer backend: {:?}", config.printer_backend);

    let provider = build_provider(config.printer_backend)?;
    let renderer = Arc::new(PdfRenderer::new(config.render_dpi));
    let spooler = Spooler::start(config.spooler.clone(), provider.clone(), renderer);

    let state = ApiState::new(
        spooler.clone(),
        provider,
        config.spooler.target_selection.clone(),
    );
    let _queue_publisher = api::spawn_queue_publisher(&spooler, state.events.clone());

    if config.usb_hotplug {
        start_hotplug_task(state.clone());
    } else {
        info!("USB hot-plug watching disabled");
    }

    let status = api::publish_printer_status(&state).await;
    if !status.connected {
        warn!("No printer reachable yet - jobs will wait until one appears");
    }

    info!("Background services initialized");

    api::start_api_server(
        &config.listen_addr,
        state,
        config.static_dir.as_deref(),
        shutdown_signal(),
    )
    .await
    .context("HTTP server failed")?;

    let dropped = spooler.shutdown();
    info!("Label Spooler shutting down ({} unprinted job(s) dropped)", dropped);
    Ok(())
}
