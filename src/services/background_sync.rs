use crate::config::AppConfig;
use crate::database;
use crate::error::AppError;
use crate::services::{auth_service::ConfigAuth, network_service};
use std::sync::Arc;
use std::time::Duration;
use upload_queue::{
    AlwaysPersistent, Connectivity, DrainReport, PipelineHandles, UploadPipeline, WebDavBackend,
};

fn build_pipeline(config: &AppConfig, connectivity: Connectivity) -> Result<UploadPipeline, AppError> {
    let settings = config.webdav()?.clone();
    let auth = Arc::new(ConfigAuth::from_settings(&settings));
    let backend = Arc::new(WebDavBackend::new(settings)?);

    Ok(UploadPipeline::init(PipelineHandles {
        store: database::open_store(config)?,
        config: config.queue.clone(),
        storage: backend.clone(),
        records: backend,
        auth,
        elevation: Arc::new(AlwaysPersistent),
        connectivity,
    })?)
}

/// Runs the pipeline until Ctrl-C: the background runner drains on its
/// timer, on reconnect and on request, delegating uploads to this process
/// acting as the foreground view.
pub async fn run(config: &AppConfig) -> Result<(), AppError> {
    let server_url = config.webdav()?.server_url.clone();
    let connectivity = Connectivity::new(false);
    let pipeline = build_pipeline(config, connectivity.clone())?;

    let probe = network_service::spawn_probe(
        &server_url,
        connectivity,
        Duration::from_secs(config.probe_interval_secs.max(1)),
    );
    let foreground = pipeline.connect_foreground();

    let mut status_rx = pipeline.subscribe_status();
    log::info!("Expense sync running, press Ctrl-C to stop");
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    log::error!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *status_rx.borrow_and_update();
                match status.summary() {
                    Some(summary) => log::info!("{}", summary),
                    None => log::info!("All uploads done"),
                }
            }
        }
    }

    if let Some(probe) = probe {
        probe.abort();
    }
    foreground.abort();
    if let Some(runner) = pipeline.runner() {
        for entry in runner.cycle_log().iter().rev().take(5) {
            log::debug!(
                "Cycle at {}: {} processed, {} failed",
                entry.ts_ms,
                entry.processed,
                entry.failed
            );
        }
    }
    pipeline.shutdown().await;
    Ok(())
}

/// One foreground drain cycle, then exit
pub async fn drain_once(config: &AppConfig) -> Result<DrainReport, AppError> {
    let url = network_service::probe_url(&config.webdav()?.server_url);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| AppError::Other(format!("Client build failed: {}", e)))?;
    let online = network_service::check_reachable(&client, &url).await;

    let pipeline = build_pipeline(config, Connectivity::new(online))?;
    let report = if online {
        pipeline.drain_now().await
    } else {
        log::warn!("Server not reachable, nothing uploaded");
        DrainReport::default()
    };
    pipeline.shutdown().await;
    Ok(report)
}
