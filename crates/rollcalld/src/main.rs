use anyhow::{Context, Result};
use rollcall_core::{
    AlwaysCandidate, AttendanceStore, PipelineController, PresenceFilter,
    RecognitionCooldownCache, RemoteMatchThrottler, RemoteMatcher, SessionRegistry,
    StatisticalPresenceFilter,
};
use rollcall_hw::V4l2Opener;
use rollcall_store::SqliteStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod remote;

use config::Config;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use remote::HttpMatcher;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env()?;
    tracing::info!(
        camera = %config.camera_device,
        db = %config.db_path.display(),
        endpoint = %config.match_endpoint,
        collection = %config.collection_id,
        "configuration loaded"
    );

    let store: Arc<dyn AttendanceStore> = Arc::new(
        SqliteStore::open(&config.db_path).context("failed to open attendance database")?,
    );

    let matcher = Arc::new(HttpMatcher::new(
        &config.match_endpoint,
        &config.collection_id,
        config.match_api_key.clone(),
        Duration::from_millis(config.match_timeout_ms),
    )
    .context("failed to build HTTP client")?);
    // Recognition retries on its own, so an unreachable service is not fatal here.
    match matcher.check().await {
        Ok(()) => tracing::info!(collection = %config.collection_id, "face collection reachable"),
        Err(e) => tracing::warn!(error = %e, "face collection check failed"),
    }

    let filter: Box<dyn PresenceFilter> = if config.local_filter {
        Box::new(StatisticalPresenceFilter::default())
    } else {
        Box::new(AlwaysCandidate)
    };
    let throttler = RemoteMatchThrottler::new(
        Arc::clone(&matcher) as Arc<dyn RemoteMatcher>,
        filter,
        config.throttle(),
    );
    let cooldown = match config.cooldown_capacity {
        Some(capacity) => RecognitionCooldownCache::with_capacity(config.cooldown_window(), capacity),
        None => RecognitionCooldownCache::new(config.cooldown_window()),
    };
    tracing::info!(
        min_interval = ?throttler.config().min_interval,
        threshold = throttler.config().threshold,
        cooldown = ?cooldown.window(),
        local_filter = config.local_filter,
        "recognition policy"
    );
    let sessions = Arc::new(SessionRegistry::new(Arc::clone(&store))?);
    let opener = V4l2Opener::new(
        config.camera_devices(),
        config.camera_width,
        config.camera_height,
    );

    let controller = Arc::new(PipelineController::new(
        config.pipeline(),
        Arc::new(opener),
        throttler,
        cooldown,
        sessions,
        store,
    ));

    let connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(Arc::clone(&controller), matcher))?
        .build()
        .await
        .context("failed to register on the session bus")?;

    let iface = connection
        .object_server()
        .interface::<_, AttendanceService>(OBJECT_PATH)
        .await?;
    let mut events = controller.subscribe();
    let forwarder = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let json = dbus_interface::event_json(&event);
                    if let Err(e) = AttendanceService::attendance(iface.signal_emitter(), &json).await {
                        tracing::warn!(error = %e, "failed to emit attendance signal");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "attendance signal forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if config.autostart {
        if let Err(e) = controller.start().await {
            tracing::error!(error = %e, "autostart failed; waiting for Start");
        }
    }

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    controller.stop().await;
    forwarder.abort();

    Ok(())
}
