use clap::Parser;
use flux_config::{ConfigLoader, GlobalConfig, LogConfig};
use flux_gb28181::{
    DeviceControl, DeviceDirectory, MediaGatewayRef, MemoryDirectory, NotificationStore, PlaybackService,
    PreviewOrchestrator, Reconciler, SignalingEngine, StoragePolicy, ZlmClient,
};
use flux_shutdown::{ResourceManager, ShutdownCoordinator, ShutdownSignal, SignalHandler};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

mod api;
use api::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "config")]
    config_dir: String,

    /// 覆盖 http.bind
    #[arg(long)]
    http_bind: Option<String>,

    /// 覆盖 sip.local_port
    #[arg(long)]
    sip_port: Option<u16>,

    /// 覆盖 sip.media_ip
    #[arg(long)]
    media_ip: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut GlobalConfig) {
        if let Some(bind) = &self.http_bind {
            config.http.bind = bind.clone();
        }
        if let Some(port) = self.sip_port {
            config.sip.local_port = port;
        }
        if let Some(ip) = &self.media_ip {
            config.sip.media_ip = ip.clone();
        }
    }
}

fn init_logging(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ConfigLoader::new(&args.config_dir).load_global()?;
    args.apply(&mut config);
    ConfigLoader::validate(&config)?;
    init_logging(&config.log);

    tracing::info!(
        target: "gb28181d",
        name = %config.system.name,
        version = %config.system.version,
        config_dir = %args.config_dir,
        "starting"
    );

    let directory = Arc::new(MemoryDirectory::from_seeds(
        &config.devices,
        config.sip.device_expires_secs,
    ));
    let notifications = Arc::new(NotificationStore::default());
    let media: MediaGatewayRef = Arc::new(ZlmClient::new(&config.media)?);

    let engine = Arc::new(SignalingEngine::new(
        config.sip.clone(),
        directory.clone(),
        notifications.clone(),
    ));
    // 绑定失败时引擎保持未就绪，HTTP 仍然提供服务
    if let Err(e) = engine.start().await {
        tracing::error!(target: "gb28181d", error = %e, "SIP engine not started");
    }

    let policy = Arc::new(StoragePolicy::new(config.recording.clone()));
    let preview = Arc::new(PreviewOrchestrator::new(
        directory.clone(),
        engine.clone(),
        media.clone(),
        policy.clone(),
        config.preview.clone(),
    ));
    let playback = Arc::new(PlaybackService::new(directory.clone(), engine.clone(), media.clone()));
    let control = Arc::new(DeviceControl::new(directory.clone(), engine.clone()));
    let reconciler = Arc::new(Reconciler::new(
        directory.clone(),
        preview.clone(),
        media.clone(),
        policy.clone(),
    ));

    let (signal_handler, _) = SignalHandler::new();

    tokio::spawn(reconcile_loop(
        reconciler.clone(),
        policy.clone(),
        signal_handler.subscribe(),
    ));
    tokio::spawn(housekeeping_loop(
        directory.clone(),
        control.clone(),
        playback.clone(),
        policy.clone(),
        signal_handler.subscribe(),
    ));

    let state = AppState {
        directory,
        engine: engine.clone(),
        preview: preview.clone(),
        playback: playback.clone(),
        control,
        reconciler,
        policy,
        notifications,
    };
    let app = api::router(state);

    let addr: SocketAddr = config
        .http
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid http.bind {}: {}", config.http.bind, e))?;
    tracing::info!(target: "gb28181d", "http listening on {}", addr);

    let mut http_shutdown = signal_handler.subscribe();
    let server = axum::Server::try_bind(&addr)?
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = http_shutdown.recv().await;
        });
    let http_signal = signal_handler.clone();
    let http = tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!(target: "gb28181d", error = %e, "http server stopped");
            http_signal.trigger_shutdown();
        }
    });

    let mut resources = ResourceManager::new();
    resources.register(preview);
    resources.register(playback);
    resources.register(engine);

    let report = ShutdownCoordinator::builder()
        .with_signal_handler(signal_handler)
        .with_resource_manager(resources)
        .with_cleanup_timeout(Duration::from_secs(15))
        .build()
        .run()
        .await;

    let _ = http.await;
    tracing::info!(
        target: "gb28181d",
        signal = ?report.signal,
        elapsed = ?report.elapsed,
        failed = ?report.failed_resources,
        timed_out = report.timed_out,
        "stopped"
    );
    Ok(())
}

/// 固定间隔：一轮结束后再等待，间隔每轮从策略重新读取
async fn reconcile_loop(
    reconciler: Arc<Reconciler>,
    policy: Arc<StoragePolicy>,
    mut shutdown: broadcast::Receiver<ShutdownSignal>,
) {
    loop {
        if let Err(e) = reconciler.tick().await {
            tracing::warn!(target: "gb28181::record", error = %e, "reconcile tick failed");
        }
        let delay = Duration::from_millis(policy.current().reconcile_interval_ms);
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    tracing::debug!(target: "gb28181::record", "reconcile loop stopped");
}

/// 过期设备置离线，过期订阅标记 EXPIRED，清除早已关闭的回放会话
async fn housekeeping_loop(
    directory: Arc<MemoryDirectory>,
    control: Arc<DeviceControl>,
    playback: Arc<PlaybackService>,
    policy: Arc<StoragePolicy>,
    mut shutdown: broadcast::Receiver<ShutdownSignal>,
) {
    loop {
        let delay = Duration::from_secs(policy.current().housekeeping_interval_secs);
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let now = chrono::Utc::now();
        match directory.expire_stale(now).await {
            Ok(expired) if !expired.is_empty() => {
                tracing::info!(target: "gb28181d", devices = ?expired, "devices expired");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(target: "gb28181d", error = %e, "device expiry failed"),
        }
        control.expire_subscriptions(now);
        let purged = playback.purge_closed(now);
        if purged > 0 {
            tracing::debug!(target: "gb28181d", purged, "closed playback sessions purged");
        }
    }
    tracing::debug!(target: "gb28181d", "housekeeping loop stopped");
}
