use clap::Parser;
use snap_pool::http::{SharedProvider, StatusServer};
use snap_pool::storage::SegmentDirEngine;
use snap_pool::{Config, ProviderKind, SourceId};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "snap-pool", version, about = "Shared point-in-time snapshot pool daemon")]
struct Args {
    /// 配置文件（默认 <config_dir>/snap-pool/config.toml）
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long, value_enum)]
    strategy: Option<ProviderKind>,
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut cfg = match args.config.clone().or_else(Config::default_path) {
        Some(p) => Config::load(&p)?,
        None => Config::default(),
    };
    // 命令行优先
    if let Some(d) = &args.data_dir {
        cfg.data_dir = d.clone();
    }
    if let Some(p) = args.port {
        cfg.http_port = p;
    }
    if let Some(s) = args.strategy {
        cfg.strategy = s;
    }
    Ok(cfg)
}

/// 周期性 acquire + release 全部 source，让共享池及时发布新代、回收旧代
fn spawn_refresher(provider: SharedProvider, sources: Vec<SourceId>, every: Duration) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.tick().await;
        loop {
            tick.tick().await;
            let p = provider.clone();
            let s = sources.clone();
            let res = tokio::task::spawn_blocking(move || -> Result<(), snap_pool::PoolError> {
                let view = p.acquire(&s)?;
                p.release(view)
            })
            .await;
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_retryable() => warn!("Refresh failed, will retry: {}", e),
                Ok(Err(e)) => {
                    info!("Refresh loop stopping: {}", e);
                    break;
                }
                Err(e) => warn!("Refresh task panicked: {}", e),
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    // 先用 RUST_LOG / 默认过滤器起日志，配置加载出错也能看到
    let cfg_probe = load_config(&args);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = cfg_probe
            .as_ref()
            .map(|c| c.log_filter.clone())
            .unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(level)
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cfg = cfg_probe?;

    info!(
        "Starting snap-pool: strategy={} data_dir={:?}",
        cfg.strategy.as_str(),
        cfg.data_dir
    );

    let engine = Arc::new(SegmentDirEngine::new(cfg.data_dir.clone()));
    let sources = if cfg.sources.is_empty() {
        engine.discover_sources()?
    } else {
        cfg.sources.clone()
    };
    info!("{} source(s): {:?}", sources.len(), sources);

    let provider: SharedProvider = Arc::from(cfg.strategy.build(engine.clone()));
    {
        let p = provider.clone();
        let s = sources.clone();
        tokio::task::spawn_blocking(move || p.bootstrap(&s)).await??;
    }

    if cfg.refresh_interval_secs > 0 && !sources.is_empty() {
        spawn_refresher(
            provider.clone(),
            sources.clone(),
            Duration::from_secs(cfg.refresh_interval_secs),
        );
    }

    let server = StatusServer::new(provider.clone());
    let port = cfg.http_port;
    tokio::spawn(async move {
        if let Err(e) = server.run(port).await {
            warn!("HTTP server exited: {}", e);
        }
    });

    info!(
        "snap-pool ready. Status via: http://localhost:{}/status",
        cfg.http_port
    );

    // 优雅退出
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    let report = {
        let p = provider.clone();
        tokio::task::spawn_blocking(move || p.shutdown()).await?
    };
    if report.is_clean() {
        info!("Shutdown clean: {} tracker token(s) released", report.trackers_released);
    } else {
        warn!(
            "Shutdown forced {} handle(s), {} token(s) were outstanding",
            report.forced_closed, report.outstanding_tokens
        );
    }
    info!("\n{}", provider.stats());
    info!("{} engine snapshot(s) still open", engine.open_snapshots());

    Ok(())
}
