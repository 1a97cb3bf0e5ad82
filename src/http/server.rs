use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::SourceId;
use crate::error::PoolError;
use crate::pool::{ViewLease, ViewProvider};
use crate::stats::PoolStats;
use crate::storage::SegmentDirEngine;

pub type SharedProvider = Arc<dyn ViewProvider<SegmentDirEngine>>;

#[derive(Deserialize)]
pub struct ViewParams {
    /// 逗号分隔，保序
    pub sources: String,
}

#[derive(Serialize)]
pub struct ViewPart {
    pub source: String,
    pub generation: u64,
    pub snapshot: u64,
    pub segments: usize,
    pub bytes: u64,
}

#[derive(Serialize)]
pub struct ViewResponse {
    pub parts: Vec<ViewPart>,
}

/// 诊断用 HTTP 接口：池统计 + 租借一个组合视图并描述它
pub struct StatusServer {
    pub provider: SharedProvider,
}

impl StatusServer {
    pub fn new(provider: SharedProvider) -> Self {
        Self { provider }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/status", get(status_handler))
            .route("/view", get(view_handler))
            .with_state(self.provider)
    }

    pub async fn run(self, port: u16) -> anyhow::Result<()> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
        tracing::info!("HTTP status server listening on port {}", port);
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn status_handler(State(provider): State<SharedProvider>) -> Json<PoolStats> {
    Json(provider.stats())
}

fn describe(
    provider: &dyn ViewProvider<SegmentDirEngine>,
    sources: &[SourceId],
) -> Result<ViewResponse, PoolError> {
    let lease = ViewLease::acquire(provider, sources)?;
    let parts = lease
        .constituents()
        .zip(lease.generations())
        .map(|(snap, generation)| ViewPart {
            source: snap.source().to_string(),
            generation,
            snapshot: snap.serial(),
            segments: snap.segments().len(),
            bytes: snap.total_bytes(),
        })
        .collect();
    lease.release()?;
    Ok(ViewResponse { parts })
}

async fn view_handler(
    Query(params): Query<ViewParams>,
    State(provider): State<SharedProvider>,
) -> Result<Json<ViewResponse>, (StatusCode, String)> {
    let sources = SourceId::parse_list(&params.sources);
    // acquire 可能做磁盘 I/O（reopen 扫目录 / 首次 open）
    let res = tokio::task::spawn_blocking(move || describe(provider.as_ref(), &sources))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    match res {
        Ok(v) => Ok(Json(v)),
        Err(e @ PoolError::EmptyRequest) => Err((StatusCode::BAD_REQUEST, e.to_string())),
        Err(e) if e.is_retryable() => Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
        Err(e) => Err((StatusCode::CONFLICT, e.to_string())),
    }
}
