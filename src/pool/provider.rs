use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use crate::core::{SnapshotEngine, SourceId};
use crate::error::{PoolError, PoolState};
use crate::pool::handle::SnapshotHandle;
use crate::pool::per_request::PerRequestProvider;
use crate::pool::registry::HandleRegistry;
use crate::pool::shared::SharedViewPool;
use crate::pool::view::CompositeView;
use crate::stats::{PoolCounters, PoolStats, ShutdownReport};

/// 向上层（查询执行）暴露的视图获取能力。
///
/// ## 契约
/// - `acquire` 成功后，视图中的每个快照在 `release` 之前保持有效。
/// - 每个 `acquire` 得到的视图必须恰好 `release` 一次（按值消费）。
/// - `acquire` / `release` 只在 `Ready` 状态有效。
pub trait ViewProvider<E: SnapshotEngine>: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn state(&self) -> PoolState;

    fn bootstrap(&self, sources: &[SourceId]) -> Result<(), PoolError>;

    fn acquire(&self, sources: &[SourceId]) -> Result<CompositeView<E>, PoolError>;

    fn release(&self, view: CompositeView<E>) -> Result<(), PoolError>;

    fn shutdown(&self) -> ShutdownReport;

    fn stats(&self) -> PoolStats;
}

/// 共享策略（封闭集合，由配置解析得到）
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum ProviderKind {
    /// 每次请求打开一个独立快照，归还即关闭
    PerRequest,
    /// 引用计数 + 每 source 最新代共享
    #[default]
    Shared,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::PerRequest => "per_request",
            ProviderKind::Shared => "shared",
        }
    }

    pub fn build<E: SnapshotEngine>(self, engine: Arc<E>) -> Box<dyn ViewProvider<E>> {
        match self {
            ProviderKind::PerRequest => Box::new(PerRequestProvider::new(engine)),
            ProviderKind::Shared => Box::new(SharedViewPool::new(engine)),
        }
    }
}

/// 池状态机。`acquire` / `release` 持读锁（互不阻塞），`bootstrap` / `shutdown` 持写锁，
/// 保证关闭清点时没有进行中的获取。
pub(crate) struct Lifecycle(RwLock<PoolState>);

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self(RwLock::new(PoolState::Uninitialized))
    }

    pub(crate) fn get(&self) -> PoolState {
        *self.0.read()
    }

    pub(crate) fn ready(&self) -> Result<RwLockReadGuard<'_, PoolState>, PoolError> {
        let g = self.0.read();
        if *g != PoolState::Ready {
            return Err(PoolError::InvalidState {
                expected: PoolState::Ready,
                actual: *g,
            });
        }
        Ok(g)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, PoolState> {
        self.0.write()
    }
}

/// 部分失败时回滚：归还本次 acquire 已拿到的令牌
pub(crate) fn release_all<E: SnapshotEngine>(acquired: Vec<Arc<SnapshotHandle<E>>>) {
    for h in acquired {
        h.release();
    }
}

/// 归还视图的每个成员；不属于本池或已被回收的 handle 跳过并告警（不崩溃）
pub(crate) fn release_view<E: SnapshotEngine>(
    registry: &Arc<HandleRegistry<E>>,
    view: CompositeView<E>,
) {
    let mut released = 0usize;
    for h in view.into_handles() {
        if !h.belongs_to(registry) {
            tracing::warn!(
                "Release of foreign snapshot handle #{} ({}), skipping",
                h.id(),
                h.source()
            );
            continue;
        }
        if !registry.contains(h.id()) {
            tracing::warn!(
                "Release of already disposed snapshot handle #{} ({}), skipping",
                h.id(),
                h.source()
            );
            continue;
        }
        h.release();
        released += 1;
    }
    if released > 0 {
        PoolCounters::bump(&registry.counters().releases);
    }
}

/// 关闭清点：注册表里剩下的 handle 都还有调用方未归还的令牌，强制关闭
pub(crate) fn force_drain<E: SnapshotEngine>(
    registry: &HandleRegistry<E>,
    report: &mut ShutdownReport,
) {
    for h in registry.drain() {
        let refs = h.refs();
        tracing::warn!(
            "Shutdown with outstanding acquisition: source={} gen={} handle=#{} refs={}",
            h.source(),
            h.generation(),
            h.id(),
            refs
        );
        h.force_close();
        report.forced_closed += 1;
        report.outstanding_tokens += refs.max(0);
    }
    if report.forced_closed > 0 {
        tracing::warn!(
            "Pool shut down with {} handle(s) still acquired ({} token(s)); callers did not release",
            report.forced_closed,
            report.outstanding_tokens
        );
    } else {
        tracing::info!(
            "Pool shut down cleanly: {} tracker token(s) released",
            report.trackers_released
        );
    }
}

/// RAII 租约：离开作用域时自动 `release`（失败只记录）
pub struct ViewLease<'a, E: SnapshotEngine> {
    provider: &'a dyn ViewProvider<E>,
    view: Option<CompositeView<E>>,
}

impl<'a, E: SnapshotEngine> ViewLease<'a, E> {
    pub fn acquire(
        provider: &'a dyn ViewProvider<E>,
        sources: &[SourceId],
    ) -> Result<Self, PoolError> {
        let view = provider.acquire(sources)?;
        Ok(Self {
            provider,
            view: Some(view),
        })
    }

    /// 显式归还，拿到错误
    pub fn release(mut self) -> Result<(), PoolError> {
        match self.view.take() {
            Some(v) => self.provider.release(v),
            None => Ok(()),
        }
    }
}

impl<E: SnapshotEngine> Deref for ViewLease<'_, E> {
    type Target = CompositeView<E>;

    fn deref(&self) -> &CompositeView<E> {
        self.view
            .as_ref()
            .expect("lease view is present until release")
    }
}

impl<E: SnapshotEngine> Drop for ViewLease<'_, E> {
    fn drop(&mut self) {
        if let Some(v) = self.view.take() {
            if let Err(e) = self.provider.release(v) {
                tracing::warn!("Lease release failed: {}", e);
            }
        }
    }
}
