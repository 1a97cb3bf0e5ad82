use std::sync::Arc;

use dashmap::DashMap;
use rayon::prelude::*;

use crate::core::{SnapshotEngine, SourceId};
use crate::error::{PoolError, PoolState};
use crate::pool::provider::{
    force_drain, release_all, release_view, Lifecycle, ProviderKind, ViewProvider,
};
use crate::pool::handle::SnapshotHandle;
use crate::pool::registry::HandleRegistry;
use crate::pool::tracker::LatestSnapshotTracker;
use crate::pool::view::CompositeView;
use crate::stats::{PoolCounters, PoolStats, ShutdownReport};

/// 共享快照池：每个 source 一个 [`LatestSnapshotTracker`]，按请求把多个 source 的
/// 最新代聚合为一个 [`CompositeView`]。
///
/// 没有全局串行点：
/// - tracker 表与 handle 注册表都是 DashMap；
/// - 每个 source 的刷新只锁自己的 tracker；
/// - 池状态读写锁只在 bootstrap / shutdown 时被独占。
pub struct SharedViewPool<E: SnapshotEngine> {
    registry: Arc<HandleRegistry<E>>,
    trackers: DashMap<SourceId, Arc<LatestSnapshotTracker<E>>>,
    lifecycle: Lifecycle,
}

impl<E: SnapshotEngine> SharedViewPool<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            registry: HandleRegistry::new(engine, Arc::new(PoolCounters::default())),
            trackers: DashMap::new(),
            lifecycle: Lifecycle::new(),
        }
    }

    /// 查找或原子地懒创建 tracker（同一 source 并发首次访问只会创建一个）
    fn tracker_for(&self, source: &SourceId) -> Arc<LatestSnapshotTracker<E>> {
        if let Some(t) = self.trackers.get(source) {
            return t.value().clone();
        }
        self.trackers
            .entry(source.clone())
            .or_insert_with(|| {
                tracing::debug!("Registering tracker for new source {}", source);
                Arc::new(LatestSnapshotTracker::new(
                    source.clone(),
                    self.registry.clone(),
                ))
            })
            .value()
            .clone()
    }

    /// 取某个 source 的最新 handle。
    ///
    /// 懒创建的 tracker 首次 open 失败时从表中摘除，未知 source 名不会在池里堆积。
    /// 调用方持有状态读锁，tracker 只可能因摘除而处于关闭状态，此时换新 tracker 重试。
    fn refresh_source(&self, source: &SourceId) -> Result<Arc<SnapshotHandle<E>>, PoolError> {
        loop {
            let tracker = self.tracker_for(source);
            match tracker.refresh_and_get() {
                Err(PoolError::SourceClosed(_)) if !self.is_registered(source, &tracker) => continue,
                Err(e @ PoolError::Open { .. }) => {
                    if self
                        .trackers
                        .remove_if(source, |_, t| t.retire_if_unopened())
                        .is_some()
                    {
                        tracing::debug!("Dropped tracker for unopenable source {}", source);
                    }
                    return Err(e);
                }
                r => return r,
            }
        }
    }

    fn is_registered(&self, source: &SourceId, tracker: &Arc<LatestSnapshotTracker<E>>) -> bool {
        self.trackers
            .get(source)
            .is_some_and(|t| Arc::ptr_eq(t.value(), tracker))
    }

    pub fn tracker(&self, source: &SourceId) -> Option<Arc<LatestSnapshotTracker<E>>> {
        self.trackers.get(source).map(|t| t.value().clone())
    }

    pub fn registry(&self) -> &Arc<HandleRegistry<E>> {
        &self.registry
    }

    fn teardown(&self, report: &mut ShutdownReport) {
        // 1) 各 tracker 交出"当前"令牌（tracker 锁已在 close() 内释放）
        let trackers: Vec<_> = self.trackers.iter().map(|e| e.value().clone()).collect();
        for t in trackers {
            if let Some(h) = t.close() {
                h.release();
                report.trackers_released += 1;
            }
        }
        // 2) 剩下的都是调用方尚未归还的
        force_drain(&self.registry, report);
    }
}

impl<E: SnapshotEngine> ViewProvider<E> for SharedViewPool<E> {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Shared
    }

    fn state(&self) -> PoolState {
        self.lifecycle.get()
    }

    /// 为每个已知 source 建 tracker 并并行打开初始快照。
    ///
    /// 任一 source 打开失败则返回错误且池保持 `Uninitialized`；
    /// 已成功的 tracker 保留，再次 bootstrap 只会重试失败的那些。
    fn bootstrap(&self, sources: &[SourceId]) -> Result<(), PoolError> {
        let mut state = self.lifecycle.write();
        if *state == PoolState::ShutDown {
            return Err(PoolError::InvalidState {
                expected: PoolState::Uninitialized,
                actual: *state,
            });
        }

        let trackers: Vec<_> = sources.iter().map(|s| self.tracker_for(s)).collect();
        let results: Vec<Result<(), PoolError>> =
            trackers.par_iter().map(|t| t.bootstrap()).collect();

        let mut first_err = None;
        for (t, r) in trackers.iter().zip(results) {
            if let Err(e) = r {
                tracing::warn!("Bootstrap of source {} failed: {}", t.source(), e);
                first_err.get_or_insert(e);
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        if *state == PoolState::Uninitialized {
            tracing::info!("Shared view pool ready: {} source(s)", self.trackers.len());
        }
        *state = PoolState::Ready;
        Ok(())
    }

    fn acquire(&self, sources: &[SourceId]) -> Result<CompositeView<E>, PoolError> {
        let _ready = self.lifecycle.ready()?;
        if sources.is_empty() {
            return Err(PoolError::EmptyRequest);
        }

        let mut acquired = Vec::with_capacity(sources.len());
        for source in sources {
            match self.refresh_source(source) {
                Ok(h) => acquired.push(h),
                Err(e) => {
                    release_all(acquired);
                    return Err(e);
                }
            }
        }
        PoolCounters::bump(&self.registry.counters().acquisitions);
        Ok(CompositeView::new(acquired))
    }

    fn release(&self, view: CompositeView<E>) -> Result<(), PoolError> {
        let _ready = self.lifecycle.ready()?;
        release_view(&self.registry, view);
        Ok(())
    }

    fn shutdown(&self) -> ShutdownReport {
        let mut state = self.lifecycle.write();
        let mut report = ShutdownReport::default();
        match *state {
            PoolState::Ready => {}
            PoolState::ShutDown => {
                tracing::warn!("Shared view pool already shut down, ignoring");
                return report;
            }
            PoolState::Uninitialized => {
                // bootstrap 没完成也可能已有 tracker 打开了快照，照样回收
                tracing::warn!("Shutting down a pool that never finished bootstrap");
            }
        }
        *state = PoolState::ShutDown;
        self.teardown(&mut report);
        report
    }

    fn stats(&self) -> PoolStats {
        let mut sources: Vec<_> = self.trackers.iter().map(|e| e.value().stats()).collect();
        sources.sort_by(|a, b| a.source.cmp(&b.source));
        PoolStats::new(
            ProviderKind::Shared.as_str(),
            self.lifecycle.get(),
            self.registry.counters(),
            sources,
            self.registry.len(),
            self.registry.outstanding_tokens(),
        )
    }
}

impl<E: SnapshotEngine> Drop for SharedViewPool<E> {
    fn drop(&mut self) {
        if self.lifecycle.get() != PoolState::ShutDown && !self.trackers.is_empty() {
            tracing::warn!("Shared view pool dropped without shutdown, shutting down now");
            self.shutdown();
        }
    }
}
