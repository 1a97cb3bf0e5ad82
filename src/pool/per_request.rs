use std::sync::Arc;

use crate::core::{SnapshotEngine, SourceId};
use crate::error::{PoolError, PoolState};
use crate::pool::provider::{
    force_drain, release_all, release_view, Lifecycle, ProviderKind, ViewProvider,
};
use crate::pool::registry::HandleRegistry;
use crate::pool::view::CompositeView;
use crate::stats::{PoolCounters, PoolStats, ShutdownReport};

/// 不共享：每次 acquire 为每个 source 打开独立快照（计数 1），release 即关闭。
///
/// 与 [`crate::pool::SharedViewPool`] 共用 handle / 注册表，关闭时同样强制回收未归还的快照。
pub struct PerRequestProvider<E: SnapshotEngine> {
    registry: Arc<HandleRegistry<E>>,
    lifecycle: Lifecycle,
}

impl<E: SnapshotEngine> PerRequestProvider<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            registry: HandleRegistry::new(engine, Arc::new(PoolCounters::default())),
            lifecycle: Lifecycle::new(),
        }
    }
}

impl<E: SnapshotEngine> ViewProvider<E> for PerRequestProvider<E> {
    fn kind(&self) -> ProviderKind {
        ProviderKind::PerRequest
    }

    fn state(&self) -> PoolState {
        self.lifecycle.get()
    }

    fn bootstrap(&self, sources: &[SourceId]) -> Result<(), PoolError> {
        let mut state = self.lifecycle.write();
        if *state == PoolState::ShutDown {
            return Err(PoolError::InvalidState {
                expected: PoolState::Uninitialized,
                actual: *state,
            });
        }
        // 无需预先打开：每个请求自己 open
        tracing::info!(
            "Per-request view provider ready ({} known source(s))",
            sources.len()
        );
        *state = PoolState::Ready;
        Ok(())
    }

    fn acquire(&self, sources: &[SourceId]) -> Result<CompositeView<E>, PoolError> {
        let _ready = self.lifecycle.ready()?;
        if sources.is_empty() {
            return Err(PoolError::EmptyRequest);
        }

        let engine = self.registry.engine();
        let counters = self.registry.counters();
        let mut acquired = Vec::with_capacity(sources.len());
        for source in sources {
            match engine.open(source) {
                Ok(snapshot) => {
                    PoolCounters::bump(&counters.opens);
                    acquired.push(self.registry.register(source, 1, snapshot, 1));
                }
                Err(cause) => {
                    release_all(acquired);
                    return Err(PoolError::Open {
                        source_id: source.clone(),
                        cause,
                    });
                }
            }
        }
        PoolCounters::bump(&counters.acquisitions);
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
        if *state == PoolState::ShutDown {
            tracing::warn!("Per-request view provider already shut down, ignoring");
            return report;
        }
        *state = PoolState::ShutDown;
        force_drain(&self.registry, &mut report);
        report
    }

    fn stats(&self) -> PoolStats {
        PoolStats::new(
            ProviderKind::PerRequest.as_str(),
            self.lifecycle.get(),
            self.registry.counters(),
            Vec::new(),
            self.registry.len(),
            self.registry.outstanding_tokens(),
        )
    }
}

impl<E: SnapshotEngine> Drop for PerRequestProvider<E> {
    fn drop(&mut self) {
        if self.lifecycle.get() != PoolState::ShutDown && !self.registry.is_empty() {
            tracing::warn!("Per-request view provider dropped without shutdown, shutting down now");
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;

    #[test]
    fn every_acquire_opens_and_release_closes() {
        let engine = Arc::new(FakeEngine::new());
        let p = PerRequestProvider::new(engine.clone());
        let a = vec![SourceId::new("a")];
        p.bootstrap(&a).unwrap();
        assert_eq!(engine.opens(), 0);

        let v1 = p.acquire(&a).unwrap();
        let v2 = p.acquire(&a).unwrap();
        assert_eq!(engine.opens(), 2);
        // 独立快照：不相等
        assert_ne!(v1, v2);

        p.release(v1).unwrap();
        assert_eq!(engine.closes(), 1);
        p.release(v2).unwrap();
        assert_eq!(engine.closes(), 2);
        assert!(p.shutdown().is_clean());
    }

    #[test]
    fn failure_midway_closes_opened_snapshots() {
        let engine = Arc::new(FakeEngine::new());
        let p = PerRequestProvider::new(engine.clone());
        p.bootstrap(&[]).unwrap();
        let bad = SourceId::new("bad");
        engine.fail_open(&bad, true);

        let err = p.acquire(&[SourceId::new("a"), bad]).unwrap_err();
        assert!(matches!(err, PoolError::Open { .. }));
        assert_eq!(engine.opens(), 1);
        assert_eq!(engine.open_count(), 0);
    }

    #[test]
    fn shutdown_forces_unreleased() {
        let engine = Arc::new(FakeEngine::new());
        let p = PerRequestProvider::new(engine.clone());
        p.bootstrap(&[]).unwrap();
        let _leaked = p.acquire(&[SourceId::new("a")]).unwrap();

        let r = p.shutdown();
        assert_eq!(r.forced_closed, 1);
        assert_eq!(engine.open_count(), 0);
    }
}
