use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::core::{SnapshotEngine, SourceId};
use crate::pool::handle::{HandleId, SnapshotHandle};
use crate::stats::PoolCounters;

/// 池级 handle 注册表：所有存活 handle（当前代 + 已被取代但仍被持有的旧代）。
///
/// 只用于关闭时的清点与诊断；注册 / 注销走 DashMap 分片锁，不串行化获取路径。
pub struct HandleRegistry<E: SnapshotEngine> {
    engine: Arc<E>,
    counters: Arc<PoolCounters>,
    handles: DashMap<HandleId, Arc<SnapshotHandle<E>>>,
    next_id: AtomicU64,
}

impl<E: SnapshotEngine> HandleRegistry<E> {
    pub fn new(engine: Arc<E>, counters: Arc<PoolCounters>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            counters,
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn counters(&self) -> &Arc<PoolCounters> {
        &self.counters
    }

    /// 包装新打开的快照并登记
    pub fn register(
        self: &Arc<Self>,
        source: &SourceId,
        generation: u64,
        snapshot: Arc<E::Snapshot>,
        initial_refs: isize,
    ) -> Arc<SnapshotHandle<E>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(SnapshotHandle::new(
            id,
            source.clone(),
            generation,
            snapshot,
            initial_refs,
            self.engine.clone(),
            self.counters.clone(),
            Arc::downgrade(self),
        ));
        self.handles.insert(id, handle.clone());
        tracing::debug!(
            "Registered snapshot handle: source={} gen={} handle=#{} refs={}",
            source,
            generation,
            id,
            initial_refs
        );
        handle
    }

    pub(crate) fn deregister(&self, id: HandleId) -> Option<Arc<SnapshotHandle<E>>> {
        self.handles.remove(&id).map(|(_, h)| h)
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.handles.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// 是否有存活 handle 已经持有这个快照引用
    pub fn owns_snapshot(&self, snapshot: &Arc<E::Snapshot>) -> bool {
        self.handles
            .iter()
            .any(|e| Arc::ptr_eq(e.value().snapshot(), snapshot))
    }

    pub fn outstanding_tokens(&self) -> isize {
        self.handles.iter().map(|e| e.value().refs().max(0)).sum()
    }

    /// 取出全部存活 handle（关闭时强制回收用）
    pub(crate) fn drain(&self) -> Vec<Arc<SnapshotHandle<E>>> {
        let ids: Vec<HandleId> = self.handles.iter().map(|e| *e.key()).collect();
        let mut out: Vec<Arc<SnapshotHandle<E>>> =
            ids.into_iter().filter_map(|id| self.deregister(id)).collect();
        out.sort_by_key(|h| h.id());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;

    #[test]
    fn handle_deregisters_itself_on_last_release() {
        let engine = Arc::new(FakeEngine::new());
        let reg = HandleRegistry::new(engine.clone(), Arc::new(PoolCounters::default()));
        let source = SourceId::new("a");

        let h = reg.register(&source, 1, engine.open(&source).unwrap(), 2);
        assert!(reg.contains(h.id()));
        assert!(h.belongs_to(&reg));
        assert_eq!(reg.outstanding_tokens(), 2);

        h.release();
        assert!(reg.contains(h.id()));
        h.release();
        assert!(!reg.contains(h.id()));
        assert!(reg.is_empty());
        assert_eq!(engine.closes(), 1);
    }

    #[test]
    fn foreign_registry_is_detected() {
        let engine = Arc::new(FakeEngine::new());
        let a = HandleRegistry::new(engine.clone(), Arc::new(PoolCounters::default()));
        let b = HandleRegistry::new(engine.clone(), Arc::new(PoolCounters::default()));
        let source = SourceId::new("a");

        let h = a.register(&source, 1, engine.open(&source).unwrap(), 1);
        assert!(!h.belongs_to(&b));
        assert!(a.owns_snapshot(h.snapshot()));
        assert!(!b.owns_snapshot(h.snapshot()));
        h.release();
    }
}
