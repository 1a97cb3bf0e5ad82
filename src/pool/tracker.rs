use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::{SnapshotEngine, SourceId};
use crate::error::PoolError;
use crate::pool::handle::SnapshotHandle;
use crate::pool::registry::HandleRegistry;
use crate::stats::{PoolCounters, SourceStats};

enum Slot<E: SnapshotEngine> {
    /// 懒创建的 tracker：首个请求者在锁内完成第一次 open
    Unopened,
    Live(Arc<SnapshotHandle<E>>),
    Closed,
}

/// 第二次持锁（发布阶段）的结果；所有 release / close 都在锁外执行
enum Publish<E: SnapshotEngine> {
    /// 新代已发布；旧 handle 交出 tracker 的那份令牌
    Swapped {
        fresh: Arc<SnapshotHandle<E>>,
        superseded: Arc<SnapshotHandle<E>>,
    },
    /// 别的调用方先一步发布了更新的代；本次 reopen 的结果作废
    Lost {
        winner: Arc<SnapshotHandle<E>>,
        orphan: Arc<E::Snapshot>,
    },
    Closed {
        orphan: Arc<E::Snapshot>,
    },
}

/// 每个 source 一个：持有"当前代" handle，负责产出最新的一代。
///
/// 锁只保护"谁是当前代"这一结构性切换；reopen 的 I/O 与物理 close 都在锁外。
/// 唯一持锁做 I/O 的是该 source 的第一次 open（bootstrap 或懒创建），
/// 这样并发的首次访问不会重复打开。
pub struct LatestSnapshotTracker<E: SnapshotEngine> {
    source: SourceId,
    registry: Arc<HandleRegistry<E>>,
    slot: Mutex<Slot<E>>,
}

impl<E: SnapshotEngine> LatestSnapshotTracker<E> {
    /// 尚未打开的 tracker（懒创建路径）
    pub fn new(source: SourceId, registry: Arc<HandleRegistry<E>>) -> Self {
        Self {
            source,
            registry,
            slot: Mutex::new(Slot::Unopened),
        }
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    fn engine(&self) -> &Arc<E> {
        self.registry.engine()
    }

    fn counters(&self) -> &Arc<PoolCounters> {
        self.registry.counters()
    }

    fn open_fresh(&self, initial_refs: isize) -> Result<Arc<SnapshotHandle<E>>, PoolError> {
        let snapshot = self
            .engine()
            .open(&self.source)
            .map_err(|cause| PoolError::Open {
                source_id: self.source.clone(),
                cause,
            })?;
        PoolCounters::bump(&self.counters().opens);
        PoolCounters::bump(&self.counters().generations_published);
        Ok(self.registry.register(&self.source, 1, snapshot, initial_refs))
    }

    /// 打开初始快照；计数恰为 1（只有 tracker 自己的"当前"令牌）
    pub fn bootstrap(&self) -> Result<(), PoolError> {
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Unopened => {}
            Slot::Live(_) => return Ok(()),
            Slot::Closed => return Err(PoolError::SourceClosed(self.source.clone())),
        }
        let handle = self.open_fresh(1)?;
        tracing::info!("Bootstrapped source {}: handle=#{}", self.source, handle.id());
        *slot = Slot::Live(handle);
        Ok(())
    }

    /// 返回最新可用的 handle，调用方欠它恰好一次 `release()`。
    pub fn refresh_and_get(&self) -> Result<Arc<SnapshotHandle<E>>, PoolError> {
        // 1) 持锁：钉住当前代（这份令牌稍后要么交给调用方，要么在锁外归还）
        let pinned = {
            let mut slot = self.slot.lock();
            match &*slot {
                Slot::Live(h) => {
                    h.retain();
                    h.clone()
                }
                Slot::Closed => return Err(PoolError::SourceClosed(self.source.clone())),
                Slot::Unopened => {
                    // 失败时保持 Unopened，下一次请求会重新 open
                    let handle = self.open_fresh(2)?;
                    tracing::debug!(
                        "Lazily opened source {}: handle=#{}",
                        self.source,
                        handle.id()
                    );
                    *slot = Slot::Live(handle.clone());
                    return Ok(handle);
                }
            }
        };

        // 2) 锁外 reopen
        PoolCounters::bump(&self.counters().reopens);
        let reopened = match self.engine().reopen(pinned.snapshot()) {
            Ok(s) => s,
            Err(cause) => {
                pinned.release();
                return Err(PoolError::Reopen {
                    source_id: self.source.clone(),
                    cause,
                });
            }
        };

        // 3) 同一引用：当前代仍有效，钉住的令牌就是调用方的
        if Arc::ptr_eq(&reopened, pinned.snapshot()) {
            PoolCounters::bump(&self.counters().reopen_reused);
            return Ok(pinned);
        }

        // 4) 新引用：持锁发布
        let outcome = {
            let mut slot = self.slot.lock();
            match &mut *slot {
                Slot::Live(current) if Arc::ptr_eq(current, &pinned) => {
                    let fresh = self.registry.register(
                        &self.source,
                        pinned.generation() + 1,
                        reopened,
                        2,
                    );
                    let superseded = std::mem::replace(current, fresh.clone());
                    Publish::Swapped { fresh, superseded }
                }
                Slot::Live(current) => {
                    current.retain();
                    Publish::Lost {
                        winner: current.clone(),
                        orphan: reopened,
                    }
                }
                Slot::Unopened | Slot::Closed => Publish::Closed { orphan: reopened },
            }
        };

        // 5) 锁外收尾：归还钉住的令牌，必要时交出旧代的"当前"令牌
        match outcome {
            Publish::Swapped { fresh, superseded } => {
                PoolCounters::bump(&self.counters().generations_published);
                tracing::info!(
                    "Published new generation: source={} gen={} handle=#{} (superseded #{})",
                    self.source,
                    fresh.generation(),
                    fresh.id(),
                    superseded.id()
                );
                pinned.release();
                superseded.release();
                Ok(fresh)
            }
            Publish::Lost { winner, orphan } => {
                PoolCounters::bump(&self.counters().redundant_reopens);
                tracing::debug!(
                    "Reopen race lost: source={} keeping gen={} handle=#{}",
                    self.source,
                    winner.generation(),
                    winner.id()
                );
                self.discard_orphan(&orphan);
                pinned.release();
                Ok(winner)
            }
            Publish::Closed { orphan } => {
                self.discard_orphan(&orphan);
                pinned.release();
                Err(PoolError::SourceClosed(self.source.clone()))
            }
        }
    }

    /// 丢弃竞争失败的 reopen 结果；若引擎把同一引用发给了已登记的 handle，则不能关。
    ///
    /// 检查与关闭之间不加锁：依赖引擎契约，`reopen` 产出的新 `Arc` 不会同时交给两个调用方，
    /// 因此只有本调用方持有这个孤儿。
    fn discard_orphan(&self, orphan: &Arc<E::Snapshot>) {
        if self.registry.owns_snapshot(orphan) {
            return;
        }
        if let Err(e) = self.engine().close(orphan) {
            PoolCounters::bump(&self.counters().close_failures);
            tracing::warn!(
                "Close of redundant snapshot failed (ignored): source={}: {:#}",
                self.source,
                e
            );
        }
    }

    /// 标记关闭并交出当前 handle；调用方在锁外归还 tracker 的令牌
    pub(crate) fn close(&self) -> Option<Arc<SnapshotHandle<E>>> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Closed) {
            Slot::Live(h) => Some(h),
            Slot::Unopened | Slot::Closed => None,
        }
    }

    /// 尚未成功打开过（懒创建且首次 open 失败）
    pub fn is_unopened(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Unopened)
    }

    /// `Unopened → Closed`：从池中摘除前调用，仍持有旧 `Arc` 的并发请求会看到 `SourceClosed`
    pub(crate) fn retire_if_unopened(&self) -> bool {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Unopened) {
            *slot = Slot::Closed;
            true
        } else {
            false
        }
    }

    /// 当前代（诊断）
    pub fn current(&self) -> Option<Arc<SnapshotHandle<E>>> {
        match &*self.slot.lock() {
            Slot::Live(h) => Some(h.clone()),
            _ => None,
        }
    }

    pub fn stats(&self) -> SourceStats {
        let current = self.current();
        SourceStats {
            source: self.source.to_string(),
            generation: current.as_ref().map(|h| h.generation()),
            refs: current.as_ref().map(|h| h.refs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;

    fn mk_tracker(engine: &Arc<FakeEngine>, name: &str) -> LatestSnapshotTracker<FakeEngine> {
        let reg = HandleRegistry::new(engine.clone(), Arc::new(PoolCounters::default()));
        LatestSnapshotTracker::new(SourceId::new(name), reg)
    }

    #[test]
    fn bootstrap_publishes_with_single_token() {
        let engine = Arc::new(FakeEngine::new());
        let t = mk_tracker(&engine, "a");
        t.bootstrap().unwrap();

        let cur = t.current().unwrap();
        assert_eq!(cur.refs(), 1);
        assert_eq!(cur.generation(), 1);
        assert_eq!(engine.opens(), 1);

        // 重复 bootstrap 不会重复打开
        t.bootstrap().unwrap();
        assert_eq!(engine.opens(), 1);
    }

    #[test]
    fn unchanged_source_reuses_identical_snapshot() {
        let engine = Arc::new(FakeEngine::new());
        let t = mk_tracker(&engine, "a");
        t.bootstrap().unwrap();
        let first = t.current().unwrap();

        let mut got = Vec::new();
        for _ in 0..5 {
            let h = t.refresh_and_get().unwrap();
            assert!(Arc::ptr_eq(h.snapshot(), first.snapshot()));
            got.push(h);
        }
        assert_eq!(first.refs(), 6);
        assert_eq!(engine.reopens(), 5);

        for h in got {
            h.release();
        }
        assert_eq!(first.refs(), 1);
        assert!(!first.snapshot().is_closed());
        assert_eq!(engine.closes(), 0);
    }

    #[test]
    fn rotation_closes_old_generation_after_last_release() {
        let engine = Arc::new(FakeEngine::new());
        let t = mk_tracker(&engine, "a");
        t.bootstrap().unwrap();

        let n = 4;
        let old: Vec<_> = (0..n).map(|_| t.refresh_and_get().unwrap()).collect();
        let old_snap = old[0].snapshot().clone();
        assert_eq!(old[0].refs(), n as isize + 1);

        engine.commit(&SourceId::new("a"));
        let fresh = t.refresh_and_get().unwrap();
        assert!(!Arc::ptr_eq(fresh.snapshot(), &old_snap));
        assert_eq!(fresh.refs(), 2);
        assert_eq!(fresh.generation(), 2);

        // tracker 已交出自己的令牌，只剩 N 个调用方
        assert_eq!(old[0].refs(), n as isize);
        for (i, h) in old.iter().enumerate() {
            assert!(!old_snap.is_closed(), "closed early at release {}", i);
            h.release();
        }
        assert!(old_snap.is_closed());
        assert_eq!(engine.closes(), 1);

        fresh.release();
        assert_eq!(t.current().unwrap().refs(), 1);
    }

    #[test]
    fn reopen_failure_leaves_state_unchanged_and_is_retryable() {
        let engine = Arc::new(FakeEngine::new());
        let source = SourceId::new("a");
        let t = mk_tracker(&engine, "a");
        t.bootstrap().unwrap();
        let before = t.current().unwrap();

        engine.fail_reopen(&source, true);
        let err = t.refresh_and_get().unwrap_err();
        assert!(matches!(err, PoolError::Reopen { .. }));
        assert!(Arc::ptr_eq(&t.current().unwrap(), &before));
        assert_eq!(before.refs(), 1);

        engine.fail_reopen(&source, false);
        let h = t.refresh_and_get().unwrap();
        assert!(Arc::ptr_eq(&h, &before));
        h.release();
    }

    #[test]
    fn lazy_open_failure_is_not_poisoned() {
        let engine = Arc::new(FakeEngine::new());
        let source = SourceId::new("late");
        let t = mk_tracker(&engine, "late");

        engine.fail_open(&source, true);
        assert!(matches!(t.refresh_and_get(), Err(PoolError::Open { .. })));
        assert!(t.current().is_none());

        engine.fail_open(&source, false);
        let h = t.refresh_and_get().unwrap();
        assert_eq!(h.refs(), 2);
        assert_eq!(engine.opens(), 1);
        h.release();
    }

    #[test]
    fn retire_only_applies_to_unopened_tracker() {
        let engine = Arc::new(FakeEngine::new());
        let t = mk_tracker(&engine, "a");
        assert!(t.is_unopened());
        assert!(t.retire_if_unopened());
        assert!(!t.is_unopened());
        assert!(matches!(t.refresh_and_get(), Err(PoolError::SourceClosed(_))));
        assert_eq!(engine.opens(), 0);

        let live = mk_tracker(&engine, "b");
        live.bootstrap().unwrap();
        assert!(!live.retire_if_unopened());
        let h = live.refresh_and_get().unwrap();
        h.release();
    }

    #[test]
    fn closed_tracker_rejects_refresh() {
        let engine = Arc::new(FakeEngine::new());
        let t = mk_tracker(&engine, "a");
        t.bootstrap().unwrap();

        let cur = t.close().unwrap();
        cur.release();
        assert!(cur.is_closed());
        assert!(matches!(t.refresh_and_get(), Err(PoolError::SourceClosed(_))));
        assert!(t.close().is_none());
    }

    #[test]
    fn concurrent_refresh_never_double_closes() {
        let engine = Arc::new(FakeEngine::new());
        let source = SourceId::new("a");
        let t = mk_tracker(&engine, "a");
        t.bootstrap().unwrap();

        std::thread::scope(|s| {
            for i in 0..8 {
                let t = &t;
                let engine = &engine;
                let source = &source;
                s.spawn(move || {
                    for round in 0..200 {
                        if (round + i) % 17 == 0 {
                            engine.commit(source);
                        }
                        let h = t.refresh_and_get().unwrap();
                        h.snapshot().begin_use();
                        std::thread::yield_now();
                        h.snapshot().end_use();
                        h.release();
                    }
                });
            }
        });

        let cur = t.close().unwrap();
        cur.release();
        // 所有发出的快照最终都被关闭，且 FakeEngine 内部已断言无重复关闭
        assert_eq!(engine.open_count(), 0);
    }
}
