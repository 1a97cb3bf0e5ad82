use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::{Arc, Weak};

use crate::core::{SnapshotEngine, SourceId};
use crate::pool::registry::HandleRegistry;
use crate::stats::PoolCounters;

pub type HandleId = u64;

/// 快照 + 使用计数：唯一决定何时物理关闭快照的地方。
///
/// ## 计数语义
/// - 新建时为 2：一份给 tracker（"当前代"），一份给刚创建它、马上要用的调用方；
///   bootstrap 时为 1（只有 tracker 那一份）。
/// - 每次成功获取 `retain()`，每次归还 `release()`。
/// - `release()` 观察到减后为 0 是关闭的唯一触发点；减后为负立即 panic。
///
/// 计数只允许经由 `retain` / `release` 修改；`refs()` 仅用于诊断。
pub struct SnapshotHandle<E: SnapshotEngine> {
    id: HandleId,
    source: SourceId,
    generation: u64,
    snapshot: Arc<E::Snapshot>,
    refs: AtomicIsize,
    closed: AtomicBool,
    forced: AtomicBool,
    engine: Arc<E>,
    counters: Arc<PoolCounters>,
    registry: Weak<HandleRegistry<E>>,
}

impl<E: SnapshotEngine> SnapshotHandle<E> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: HandleId,
        source: SourceId,
        generation: u64,
        snapshot: Arc<E::Snapshot>,
        initial_refs: isize,
        engine: Arc<E>,
        counters: Arc<PoolCounters>,
        registry: Weak<HandleRegistry<E>>,
    ) -> Self {
        debug_assert!(initial_refs > 0);
        Self {
            id,
            source,
            generation,
            snapshot,
            refs: AtomicIsize::new(initial_refs),
            closed: AtomicBool::new(false),
            forced: AtomicBool::new(false),
            engine,
            counters,
            registry,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn snapshot(&self) -> &Arc<E::Snapshot> {
        &self.snapshot
    }

    /// 当前计数（仅诊断 / 日志；不得据此做 check-then-act）
    pub fn refs(&self) -> isize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 是否在池关闭时被强制关闭
    pub fn was_forced(&self) -> bool {
        self.forced.load(Ordering::Acquire)
    }

    pub(crate) fn belongs_to(&self, registry: &Arc<HandleRegistry<E>>) -> bool {
        std::ptr::eq(self.registry.as_ptr(), Arc::as_ptr(registry))
    }

    pub(crate) fn retain(&self) {
        let prev = self.refs.fetch_add(1, Ordering::AcqRel);
        assert!(
            prev > 0,
            "snapshot handle #{} ({}) retained after disposal (refs was {})",
            self.id,
            self.source,
            prev
        );
    }

    /// 归还一个令牌；返回 true 表示这次归还触发了关闭。
    pub(crate) fn release(&self) -> bool {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(
            prev > 0,
            "snapshot handle #{} ({}) released more times than retained (refs now {})",
            self.id,
            self.source,
            prev - 1
        );
        if prev != 1 {
            return false;
        }
        self.dispose();
        true
    }

    /// 计数归零：先摘注册表，再关闭
    fn dispose(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self.id);
        }
        self.close_once();
    }

    /// 池关闭时调用：无论计数多少都关闭快照（至多一次）
    pub(crate) fn force_close(&self) -> bool {
        self.forced.store(true, Ordering::Release);
        let closed = self.close_once();
        if closed {
            PoolCounters::bump(&self.counters.forced_closes);
        }
        closed
    }

    /// 真正调用引擎 close；`closed` 标志保证至多一次
    fn close_once(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.engine.close(&self.snapshot) {
            Ok(()) => {
                PoolCounters::bump(&self.counters.closes);
                tracing::debug!(
                    "Closed snapshot: source={} gen={} handle=#{}",
                    self.source,
                    self.generation,
                    self.id
                );
            }
            Err(e) => {
                PoolCounters::bump(&self.counters.close_failures);
                tracing::warn!(
                    "Snapshot close failed (ignored): source={} gen={} handle=#{}: {:#}",
                    self.source,
                    self.generation,
                    self.id,
                    e
                );
            }
        }
        true
    }
}

impl<E: SnapshotEngine> fmt::Debug for SnapshotHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotHandle")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("generation", &self.generation)
            .field("refs", &self.refs())
            .field("closed", &self.is_closed())
            .finish()
    }
}
