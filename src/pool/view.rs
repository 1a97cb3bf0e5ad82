use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::core::{SnapshotEngine, SourceId};
use crate::pool::handle::SnapshotHandle;

/// 多个单源快照的有序聚合，让跨 source 的调用方把它们当作一个视图。
///
/// 相等 / 哈希按"有序的成员快照身份"（指针）定义，而不是内容比较：
/// 两次 `acquire([A, B])` 之间没有新代发布时得到的视图相等，`[B, A]` 则不相等。
/// 上层按视图身份做缓存时依赖这一点。
///
/// 只能由 provider 构造；不可 Clone，`release` 按值消费，同一视图无法被归还两次。
pub struct CompositeView<E: SnapshotEngine> {
    handles: Vec<Arc<SnapshotHandle<E>>>,
}

impl<E: SnapshotEngine> CompositeView<E> {
    pub(crate) fn new(handles: Vec<Arc<SnapshotHandle<E>>>) -> Self {
        Self { handles }
    }

    /// 有序成员快照
    pub fn constituents(&self) -> impl Iterator<Item = &Arc<E::Snapshot>> + '_ {
        self.handles.iter().map(|h| h.snapshot())
    }

    pub fn get(&self, i: usize) -> Option<&Arc<E::Snapshot>> {
        self.handles.get(i).map(|h| h.snapshot())
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceId> + '_ {
        self.handles.iter().map(|h| h.source())
    }

    pub fn generations(&self) -> Vec<u64> {
        self.handles.iter().map(|h| h.generation()).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub(crate) fn handles(&self) -> &[Arc<SnapshotHandle<E>>] {
        &self.handles
    }

    pub(crate) fn into_handles(self) -> Vec<Arc<SnapshotHandle<E>>> {
        self.handles
    }
}

fn identity<T>(snapshot: &Arc<T>) -> usize {
    Arc::as_ptr(snapshot) as *const () as usize
}

impl<E: SnapshotEngine> PartialEq for CompositeView<E> {
    fn eq(&self, other: &Self) -> bool {
        self.handles.len() == other.handles.len()
            && self
                .handles
                .iter()
                .zip(&other.handles)
                .all(|(a, b)| Arc::ptr_eq(a.snapshot(), b.snapshot()))
    }
}

impl<E: SnapshotEngine> Eq for CompositeView<E> {}

impl<E: SnapshotEngine> Hash for CompositeView<E> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handles.len().hash(state);
        for h in &self.handles {
            identity(h.snapshot()).hash(state);
        }
    }
}

impl<E: SnapshotEngine> fmt::Debug for CompositeView<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.handles
                    .iter()
                    .map(|h| format!("{}@gen{}#{}", h.source(), h.generation(), h.id())),
            )
            .finish()
    }
}
