use std::sync::Arc;

use crate::core::SourceId;

/// 存储引擎的快照能力（外部协作者，本 crate 不实现合并 / 提交语义）。
///
/// ## 契约（重要）
/// - `open` 每次返回一个全新的、独立的快照。
/// - `reopen` 若数据源自快照以来没有变化，必须返回**同一个** `Arc`
///   （以 `Arc::ptr_eq` 判等）；否则返回新快照，可与旧快照共享未变化的段。
///   每次产出的新 `Arc` 只交给这一次调用方，不会同时返回给两个并发的 `reopen`。
/// - `close` 只释放该快照引用的资源；失败只会被记录，不会越过池的边界。
pub trait SnapshotEngine: Send + Sync + 'static {
    type Snapshot: Send + Sync + 'static;

    fn open(&self, source: &SourceId) -> anyhow::Result<Arc<Self::Snapshot>>;

    fn reopen(&self, current: &Arc<Self::Snapshot>) -> anyhow::Result<Arc<Self::Snapshot>>;

    fn close(&self, snapshot: &Self::Snapshot) -> anyhow::Result<()>;
}
