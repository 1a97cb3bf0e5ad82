//! 测试用的假存储引擎：自带一份独立的"使用中"计数，
//! 在 close 时断言没有人还在用、同一快照不会被关两次。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::{SnapshotEngine, SourceId};

pub struct FakeSnapshot {
    pub serial: u64,
    pub source: SourceId,
    /// 引擎内该 source 的版本号（reopen 据此判断是否需要新快照）
    pub version: u64,
    closed: AtomicBool,
    users: AtomicIsize,
}

impl FakeSnapshot {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 模拟查询开始使用快照：已关闭即为 use-after-close
    pub fn begin_use(&self) {
        assert!(
            !self.is_closed(),
            "use after close: snapshot #{} ({})",
            self.serial,
            self.source
        );
        self.users.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_use(&self) {
        let prev = self.users.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "end_use without begin_use on #{}", self.serial);
    }
}

#[derive(Default)]
struct SourceState {
    version: AtomicU64,
    fail_open: AtomicBool,
    fail_reopen: AtomicBool,
}

pub struct FakeEngine {
    next_serial: AtomicU64,
    sources: Mutex<HashMap<SourceId, Arc<SourceState>>>,
    issued: Mutex<Vec<Arc<FakeSnapshot>>>,
    opens: AtomicUsize,
    reopens: AtomicUsize,
    closes: AtomicUsize,
    fail_closes: AtomicBool,
    allow_close_with_users: AtomicBool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            next_serial: AtomicU64::new(1),
            sources: Mutex::new(HashMap::new()),
            issued: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            reopens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            fail_closes: AtomicBool::new(false),
            allow_close_with_users: AtomicBool::new(false),
        }
    }

    fn state(&self, source: &SourceId) -> Arc<SourceState> {
        self.sources
            .lock()
            .entry(source.clone())
            .or_default()
            .clone()
    }

    /// 模拟一次提交：下一次 reopen 会返回新快照
    pub fn commit(&self, source: &SourceId) {
        self.state(source).version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn fail_open(&self, source: &SourceId, on: bool) {
        self.state(source).fail_open.store(on, Ordering::SeqCst);
    }

    pub fn fail_reopen(&self, source: &SourceId, on: bool) {
        self.state(source).fail_reopen.store(on, Ordering::SeqCst);
    }

    pub fn fail_closes(&self, on: bool) {
        self.fail_closes.store(on, Ordering::SeqCst);
    }

    /// 池关闭强制回收时，调用方可能仍持有快照
    pub fn allow_close_with_users(&self, on: bool) {
        self.allow_close_with_users.store(on, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn reopens(&self) -> usize {
        self.reopens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn issued(&self) -> Vec<Arc<FakeSnapshot>> {
        self.issued.lock().clone()
    }

    /// 已发出但尚未关闭的快照数
    pub fn open_count(&self) -> usize {
        self.issued.lock().iter().filter(|s| !s.is_closed()).count()
    }

    fn issue(&self, source: &SourceId, version: u64) -> Arc<FakeSnapshot> {
        let snap = Arc::new(FakeSnapshot {
            serial: self.next_serial.fetch_add(1, Ordering::SeqCst),
            source: source.clone(),
            version,
            closed: AtomicBool::new(false),
            users: AtomicIsize::new(0),
        });
        self.issued.lock().push(snap.clone());
        snap
    }
}

impl SnapshotEngine for FakeEngine {
    type Snapshot = FakeSnapshot;

    fn open(&self, source: &SourceId) -> anyhow::Result<Arc<FakeSnapshot>> {
        let st = self.state(source);
        if st.fail_open.load(Ordering::SeqCst) {
            anyhow::bail!("source {} unavailable", source);
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(self.issue(source, st.version.load(Ordering::SeqCst)))
    }

    fn reopen(&self, current: &Arc<FakeSnapshot>) -> anyhow::Result<Arc<FakeSnapshot>> {
        assert!(
            !current.is_closed(),
            "reopen of closed snapshot #{}",
            current.serial
        );
        let st = self.state(&current.source);
        if st.fail_reopen.load(Ordering::SeqCst) {
            anyhow::bail!("source {} unavailable", current.source);
        }
        self.reopens.fetch_add(1, Ordering::SeqCst);
        let version = st.version.load(Ordering::SeqCst);
        if version == current.version {
            return Ok(current.clone());
        }
        Ok(self.issue(&current.source, version))
    }

    fn close(&self, snapshot: &FakeSnapshot) -> anyhow::Result<()> {
        if !self.allow_close_with_users.load(Ordering::SeqCst) {
            let users = snapshot.users.load(Ordering::SeqCst);
            assert_eq!(
                users, 0,
                "snapshot #{} closed while {} user(s) still hold it",
                snapshot.serial, users
            );
        }
        let was_closed = snapshot.closed.swap(true, Ordering::SeqCst);
        assert!(!was_closed, "double close of snapshot #{}", snapshot.serial);
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_closes.load(Ordering::SeqCst) {
            anyhow::bail!("close of #{} failed", snapshot.serial);
        }
        Ok(())
    }
}

pub fn unique_tmp_dir(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("snap-pool-{}-{}", tag, nanos))
}
