use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::{SnapshotEngine, SourceId};
use crate::storage::segment::{mtime_ns, Segment, SegmentFingerprint};

const SEGMENT_EXT: &str = "seg";

/// 一个 source 的时间点视图：打开时目录里的全部段（按文件名排序）
pub struct SegmentSnapshot {
    serial: u64,
    source: SourceId,
    segments: Vec<Arc<Segment>>,
}

impl SegmentSnapshot {
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn segments(&self) -> &[Arc<Segment>] {
        &self.segments
    }

    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.len()).sum()
    }

    /// 与另一快照共享（同一 `Arc`）的段数
    pub fn shared_with(&self, other: &SegmentSnapshot) -> usize {
        self.segments
            .iter()
            .filter(|s| other.segments.iter().any(|o| Arc::ptr_eq(s, o)))
            .count()
    }
}

/// 目录布局的存储引擎适配层：`<root>/<source>/*.seg`。
///
/// - open：扫描并映射全部段
/// - reopen：只 stat；段集合不变返回同一个 `Arc`，否则构造新快照并复用未变化段的 `Arc<Segment>`
/// - close：只做记账，映射随最后一个共享者释放
///
/// 不做任何合并 / 提交；段文件由外部写入方原子落盘。
pub struct SegmentDirEngine {
    root: PathBuf,
    next_serial: AtomicU64,
    open_snapshots: AtomicUsize,
}

impl SegmentDirEngine {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            next_serial: AtomicU64::new(1),
            open_snapshots: AtomicUsize::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn open_snapshots(&self) -> usize {
        self.open_snapshots.load(Ordering::Relaxed)
    }

    /// 根目录下的所有 source（子目录名），排序
    pub fn discover_sources(&self) -> anyhow::Result<Vec<SourceId>> {
        let mut out = Vec::new();
        for ent in std::fs::read_dir(&self.root)? {
            let ent = ent?;
            if ent.file_type()?.is_dir() {
                out.push(SourceId::new(ent.file_name().to_string_lossy()));
            }
        }
        out.sort();
        Ok(out)
    }

    fn source_dir(&self, source: &SourceId) -> anyhow::Result<PathBuf> {
        let name = source.as_str();
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            anyhow::bail!("invalid source name {:?}", name);
        }
        let dir = self.root.join(name);
        if !dir.is_dir() {
            anyhow::bail!("source directory {:?} not found", dir);
        }
        Ok(dir)
    }

    fn list_segments(dir: &Path) -> anyhow::Result<Vec<SegmentFingerprint>> {
        let mut out = Vec::new();
        for ent in std::fs::read_dir(dir)? {
            let ent = ent?;
            let path = ent.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
                continue;
            }
            let md = ent.metadata()?;
            if !md.is_file() {
                continue;
            }
            out.push(SegmentFingerprint {
                name: ent.file_name().to_string_lossy().into_owned(),
                len: md.len(),
                mtime_ns: mtime_ns(&md),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn issue(&self, source: &SourceId, segments: Vec<Arc<Segment>>) -> Arc<SegmentSnapshot> {
        self.open_snapshots.fetch_add(1, Ordering::Relaxed);
        Arc::new(SegmentSnapshot {
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
            source: source.clone(),
            segments,
        })
    }
}

impl SnapshotEngine for SegmentDirEngine {
    type Snapshot = SegmentSnapshot;

    fn open(&self, source: &SourceId) -> anyhow::Result<Arc<SegmentSnapshot>> {
        let dir = self.source_dir(source)?;
        let segments = Self::list_segments(&dir)?
            .iter()
            .map(|fp| Segment::open(&dir.join(&fp.name)).map(Arc::new))
            .collect::<anyhow::Result<Vec<_>>>()?;
        tracing::debug!("Opened {} segment(s) for source {}", segments.len(), source);
        Ok(self.issue(source, segments))
    }

    fn reopen(&self, current: &Arc<SegmentSnapshot>) -> anyhow::Result<Arc<SegmentSnapshot>> {
        let dir = self.source_dir(&current.source)?;
        let listed = Self::list_segments(&dir)?;

        let unchanged = listed.len() == current.segments.len()
            && listed
                .iter()
                .zip(&current.segments)
                .all(|(fp, seg)| seg.matches(fp));
        if unchanged {
            return Ok(current.clone());
        }

        // 写时复制：未变化的段直接共享
        let mut segments = Vec::with_capacity(listed.len());
        let mut reused = 0usize;
        for fp in &listed {
            match current.segments.iter().find(|s| s.matches(fp)) {
                Some(seg) => {
                    reused += 1;
                    segments.push(seg.clone());
                }
                None => segments.push(Arc::new(Segment::open(&dir.join(&fp.name))?)),
            }
        }
        tracing::debug!(
            "Reopened source {}: {} segment(s), {} shared with #{}",
            current.source,
            segments.len(),
            reused,
            current.serial
        );
        Ok(self.issue(&current.source, segments))
    }

    fn close(&self, snapshot: &SegmentSnapshot) -> anyhow::Result<()> {
        self.open_snapshots.fetch_sub(1, Ordering::Relaxed);
        tracing::debug!(
            "Released snapshot #{} of source {} ({} segment(s))",
            snapshot.serial,
            snapshot.source,
            snapshot.segments.len()
        );
        Ok(())
    }
}
