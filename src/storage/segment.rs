use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

/// 只读映射的不可变段文件。
///
/// 快照之间以 `Arc<Segment>` 共享未变化的段；最后一个持有者 drop 时才解除映射。
pub struct Segment {
    name: String,
    len: u64,
    mtime_ns: u64,
    map: Option<Mmap>,
}

impl Segment {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path)?;
        let md = file.metadata()?;
        let len = md.len();
        // 空文件无法 mmap
        let map = if len == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&file)? })
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            name,
            len,
            mtime_ns: mtime_ns(&md),
            map,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    /// 目录扫描得到的指纹与本段一致（名字 + 长度 + mtime）
    pub fn matches(&self, fp: &SegmentFingerprint) -> bool {
        self.name == fp.name && self.len == fp.len && self.mtime_ns == fp.mtime_ns
    }
}

/// 不打开文件、只 stat 得到的段指纹
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentFingerprint {
    pub name: String,
    pub len: u64,
    pub mtime_ns: u64,
}

pub fn mtime_ns(md: &std::fs::Metadata) -> u64 {
    use std::time::UNIX_EPOCH;
    md.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
