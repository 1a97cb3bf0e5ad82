use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::PoolState;

/// 池内部累计计数器（原子，热路径只做 Relaxed 自增）
#[derive(Debug, Default)]
pub struct PoolCounters {
    pub opens: AtomicU64,
    pub reopens: AtomicU64,
    pub reopen_reused: AtomicU64,
    pub generations_published: AtomicU64,
    /// 并发 reopen 竞争失败后被丢弃的快照
    pub redundant_reopens: AtomicU64,
    pub closes: AtomicU64,
    pub close_failures: AtomicU64,
    pub forced_closes: AtomicU64,
    pub acquisitions: AtomicU64,
    pub releases: AtomicU64,
}

impl PoolCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// 单个 source 的当前代信息
#[derive(Clone, Debug, Default, Serialize)]
pub struct SourceStats {
    pub source: String,
    /// 当前 handle 的代号；tracker 尚未打开或已关闭时为 None
    pub generation: Option<u64>,
    /// 当前 handle 的引用计数（含 tracker 自己那一份）
    pub refs: Option<isize>,
}

/// 池统计快照（诊断用，不参与任何正确性判断）
#[derive(Clone, Debug, Serialize)]
pub struct PoolStats {
    pub strategy: &'static str,
    pub state: PoolState,
    pub sources: Vec<SourceStats>,
    /// 注册表中仍存活的 handle 数（含已被取代但仍有调用方持有的旧代）
    pub live_handles: usize,
    /// 所有存活 handle 的引用计数之和
    pub outstanding_tokens: isize,
    pub opens: u64,
    pub reopens: u64,
    pub reopen_reused: u64,
    pub generations_published: u64,
    pub redundant_reopens: u64,
    pub closes: u64,
    pub close_failures: u64,
    pub forced_closes: u64,
    pub acquisitions: u64,
    pub releases: u64,
}

impl PoolStats {
    pub fn new(
        strategy: &'static str,
        state: PoolState,
        counters: &PoolCounters,
        sources: Vec<SourceStats>,
        live_handles: usize,
        outstanding_tokens: isize,
    ) -> Self {
        Self {
            strategy,
            state,
            sources,
            live_handles,
            outstanding_tokens,
            opens: PoolCounters::get(&counters.opens),
            reopens: PoolCounters::get(&counters.reopens),
            reopen_reused: PoolCounters::get(&counters.reopen_reused),
            generations_published: PoolCounters::get(&counters.generations_published),
            redundant_reopens: PoolCounters::get(&counters.redundant_reopens),
            closes: PoolCounters::get(&counters.closes),
            close_failures: PoolCounters::get(&counters.close_failures),
            forced_closes: PoolCounters::get(&counters.forced_closes),
            acquisitions: PoolCounters::get(&counters.acquisitions),
            releases: PoolCounters::get(&counters.releases),
        }
    }

    /// reopen 命中率（返回同一快照的比例）
    pub fn reuse_ratio(&self) -> f64 {
        if self.reopens == 0 {
            return 0.0;
        }
        self.reopen_reused as f64 / self.reopens as f64
    }
}

/// 池关闭时的汇总
#[derive(Clone, Debug, Default, Serialize)]
pub struct ShutdownReport {
    /// 释放的 tracker "current" 令牌数
    pub trackers_released: usize,
    /// 关闭时仍被调用方持有、被强制关闭的 handle 数
    pub forced_closed: usize,
    /// 被强制关闭的 handle 上未归还的令牌总数
    pub outstanding_tokens: isize,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.forced_closed == 0
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           snap-pool Report                       ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║ strategy: {:>14}   state: {:>14} ║", self.strategy, self.state.to_string())?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Handles:                                         ║")?;
        writeln!(f, "║   live:         {:>10}                       ║", self.live_handles)?;
        writeln!(f, "║   tokens:       {:>10}                       ║", self.outstanding_tokens)?;
        writeln!(f, "║   acquired:     {:>10}                       ║", self.acquisitions)?;
        writeln!(f, "║   released:     {:>10}                       ║", self.releases)?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Snapshots:                                       ║")?;
        writeln!(f, "║   opens:        {:>10}                       ║", self.opens)?;
        writeln!(
            f,
            "║   reopens:      {:>10}  (reused {:>5.1}%)      ║",
            self.reopens,
            self.reuse_ratio() * 100.0
        )?;
        writeln!(f, "║   generations:  {:>10}                       ║", self.generations_published)?;
        writeln!(f, "║   redundant:    {:>10}                       ║", self.redundant_reopens)?;
        writeln!(f, "║   closes:       {:>10}                       ║", self.closes)?;
        writeln!(f, "║   close errors: {:>10}                       ║", self.close_failures)?;
        writeln!(f, "║   forced:       {:>10}                       ║", self.forced_closes)?;
        if !self.sources.is_empty() {
            writeln!(f, "╠──────────────────────────────────────────────────╣")?;
            writeln!(f, "║ Sources:                                         ║")?;
            for s in &self.sources {
                let gen = s.generation.map(|g| g.to_string()).unwrap_or_else(|| "-".into());
                let refs = s.refs.map(|r| r.to_string()).unwrap_or_else(|| "-".into());
                writeln!(f, "║   {:<20} gen {:>6}  refs {:>6}     ║", s.source, gen, refs)?;
            }
        }
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}
