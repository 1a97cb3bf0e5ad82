use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::core::SourceId;
use crate::pool::ProviderKind;

/// daemon 配置（TOML）。所有字段都有默认值，缺失的配置文件等价于全默认。
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// 段目录根：`<data_dir>/<source>/*.seg`
    pub data_dir: PathBuf,
    /// 启动时 bootstrap 的 source；为空则扫描 data_dir 下的子目录
    pub sources: Vec<SourceId>,
    pub strategy: ProviderKind,
    pub http_port: u16,
    /// 后台刷新周期（秒）；0 关闭
    pub refresh_interval_secs: u64,
    /// tracing EnvFilter 默认值（RUST_LOG 优先）
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            sources: Vec::new(),
            strategy: ProviderKind::Shared,
            http_port: 6070,
            refresh_interval_secs: 5,
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("snap-pool").join("config.toml"))
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// 读取配置；文件不存在时回退默认值
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("Config {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text).map_err(|e| anyhow::anyhow!("invalid config {:?}: {}", path, e))
    }
}
