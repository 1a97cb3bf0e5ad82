use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// 数据源标识（一个分段存储目录 / 一个逻辑索引）。
///
/// 内部用 `Arc<str>`：tracker 表、handle、统计都会持有一份，clone 只是引用计数。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct SourceId(Arc<str>);

impl SourceId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 解析逗号分隔的 source 列表（保序，忽略空项）
    pub fn parse_list(s: &str) -> Vec<SourceId> {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(SourceId::new)
            .collect()
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<SourceId> for String {
    fn from(id: SourceId) -> Self {
        id.0.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_keeps_order_and_skips_blanks() {
        let ids = SourceId::parse_list(" b, a ,,c ");
        let names: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn serde_as_plain_string() {
        let id = SourceId::new("orders");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"orders\"");
        let back: SourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
