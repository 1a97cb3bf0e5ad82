use std::fmt;

use crate::core::SourceId;

/// 池的生命周期状态：`Uninitialized → Ready → ShutDown`
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Uninitialized,
    Ready,
    ShutDown,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolState::Uninitialized => "uninitialized",
            PoolState::Ready => "ready",
            PoolState::ShutDown => "shut down",
        };
        f.write_str(s)
    }
}

/// 池对调用方暴露的可恢复错误。
///
/// 不变量被破坏（计数变负、已释放的 handle 被 retain）不走这里，直接 panic。
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to open snapshot for source `{source_id}`: {cause}")]
    Open {
        source_id: SourceId,
        #[source]
        cause: anyhow::Error,
    },

    #[error("failed to reopen snapshot for source `{source_id}`: {cause}")]
    Reopen {
        source_id: SourceId,
        #[source]
        cause: anyhow::Error,
    },

    #[error("pool is {actual}, operation requires {expected}")]
    InvalidState {
        expected: PoolState,
        actual: PoolState,
    },

    #[error("source `{0}` has been shut down")]
    SourceClosed(SourceId),

    #[error("acquire called with an empty source list")]
    EmptyRequest,
}

impl PoolError {
    /// open/reopen 失败属于外部瞬态错误，重试会重新尝试打开
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Open { .. } | PoolError::Reopen { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_error_carries_source_and_cause() {
        let err = PoolError::Open {
            source_id: SourceId::new("a"),
            cause: anyhow::anyhow!("disk gone"),
        };
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "failed to open snapshot for source `a`: disk gone"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn state_error_is_not_retryable() {
        let err = PoolError::InvalidState {
            expected: PoolState::Ready,
            actual: PoolState::ShutDown,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "pool is shut down, operation requires ready");
    }
}
