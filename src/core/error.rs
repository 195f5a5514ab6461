use crate::core::record::RecordId;
use std::time::Duration;

/// 存储层错误
///
/// NotFound 不是错误：点查未命中返回 `None`。
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// 后端初始化/打开失败（启动时致命，不重试）
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// 层级不变量被破坏；携带全部出错 ID，而不只是第一个
    #[error("integrity violation during {pass}: {} offending record(s): {}", .ids.len(), join_ids(.ids))]
    IntegrityViolation {
        pass: &'static str,
        ids: Vec<RecordId>,
    },

    #[error("no home record found")]
    MissingHome,

    /// 整批拒绝；调用方不得假设部分成功
    #[error("batch rejected: {reason}: {}", join_ids(.ids))]
    BatchRejected { reason: String, ids: Vec<RecordId> },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    /// 批量重写的交换步骤失败（不自动重试/回滚）
    #[error("collection swap failed: {0}")]
    SwapFailed(String),

    #[error("transform failed for {id}: {reason}")]
    Transform { id: RecordId, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl StoreError {
    pub fn integrity(pass: &'static str, mut ids: Vec<RecordId>) -> Self {
        ids.sort();
        ids.dedup();
        StoreError::IntegrityViolation { pass, ids }
    }

    /// 出错的记录 ID（仅对携带 ID 的变体有意义）
    pub fn offending_ids(&self) -> &[RecordId] {
        match self {
            StoreError::IntegrityViolation { ids, .. } => ids,
            StoreError::BatchRejected { ids, .. } => ids,
            StoreError::Transform { id, .. } => std::slice::from_ref(id),
            _ => &[],
        }
    }
}

fn join_ids(ids: &[RecordId]) -> String {
    const SHOWN: usize = 20;
    let mut out = ids
        .iter()
        .take(SHOWN)
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    if ids.len() > SHOWN {
        out.push_str(&format!(", ... (+{})", ids.len() - SHOWN));
    }
    out
}

pub type Result<T> = std::result::Result<T, StoreError>;
