use crate::core::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 存储配置（由外部 TOML 提供，核心只消费）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// 持久化目录；None 表示纯内存
    pub data_dir: Option<PathBuf>,
    /// 待写缓冲的自动 flush 阈值；也是 rewrite 写 side collection 的批大小
    pub flush_threshold: usize,
    /// 流式游标每页记录数
    pub batch_size: usize,
    /// RecordCache 条目存活时间（秒），0 表示关闭缓存
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    /// 每处理 N 条记录打一次进度日志，0 关闭
    pub progress_report_interval: u64,
    /// 子孙聚合超过该耗时（毫秒）打 warn
    pub slow_aggregate_ms: u64,
    /// 打开时清空所有持久化状态
    pub reset_on_open: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            flush_threshold: 500,
            batch_size: 500,
            cache_ttl_secs: 5 * 60 * 60,
            cache_capacity: 10_000,
            progress_report_interval: 0,
            slow_aggregate_ms: 500,
            reset_on_open: false,
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: StoreConfig = toml::from_str(s).map_err(|e| StoreError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&s)
    }

    pub fn validate(&self) -> Result<()> {
        if self.flush_threshold == 0 {
            return Err(StoreError::Config("flush_threshold must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(StoreError::Config("batch_size must be > 0".into()));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn slow_aggregate(&self) -> Duration {
        Duration::from_millis(self.slow_aggregate_ms)
    }
}
