use std::collections::HashMap;

use parking_lot::Mutex;

use crate::core::{Record, Result};

/// 有界待写缓冲：按集合攒批，达到阈值自动 flush。
///
/// 追加与 flush 都在同一把锁内完成，因此同一时刻最多只有一个 flush 在执行。
pub struct PendingWrites {
    threshold: usize,
    buffer: Mutex<HashMap<String, Vec<Record>>>,
}

impl PendingWrites {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            buffer: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// 入队；达到阈值时在锁内调用 `sink` 写出该集合的整批，返回写出的条数（未触发为 0）。
    ///
    /// `sink` 失败时整批丢弃（与 InsertBatch 的整批拒绝语义一致），错误原样返回。
    pub fn enqueue<F>(&self, collection: &str, record: Record, sink: F) -> Result<usize>
    where
        F: FnOnce(&str, Vec<Record>) -> Result<usize>,
    {
        let mut buffer = self.buffer.lock();
        let queue = buffer.entry(collection.to_string()).or_default();
        queue.push(record);
        if queue.len() < self.threshold {
            return Ok(0);
        }
        let batch = std::mem::take(queue);
        tracing::debug!("Pending buffer full: collection={} records={}", collection, batch.len());
        sink(collection, batch)
    }

    /// 写出所有集合的剩余记录；遇到第一个失败即返回（其余集合保持在缓冲中）
    pub fn flush<F>(&self, mut sink: F) -> Result<usize>
    where
        F: FnMut(&str, Vec<Record>) -> Result<usize>,
    {
        let mut buffer = self.buffer.lock();
        let mut names: Vec<String> = buffer
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();

        let mut written = 0;
        for name in names {
            let batch = buffer.remove(&name).unwrap_or_default();
            written += sink(&name, batch)?;
        }
        Ok(written)
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
