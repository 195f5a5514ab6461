use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::core::RecordId;

struct Entry {
    ids: Vec<RecordId>,
    inserted: Instant,
    hits: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// 子孙聚合的 TTL 备忘缓存（DashMap 实现）
///
/// 纯优化：关闭（ttl = 0）时调用方结果必须不变。
pub struct RecordCache {
    inner: DashMap<String, Entry>,
    capacity: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RecordCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: DashMap::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// 命中且未过期直接返回，否则计算并写入
    pub fn get_or_compute<F>(&self, key: &str, compute: F) -> Vec<RecordId>
    where
        F: FnOnce() -> Vec<RecordId>,
    {
        if !self.is_enabled() {
            return compute();
        }

        if let Some(mut e) = self.inner.get_mut(key) {
            if e.inserted.elapsed() < self.ttl {
                e.hits += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return e.ids.clone();
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // 计算期间不持有任何分片锁（compute 可能递归访问缓存）
        let ids = compute();
        self.insert(key, ids.clone());
        ids
    }

    fn insert(&self, key: &str, ids: Vec<RecordId>) {
        if self.inner.len() >= self.capacity && !self.inner.contains_key(key) {
            self.purge_expired();
            if self.inner.len() >= self.capacity {
                // 淘汰命中最少的条目
                let victim = self
                    .inner
                    .iter()
                    .min_by_key(|e| e.value().hits)
                    .map(|e| e.key().clone());
                if let Some(k) = victim {
                    self.inner.remove(&k);
                }
            }
        }
        self.inner.insert(
            key.to_string(),
            Entry {
                ids,
                inserted: Instant::now(),
                hits: 0,
            },
        );
    }

    pub fn purge_expired(&self) -> usize {
        let before = self.inner.len();
        let ttl = self.ttl;
        self.inner.retain(|_, e| e.inserted.elapsed() < ttl);
        before - self.inner.len()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.inner.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
