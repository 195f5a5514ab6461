use std::time::Instant;

use crate::core::{CancelToken, Record, Result, StoreError};
use crate::store::cursor::QuerySpec;
use crate::store::document::DocumentStore;
use crate::store::predicate::Sort;

/// 批量重写：流式读取 → transform → 写入 side collection → 原子替换主集合。
///
/// 失败（transform 出错 / 取消 / 写入被拒）时主集合保持不变，side collection 被丢弃。
pub struct BulkRewriter<'a> {
    docs: &'a DocumentStore,
    collection: String,
    sort: Option<Sort>,
    flush_threshold: usize,
    progress_interval: u64,
    cancel: CancelToken,
}

impl<'a> BulkRewriter<'a> {
    pub fn new(docs: &'a DocumentStore, collection: &str) -> Self {
        Self {
            docs,
            collection: collection.to_string(),
            sort: None,
            flush_threshold: 500,
            progress_interval: 0,
            cancel: CancelToken::new(),
        }
    }

    /// 按指定顺序把记录交给 transform（side collection 也按该顺序写入）
    pub fn sorted(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn flush_threshold(mut self, n: usize) -> Self {
        self.flush_threshold = n.max(1);
        self
    }

    pub fn progress_interval(mut self, n: u64) -> Self {
        self.progress_interval = n;
        self
    }

    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn side_name(&self) -> String {
        format!("{}_temp", self.collection)
    }

    /// 重写并提交；返回处理的记录数
    pub fn rewrite_all<F>(&self, transform: F) -> Result<usize>
    where
        F: FnMut(Record) -> anyhow::Result<Record>,
    {
        self.stage(transform)?.commit()
    }

    /// 只完成暂存，不交换：调用方可在提交前检查 transform 收集到的状态，
    /// 丢弃返回值即放弃本次重写。
    pub fn stage<F>(&self, mut transform: F) -> Result<StagedRewrite<'a>>
    where
        F: FnMut(Record) -> anyhow::Result<Record>,
    {
        if self.docs.collection(&self.collection).is_none() {
            return Err(StoreError::CollectionNotFound(self.collection.clone()));
        }

        let side = self.side_name();
        if self.docs.drop_collection(&side) {
            tracing::warn!("Dropped stale side collection {}", side);
        }
        self.docs.create_collection(&side);

        // 此后任何 `?` 提前返回都会经由 Drop 丢弃 side collection
        let mut staged = StagedRewrite {
            docs: self.docs,
            side,
            primary: self.collection.clone(),
            count: 0,
            committed: false,
        };

        let started = Instant::now();
        let mut spec = QuerySpec::new(&self.collection).cancel(self.cancel.clone());
        if let Some(sort) = &self.sort {
            spec = spec.sort(sort.clone());
        }

        let mut batch: Vec<Record> = Vec::with_capacity(self.flush_threshold);
        for record in self.docs.query(&spec) {
            let record = record?;
            let id = record.id.clone();
            let out = transform(record).map_err(|e| StoreError::Transform {
                id: id.clone(),
                reason: format!("{e:#}"),
            })?;
            if out.id != id {
                return Err(StoreError::Transform {
                    reason: format!("transform changed id to {}", out.id),
                    id,
                });
            }

            batch.push(out);
            staged.count += 1;
            if batch.len() >= self.flush_threshold {
                self.docs.insert_batch(&staged.side, std::mem::take(&mut batch))?;
            }
            if self.progress_interval > 0 && staged.count as u64 % self.progress_interval == 0 {
                tracing::info!(
                    "Rewrite progress: collection={} records={} elapsed={:?}",
                    self.collection,
                    staged.count,
                    started.elapsed()
                );
            }
        }
        if !batch.is_empty() {
            self.docs.insert_batch(&staged.side, batch)?;
        }

        tracing::debug!(
            "Rewrite staged: collection={} records={} elapsed={:?}",
            self.collection,
            staged.count,
            started.elapsed()
        );
        Ok(staged)
    }
}

/// 已暂存、尚未交换的重写结果
pub struct StagedRewrite<'a> {
    docs: &'a DocumentStore,
    side: String,
    primary: String,
    count: usize,
    committed: bool,
}

impl StagedRewrite<'_> {
    pub fn count(&self) -> usize {
        self.count
    }

    /// 原子替换主集合；交换失败是致命的，不重试也不回滚
    pub fn commit(mut self) -> Result<usize> {
        self.committed = true;
        if let Err(e) = self.docs.replace_collection(&self.side, &self.primary) {
            tracing::error!("Rewrite swap failed: collection={} err={}", self.primary, e);
            return Err(e);
        }
        tracing::info!("Rewrite committed: collection={} records={}", self.primary, self.count);
        Ok(self.count)
    }
}

impl Drop for StagedRewrite<'_> {
    fn drop(&mut self) {
        if !self.committed && self.docs.drop_collection(&self.side) {
            tracing::warn!(
                "Rewrite discarded: collection={} staged={}",
                self.primary,
                self.count
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Kind;
    use crate::store::document::PAGES;
    use crate::store::predicate::SortKey;

    fn seeded(n: usize) -> DocumentStore {
        let docs = DocumentStore::new(3);
        let records = (0..n)
            .map(|i| Record::new(format!("p{i}"), Kind::Regular).with_title(format!("t{i}")))
            .collect();
        docs.insert_batch(PAGES, records).unwrap();
        docs
    }

    fn snapshot(docs: &DocumentStore) -> Vec<Record> {
        docs.query(&QuerySpec::new(PAGES)).map(|r| r.unwrap()).collect()
    }

    #[test]
    fn identity_rewrite_preserves_records() {
        let docs = seeded(7);
        let before = snapshot(&docs);
        let n = BulkRewriter::new(&docs, PAGES)
            .flush_threshold(2)
            .rewrite_all(Ok)
            .unwrap();
        assert_eq!(n, 7);
        assert_eq!(snapshot(&docs), before);
        assert!(docs.collection("pages_temp").is_none());
    }

    #[test]
    fn failing_transform_leaves_primary_untouched() {
        let docs = seeded(5);
        let before = snapshot(&docs);
        let err = BulkRewriter::new(&docs, PAGES)
            .flush_threshold(1)
            .rewrite_all(|mut r| {
                if r.id.as_str() == "p3" {
                    anyhow::bail!("boom");
                }
                r.title = "changed".into();
                Ok(r)
            })
            .unwrap_err();

        assert!(matches!(err, StoreError::Transform { ref id, .. } if id.as_str() == "p3"));
        assert_eq!(snapshot(&docs), before);
        assert!(docs.collection("pages_temp").is_none());
    }

    #[test]
    fn changing_id_is_rejected() {
        let docs = seeded(2);
        let err = BulkRewriter::new(&docs, PAGES)
            .rewrite_all(|mut r| {
                r.id = "other".into();
                Ok(r)
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Transform { .. }));
        assert_eq!(docs.len(PAGES), 2);
    }

    #[test]
    fn cancelled_rewrite_discards_side_collection() {
        let docs = seeded(4);
        let token = CancelToken::new();
        let t = token.clone();
        let err = BulkRewriter::new(&docs, PAGES)
            .cancel(token)
            .rewrite_all(move |r| {
                t.cancel();
                Ok(r)
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        assert!(docs.collection("pages_temp").is_none());
        assert_eq!(docs.len(PAGES), 4);
    }

    #[test]
    fn staged_rewrite_dropped_without_commit() {
        let docs = seeded(3);
        let staged = BulkRewriter::new(&docs, PAGES)
            .sorted(Sort::desc(SortKey::Id))
            .stage(|mut r| {
                r.title.clear();
                Ok(r)
            })
            .unwrap();
        assert_eq!(staged.count(), 3);
        assert!(docs.collection("pages_temp").is_some());
        drop(staged);
        assert!(docs.collection("pages_temp").is_none());
        assert_eq!(docs.find_by_id(PAGES, &"p0".into()).unwrap().title, "t0");
    }

    #[test]
    fn sorted_rewrite_writes_in_sort_order() {
        let docs = seeded(3);
        BulkRewriter::new(&docs, PAGES)
            .sorted(Sort::desc(SortKey::Id))
            .rewrite_all(Ok)
            .unwrap();
        let ids: Vec<_> = snapshot(&docs).into_iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec!["p2", "p1", "p0"]);
    }

    #[test]
    fn missing_collection_is_reported() {
        let docs = DocumentStore::new(3);
        assert!(matches!(
            BulkRewriter::new(&docs, PAGES).rewrite_all(Ok),
            Err(StoreError::CollectionNotFound(_))
        ));
    }
}
