use std::collections::VecDeque;
use std::sync::Arc;

use crate::core::{CancelToken, Record, Result};
use crate::store::document::SharedCollection;
use crate::store::predicate::{self, Predicate, Sort};

/// 查询描述：可 clone，重新 `query()` 即为“重启”（游标本身不可恢复）
#[derive(Clone)]
pub struct QuerySpec {
    pub collection: String,
    pub predicate: Arc<dyn Predicate>,
    pub sort: Option<Sort>,
    pub batch_size: Option<usize>,
    pub cancel: CancelToken,
}

impl QuerySpec {
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            predicate: predicate::all(),
            sort: None,
            batch_size: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn filter(mut self, p: impl Predicate + 'static) -> Self {
        self.predicate = Arc::new(p);
        self
    }

    pub fn filter_arc(mut self, p: Arc<dyn Predicate>) -> Self {
        self.predicate = p;
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = Some(n.max(1));
        self
    }

    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }
}

/// 惰性流式游标：每次按 batch_size 从集合里拷出一页，读锁只在取页时持有。
///
/// 游标持有创建时集合的 Arc：批量重写交换集合后，旧游标继续读旧数据，不会看到半成品。
pub struct RecordCursor {
    source: Option<SharedCollection>,
    predicate: Arc<dyn Predicate>,
    /// 排序查询：创建时算好的位置序列（已过滤）
    order: Option<Vec<usize>>,
    next: usize,
    batch_size: usize,
    buffer: VecDeque<Record>,
    cancel: CancelToken,
    exhausted: bool,
    pages_fetched: u64,
}

impl RecordCursor {
    pub(crate) fn open(source: Option<SharedCollection>, spec: &QuerySpec, default_batch: usize) -> Self {
        let order = match (&source, &spec.sort) {
            (Some(src), Some(sort)) => {
                let coll = src.read();
                let records = coll.records();
                let mut positions: Vec<usize> = records
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| spec.predicate.matches(r))
                    .map(|(i, _)| i)
                    .collect();
                // 稳定排序：相等键保持插入顺序
                positions.sort_by(|&a, &b| sort.compare(&records[a], &records[b]));
                Some(positions)
            }
            _ => None,
        };

        Self {
            exhausted: source.is_none(),
            source,
            predicate: spec.predicate.clone(),
            order,
            next: 0,
            batch_size: spec.batch_size.unwrap_or(default_batch).max(1),
            buffer: VecDeque::new(),
            cancel: spec.cancel.clone(),
            pages_fetched: 0,
        }
    }

    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched
    }

    fn fill(&mut self) {
        let Some(src) = self.source.as_ref() else {
            self.exhausted = true;
            return;
        };
        let coll = src.read();
        let records = coll.records();

        match &self.order {
            Some(order) => {
                while self.buffer.len() < self.batch_size && self.next < order.len() {
                    if let Some(r) = records.get(order[self.next]) {
                        self.buffer.push_back(r.clone());
                    }
                    self.next += 1;
                }
                if self.next >= order.len() {
                    self.exhausted = true;
                }
            }
            None => {
                while self.buffer.len() < self.batch_size && self.next < records.len() {
                    let r = &records[self.next];
                    self.next += 1;
                    if self.predicate.matches(r) {
                        self.buffer.push_back(r.clone());
                    }
                }
                if self.next >= records.len() {
                    self.exhausted = true;
                }
            }
        }
        self.pages_fetched += 1;
    }
}

impl Iterator for RecordCursor {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && self.exhausted {
            return None;
        }
        if let Err(e) = self.cancel.check() {
            self.exhausted = true;
            self.buffer.clear();
            return Some(Err(e));
        }
        if self.buffer.is_empty() {
            self.fill();
        }
        self.buffer.pop_front().map(Ok)
    }
}
