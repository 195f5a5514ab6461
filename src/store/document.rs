use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::core::{normalize_segment, valid_segment, Kind, Record, RecordId, Result, StoreError};
use crate::store::cursor::{QuerySpec, RecordCursor};
use crate::store::predicate::Predicate;

/// 主集合
pub const PAGES: &str = "pages";
pub const RAW_PAGES: &str = "raw_pages";
pub const HEADLESS_PAGES: &str = "headless_pages";

/// 单个集合：插入顺序向量 + id→位置索引（删除时重建位置）
#[derive(Debug, Default)]
pub struct Collection {
    records: Vec<Record>,
    positions: HashMap<RecordId, usize>,
}

impl Collection {
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.positions.get(id).and_then(|&i| self.records.get(i))
    }

    fn get_mut(&mut self, id: &RecordId) -> Option<&mut Record> {
        let i = *self.positions.get(id)?;
        self.records.get_mut(i)
    }

    fn push(&mut self, record: Record) {
        self.positions.insert(record.id.clone(), self.records.len());
        self.records.push(record);
    }
}

pub type SharedCollection = Arc<RwLock<Collection>>;

/// 主键文档存储：命名集合 → 集合
///
/// 单写者假设：`update_by_id` 是读-改-写，对同一 id 的并发写者不原子。
pub struct DocumentStore {
    collections: DashMap<String, SharedCollection>,
    batch_size: usize,
}

impl DocumentStore {
    pub fn new(batch_size: usize) -> Self {
        Self {
            collections: DashMap::new(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// 取集合句柄（立刻释放 DashMap 分片锁）
    pub fn collection(&self, name: &str) -> Option<SharedCollection> {
        self.collections.get(name).map(|c| c.value().clone())
    }

    fn collection_or_create(&self, name: &str) -> SharedCollection {
        self.collections
            .entry(name.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// 新建空集合；已存在则返回 false
    pub fn create_collection(&self, name: &str) -> bool {
        let mut created = false;
        self.collections.entry(name.to_string()).or_insert_with(|| {
            created = true;
            SharedCollection::default()
        });
        created
    }

    pub fn drop_collection(&self, name: &str) -> bool {
        self.collections.remove(name).is_some()
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// 批量插入：整批要么全部写入，要么全部拒绝（任何一条不合法都拒绝整批）。
    ///
    /// 路径段在写入前统一为 NFC。
    pub fn insert_batch(&self, collection: &str, mut records: Vec<Record>) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        for r in records.iter_mut() {
            for s in r.sections.iter_mut() {
                *s = normalize_segment(s);
            }
        }

        let target = self.collection_or_create(collection);
        let mut coll = target.write();

        // 校验与写入在同一把写锁内，避免校验后被插入重复 id
        validate_batch(&coll, collection, &records)?;

        let n = records.len();
        for r in records {
            coll.push(r);
        }
        Ok(n)
    }

    /// 只校验不写入：与 `insert_batch` 相同的拒绝规则
    pub fn check_batch(&self, collection: &str, records: &[Record]) -> Result<()> {
        match self.collection(collection) {
            Some(coll) => validate_batch(&coll.read(), collection, records),
            None => validate_batch(&Collection::default(), collection, records),
        }
    }

    pub fn find_by_id(&self, collection: &str, id: &RecordId) -> Option<Record> {
        let coll = self.collection(collection)?;
        let guard = coll.read();
        guard.get(id).cloned()
    }

    /// 批量点查；结果按集合内顺序返回，不保证与输入一致，缺失的 id 直接跳过
    pub fn find_many(&self, collection: &str, ids: &[RecordId]) -> Vec<Record> {
        let Some(coll) = self.collection(collection) else {
            return Vec::new();
        };
        let guard = coll.read();
        let mut positions: Vec<usize> = ids
            .iter()
            .filter_map(|id| guard.positions.get(id).copied())
            .collect();
        positions.sort_unstable();
        positions.dedup();
        positions
            .into_iter()
            .filter_map(|i| guard.records.get(i).cloned())
            .collect()
    }

    pub fn exists(&self, collection: &str, id: &RecordId) -> bool {
        self.collection(collection)
            .map(|c| c.read().get(id).is_some())
            .unwrap_or(false)
    }

    /// 流式查询；集合不存在时返回空游标
    pub fn query(&self, spec: &QuerySpec) -> RecordCursor {
        RecordCursor::open(self.collection(&spec.collection), spec, self.batch_size)
    }

    /// 只取 ID（保持查询排序）
    pub fn find_ids(&self, spec: &QuerySpec) -> Result<Vec<RecordId>> {
        self.query(spec).map(|r| r.map(|r| r.id)).collect()
    }

    /// 读-改-写单条记录；id 不存在返回 false。mutator 不得修改 id。
    pub fn update_by_id<F>(&self, collection: &str, id: &RecordId, mutator: F) -> bool
    where
        F: FnOnce(&mut Record),
    {
        let Some(coll) = self.collection(collection) else {
            return false;
        };
        let mut guard = coll.write();
        let Some(record) = guard.get_mut(id) else {
            return false;
        };
        mutator(record);
        if &record.id != id {
            tracing::warn!("update_by_id: mutator changed id {} -> {}, restoring", id, record.id);
            record.id = id.clone();
        }
        true
    }

    pub fn count(&self, collection: &str, predicate: &dyn Predicate) -> usize {
        self.collection(collection)
            .map(|c| c.read().records.iter().filter(|r| predicate.matches(r)).count())
            .unwrap_or(0)
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collection(collection).map(|c| c.read().len()).unwrap_or(0)
    }

    /// 按 id 删除；返回实际删除条数
    pub fn remove_many(&self, collection: &str, ids: &[RecordId]) -> usize {
        let Some(coll) = self.collection(collection) else {
            return 0;
        };
        let doomed: HashSet<&RecordId> = ids.iter().collect();
        let mut guard = coll.write();
        let before = guard.records.len();
        guard.records.retain(|r| !doomed.contains(&r.id));
        let removed = before - guard.records.len();
        if removed > 0 {
            let positions = guard
                .records
                .iter()
                .enumerate()
                .map(|(i, r)| (r.id.clone(), i))
                .collect();
            guard.positions = positions;
        }
        removed
    }

    /// 用 side 集合整体替换 primary：删除旧名 + 重命名 side，对读者是一次原子切换。
    pub fn replace_collection(&self, side: &str, primary: &str) -> Result<()> {
        if side == primary {
            return Err(StoreError::SwapFailed(format!(
                "side and primary are the same collection: {}",
                primary
            )));
        }
        let Some((_, staged)) = self.collections.remove(side) else {
            return Err(StoreError::SwapFailed(format!("side collection {} missing", side)));
        };
        self.collections.insert(primary.to_string(), staged);
        Ok(())
    }

    /// 导出全部集合（快照用）
    pub fn export(&self) -> Vec<(String, Vec<Record>)> {
        self.collection_names()
            .into_iter()
            .filter_map(|name| {
                let coll = self.collection(&name)?;
                let records = coll.read().records.clone();
                Some((name, records))
            })
            .collect()
    }

    /// 从快照恢复一个集合（整体替换）；重复 id 只保留第一条
    pub fn restore(&self, collection: &str, records: Vec<Record>) -> usize {
        let mut coll = Collection::default();
        for r in records {
            if coll.get(&r.id).is_some() {
                tracing::warn!("Restore {}: duplicate id {}, skipping", collection, r.id);
                continue;
            }
            coll.push(r);
        }
        let n = coll.len();
        self.collections
            .insert(collection.to_string(), Arc::new(RwLock::new(coll)));
        n
    }

    pub fn clear(&self) {
        self.collections.clear();
    }
}

fn validate_batch(coll: &Collection, collection: &str, records: &[Record]) -> Result<()> {
    let mut rejected: Vec<(RecordId, &'static str)> = Vec::new();
    let mut seen: HashSet<&RecordId> = HashSet::with_capacity(records.len());
    for r in records {
        if let Some(reason) = malformed_reason(r) {
            rejected.push((r.id.clone(), reason));
        } else if !seen.insert(&r.id) {
            rejected.push((r.id.clone(), "duplicate id in batch"));
        } else if coll.get(&r.id).is_some() {
            rejected.push((r.id.clone(), "id already exists"));
        }
    }
    if rejected.is_empty() {
        return Ok(());
    }
    let reason = format!(
        "{} malformed record(s) in {} (first: {})",
        rejected.len(),
        collection,
        rejected[0].1
    );
    tracing::warn!("Insert batch rejected: {}", reason);
    Err(StoreError::BatchRejected {
        reason,
        ids: rejected.into_iter().map(|(id, _)| id).collect(),
    })
}

fn malformed_reason(r: &Record) -> Option<&'static str> {
    if r.id.is_empty() {
        return Some("empty id");
    }
    if !r.sections.iter().all(|s| valid_segment(s)) {
        return Some("invalid section segment");
    }
    if r.kind == Kind::Home && !r.sections.is_empty() {
        return Some("home record with section path");
    }
    if r.kind == Kind::Section && r.sections.is_empty() {
        return Some("section record without path");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CancelToken;
    use crate::store::predicate::{KindIn, Sort, SortKey};

    fn page(id: &str, sections: &[&str]) -> Record {
        Record::new(id, Kind::Regular).with_sections(sections)
    }

    #[test]
    fn insert_then_find_returns_identical_record() {
        let store = DocumentStore::new(2);
        let r = page("p1", &["blog"]).with_title("Hello");
        store.insert_batch(PAGES, vec![r.clone()]).unwrap();
        assert_eq!(store.find_by_id(PAGES, &r.id), Some(r));
        assert_eq!(store.find_by_id(PAGES, &RecordId::from("nope")), None);
    }

    #[test]
    fn malformed_record_rejects_whole_batch() {
        let store = DocumentStore::new(10);
        let err = store
            .insert_batch(
                PAGES,
                vec![page("ok", &["a"]), page("bad", &["a/b"]), page("", &[])],
            )
            .unwrap_err();
        match err {
            StoreError::BatchRejected { ids, .. } => assert_eq!(ids.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.len(PAGES), 0);
    }

    #[test]
    fn duplicate_against_existing_rejected() {
        let store = DocumentStore::new(10);
        store.insert_batch(PAGES, vec![page("p1", &[])]).unwrap();
        assert!(store.insert_batch(PAGES, vec![page("p2", &[]), page("p1", &[])]).is_err());
        assert_eq!(store.len(PAGES), 1);
    }

    #[test]
    fn query_streams_in_pages_and_restarts() {
        let store = DocumentStore::new(2);
        let records: Vec<Record> = (0..5).map(|i| page(&format!("p{i}"), &[])).collect();
        store.insert_batch(PAGES, records).unwrap();

        let spec = QuerySpec::new(PAGES);
        let mut cur = store.query(&spec);
        let ids: Vec<String> = cur.by_ref().map(|r| r.unwrap().id.0).collect();
        assert_eq!(ids, vec!["p0", "p1", "p2", "p3", "p4"]);
        assert_eq!(cur.pages_fetched(), 3);

        // 重启 = 重新发起查询
        assert_eq!(store.query(&spec).count(), 5);
    }

    #[test]
    fn sorted_query_is_stable() {
        let store = DocumentStore::new(10);
        let mut a = page("a", &[]);
        a.storage_path = "x".into();
        let mut b = page("b", &[]);
        b.storage_path = "a".into();
        let mut c = page("c", &[]);
        c.storage_path = "a".into();
        store.insert_batch(PAGES, vec![a, b, c]).unwrap();

        let spec = QuerySpec::new(PAGES).sort(Sort::asc(SortKey::StoragePath));
        let ids = store.find_ids(&spec).unwrap();
        assert_eq!(ids, vec![RecordId::from("b"), RecordId::from("c"), RecordId::from("a")]);
    }

    #[test]
    fn cancelled_query_reports_error() {
        let store = DocumentStore::new(1);
        store.insert_batch(PAGES, vec![page("a", &[]), page("b", &[])]).unwrap();
        let token = CancelToken::new();
        let mut cur = store.query(&QuerySpec::new(PAGES).cancel(token.clone()));
        assert!(cur.next().unwrap().is_ok());
        token.cancel();
        assert!(matches!(cur.next(), Some(Err(StoreError::Cancelled))));
        assert!(cur.next().is_none());
    }

    #[test]
    fn update_count_and_find_many() {
        let store = DocumentStore::new(10);
        store
            .insert_batch(
                PAGES,
                vec![page("a", &[]), page("b", &[]), Record::new("s", Kind::Section).with_sections(&["x"])],
            )
            .unwrap();
        assert!(store.update_by_id(PAGES, &"a".into(), |r| r.title = "T".into()));
        assert!(!store.update_by_id(PAGES, &"zz".into(), |_| {}));
        assert_eq!(store.find_by_id(PAGES, &"a".into()).unwrap().title, "T");
        assert_eq!(store.count(PAGES, &KindIn::one(Kind::Regular)), 2);

        let many = store.find_many(PAGES, &["s".into(), "missing".into(), "a".into()]);
        assert_eq!(many.len(), 2);
    }

    #[test]
    fn remove_many_keeps_positions_consistent() {
        let store = DocumentStore::new(10);
        store
            .insert_batch(PAGES, vec![page("a", &[]), page("b", &[]), page("c", &[])])
            .unwrap();
        assert_eq!(store.remove_many(PAGES, &["a".into(), "zz".into()]), 1);
        assert!(!store.exists(PAGES, &"a".into()));
        assert!(store.update_by_id(PAGES, &"c".into(), |r| r.title = "C".into()));
        assert_eq!(store.find_by_id(PAGES, &"c".into()).unwrap().title, "C");
        assert_eq!(store.find_by_id(PAGES, &"b".into()).unwrap().title, "");
        assert_eq!(store.remove_many("nope", &["b".into()]), 0);
    }

    #[test]
    fn check_batch_matches_insert_rules() {
        let store = DocumentStore::new(10);
        assert!(store.check_batch(PAGES, &[page("a", &["x"])]).is_ok());
        store.insert_batch(PAGES, vec![page("a", &[])]).unwrap();
        assert!(store.check_batch(PAGES, &[page("a", &[])]).is_err());
        assert!(store.check_batch(PAGES, &[page("b", &[""])]).is_err());
        assert_eq!(store.len(PAGES), 1);
    }

    #[test]
    fn replace_collection_swaps_atomically() {
        let store = DocumentStore::new(10);
        store.insert_batch(PAGES, vec![page("old", &[])]).unwrap();
        let before = store.query(&QuerySpec::new(PAGES));

        store.insert_batch("pages_temp", vec![page("new", &[])]).unwrap();
        store.replace_collection("pages_temp", PAGES).unwrap();

        assert!(store.exists(PAGES, &"new".into()));
        assert!(!store.exists(PAGES, &"old".into()));
        assert!(store.collection("pages_temp").is_none());
        // 交换前打开的游标仍读旧集合
        let ids: Vec<_> = before.map(|r| r.unwrap().id.0).collect();
        assert_eq!(ids, vec!["old"]);

        assert!(matches!(
            store.replace_collection("pages_temp", PAGES),
            Err(StoreError::SwapFailed(_))
        ));
    }
}
