use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::core::{Record, RecordId, Result, StoreError};
use crate::storage::wal::{KvOp, WalStore};

/// 邻接键：`<id>:children`
pub fn children_key(id: &RecordId) -> String {
    format!("{}:children", id)
}

/// 邻接键：`<id>:subsections`
pub fn subsections_key(id: &RecordId) -> String {
    format!("{}:subsections", id)
}

/// 轻量 KV 索引：保存与主文档解耦的邻接 id 列表（JSON 数组）与 LitePage 投影。
///
/// 每次 `set` 先写 WAL（若已挂载）再更新内存；整值覆盖，无 merge 语义。
pub struct KeyValueIndex {
    entries: DashMap<String, String>,
    wal: Option<Arc<WalStore>>,
    corrupt: AtomicU64,
}

impl Default for KeyValueIndex {
    fn default() -> Self {
        Self::new(None)
    }
}

impl KeyValueIndex {
    pub fn new(wal: Option<Arc<WalStore>>) -> Self {
        Self {
            entries: DashMap::new(),
            wal,
            corrupt: AtomicU64::new(0),
        }
    }

    pub fn wal(&self) -> Option<&Arc<WalStore>> {
        self.wal.as_ref()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    pub fn set(&self, key: &str, value: String) -> Result<()> {
        if let Some(wal) = &self.wal {
            let op = KvOp {
                key: key.to_string(),
                value: value.clone(),
            };
            wal.append(std::slice::from_ref(&op))
                .map_err(|e| StoreError::Unavailable(format!("kv wal append: {e:#}")))?;
        }
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    /// 结果与 keys 一一对齐；从未写过的键在对应位置为 None
    pub fn multi_get<S: AsRef<str>>(&self, keys: &[S]) -> Vec<Option<String>> {
        keys.iter().map(|k| self.get(k.as_ref())).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 读取时发现的损坏条目累计数
    pub fn corrupt_entries(&self) -> u64 {
        self.corrupt.load(Ordering::Relaxed)
    }

    pub(crate) fn note_corrupt(&self, key: &str, err: &dyn std::fmt::Display) {
        self.corrupt.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("Corrupt KV entry treated as empty: key={} err={}", key, err);
    }

    // ---- id 列表 ----

    /// 读 id 列表；缺失为空，损坏记一次并按空处理
    pub fn get_id_list(&self, key: &str) -> Vec<RecordId> {
        let Some(raw) = self.get(key) else {
            return Vec::new();
        };
        match serde_json::from_str::<Vec<RecordId>>(&raw) {
            Ok(ids) => ids,
            Err(e) => {
                self.note_corrupt(key, &e);
                Vec::new()
            }
        }
    }

    pub fn set_id_list(&self, key: &str, ids: &[RecordId]) -> Result<()> {
        self.set(key, serde_json::to_string(ids)?)
    }

    pub fn children(&self, id: &RecordId) -> Vec<RecordId> {
        self.get_id_list(&children_key(id))
    }

    pub fn subsections(&self, id: &RecordId) -> Vec<RecordId> {
        self.get_id_list(&subsections_key(id))
    }

    pub fn set_children(&self, id: &RecordId, ids: &[RecordId]) -> Result<()> {
        self.set_id_list(&children_key(id), ids)
    }

    pub fn set_subsections(&self, id: &RecordId, ids: &[RecordId]) -> Result<()> {
        self.set_id_list(&subsections_key(id), ids)
    }

    /// 读-改-写追加子 section；非原子，只在单写者下安全
    pub fn append_subsection(&self, parent: &RecordId, child: &RecordId) -> Result<()> {
        let key = subsections_key(parent);
        let mut ids = self.get_id_list(&key);
        ids.push(child.clone());
        self.set_id_list(&key, &ids)
    }

    /// 把邻接边从 KV 装回记录
    pub fn hydrate(&self, record: &mut Record) {
        record.page_ids = self.children(&record.id);
        record.subsection_ids = self.subsections(&record.id);
    }

    /// 持久化记录携带的邻接边（空列表不写）
    pub fn store_adjacency(
        &self,
        id: &RecordId,
        page_ids: &[RecordId],
        subsection_ids: &[RecordId],
    ) -> Result<()> {
        if !page_ids.is_empty() {
            self.set_children(id, page_ids)?;
        }
        if !subsection_ids.is_empty() {
            self.set_subsections(id, subsection_ids)?;
        }
        Ok(())
    }

    // ---- 快照 / 回放 ----

    pub fn export(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort();
        out
    }

    /// 从镜像恢复（不写 WAL）
    pub fn restore(&self, entries: Vec<(String, String)>) {
        self.entries.clear();
        for (k, v) in entries {
            self.entries.insert(k, v);
        }
    }

    /// 回放 WAL 操作（不再写回 WAL）
    pub fn apply(&self, ops: Vec<KvOp>) -> usize {
        let n = ops.len();
        for op in ops {
            self.entries.insert(op.key, op.value);
        }
        n
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Kind;
    use std::path::PathBuf;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("pagestore-kv-{}-{}", tag, nanos))
    }

    fn ids(v: &[&str]) -> Vec<RecordId> {
        v.iter().map(|s| RecordId::from(*s)).collect()
    }

    #[test]
    fn multi_get_aligns_missing_keys() {
        let kv = KeyValueIndex::default();
        kv.set("a", "1".into()).unwrap();
        kv.set("c", "3".into()).unwrap();
        let got = kv.multi_get(&["a", "never-set", "c"]);
        assert_eq!(got, vec![Some("1".into()), None, Some("3".into())]);
    }

    #[test]
    fn adjacency_roundtrip_and_append() {
        let kv = KeyValueIndex::default();
        let s = RecordId::from("s1");
        kv.set_children(&s, &ids(&["p1", "p2"])).unwrap();
        kv.append_subsection(&s, &"s2".into()).unwrap();
        kv.append_subsection(&s, &"s3".into()).unwrap();

        assert_eq!(kv.get("s1:children").unwrap(), "[\"p1\",\"p2\"]");
        let mut r = Record::new("s1", Kind::Section).with_sections(&["a"]);
        kv.hydrate(&mut r);
        assert_eq!(r.page_ids, ids(&["p1", "p2"]));
        assert_eq!(r.subsection_ids, ids(&["s2", "s3"]));
    }

    #[test]
    fn corrupt_list_reads_as_empty_and_is_counted() {
        let kv = KeyValueIndex::default();
        kv.set("x:children", "{oops".into()).unwrap();
        assert!(kv.children(&"x".into()).is_empty());
        assert_eq!(kv.corrupt_entries(), 1);
    }

    #[test]
    fn wal_replay_restores_sets() {
        let dir = unique_tmp_dir("replay");
        let wal = Arc::new(WalStore::open_in_dir(dir.clone()).unwrap());
        let kv = KeyValueIndex::new(Some(wal));
        kv.set_children(&"s".into(), &ids(&["p1"])).unwrap();
        kv.set_children(&"s".into(), &ids(&["p1", "p2"])).unwrap();
        drop(kv);

        let wal = Arc::new(WalStore::open_in_dir(dir).unwrap());
        let replay = wal.replay_since_seal(0).unwrap();
        let kv = KeyValueIndex::new(Some(wal));
        assert_eq!(kv.apply(replay.ops), 2);
        assert_eq!(kv.children(&"s".into()), ids(&["p1", "p2"]));
    }
}
