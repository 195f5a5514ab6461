use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::RecordId;

/// 一行 (group, key, record) 成员关系；允许重复（多重映射，不去重）
///
/// 注意：快照用 bincode 编码本结构，不要加 `skip_serializing_if`。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedTermEntry {
    /// `<group>_<key>_<record>`
    pub id: String,
    pub weight: i64,
    pub group: String,
    pub key: String,
    pub record_id: RecordId,
    /// 过滤计数时随聚合带出的展示名
    pub label: Option<String>,
    pub facets: Vec<String>,
}

/// 写入用的成员描述
#[derive(Clone, Debug, Default)]
pub struct TermMember {
    pub record_id: RecordId,
    pub weight: i64,
    pub label: Option<String>,
    pub facets: Vec<String>,
}

impl TermMember {
    pub fn new(record_id: impl Into<RecordId>, weight: i64) -> Self {
        Self {
            record_id: record_id.into(),
            weight,
            ..Default::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_facets<S: AsRef<str>>(mut self, facets: &[S]) -> Self {
        self.facets = facets.iter().map(|f| f.as_ref().to_string()).collect();
        self
    }
}

/// key 计数；label / facets 取该 key 第一次出现的行
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TermCount {
    pub key: String,
    pub count: usize,
    pub label: Option<String>,
    pub facets: Vec<String>,
}

/// 追加式 term 多重映射（taxonomy）
#[derive(Default)]
pub struct TermIndex {
    rows: RwLock<Vec<WeightedTermEntry>>,
}

impl TermIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entries(&self, group: &str, key: &str, members: Vec<TermMember>) -> usize {
        let n = members.len();
        let mut rows = self.rows.write();
        rows.reserve(n);
        for m in members {
            rows.push(WeightedTermEntry {
                id: format!("{}_{}_{}", group, key, m.record_id),
                weight: m.weight,
                group: group.to_string(),
                key: key.to_string(),
                record_id: m.record_id,
                label: m.label,
                facets: m.facets,
            });
        }
        n
    }

    /// 组内不同的 key，按首次出现顺序
    pub fn keys_for_group(&self, group: &str) -> Vec<String> {
        let rows = self.rows.read();
        let mut seen = std::collections::HashSet::new();
        rows.iter()
            .filter(|r| r.group == group)
            .filter(|r| seen.insert(r.key.as_str()))
            .map(|r| r.key.clone())
            .collect()
    }

    /// 某个 key 下的 record id，按写入顺序（重复行会重复出现）
    pub fn entries_for_key(&self, group: &str, key: &str) -> Vec<RecordId> {
        self.rows
            .read()
            .iter()
            .filter(|r| r.group == group && r.key == key)
            .map(|r| r.record_id.clone())
            .collect()
    }

    /// 整个分组的 record id（按写入顺序）
    pub fn record_ids_for_group(&self, group: &str) -> Vec<RecordId> {
        self.rows
            .read()
            .iter()
            .filter(|r| r.group == group)
            .map(|r| r.record_id.clone())
            .collect()
    }

    /// 按 key 计数，降序；计数相同保持首次出现顺序
    pub fn count_by_key(&self, group: &str) -> Vec<(String, usize)> {
        self.count_by_key_filtered(|r| r.group == group)
            .into_iter()
            .map(|c| (c.key, c.count))
            .collect()
    }

    /// 对满足谓词的行按 key 计数，带出首次出现的 label / facets
    pub fn count_by_key_filtered<P>(&self, predicate: P) -> Vec<TermCount>
    where
        P: Fn(&WeightedTermEntry) -> bool,
    {
        let rows = self.rows.read();
        let mut slots: HashMap<&str, usize> = HashMap::new();
        let mut out: Vec<TermCount> = Vec::new();
        for r in rows.iter().filter(|r| predicate(r)) {
            match slots.get(r.key.as_str()) {
                Some(&i) => out[i].count += 1,
                None => {
                    slots.insert(r.key.as_str(), out.len());
                    out.push(TermCount {
                        key: r.key.clone(),
                        count: 1,
                        label: r.label.clone(),
                        facets: r.facets.clone(),
                    });
                }
            }
        }
        // sort_by 是稳定排序
        out.sort_by(|a, b| b.count.cmp(&a.count));
        out
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub fn export(&self) -> Vec<WeightedTermEntry> {
        self.rows.read().clone()
    }

    pub fn restore(&self, rows: Vec<WeightedTermEntry>) {
        *self.rows.write() = rows;
    }

    pub fn clear(&self) {
        self.rows.write().clear();
    }
}
