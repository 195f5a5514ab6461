use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use serde_json::json;

use crate::core::{section_key, valid_segment, CancelToken, Kind, Record, RecordId, Result, StoreError};
use crate::index::{children_key, subsections_key, KeyValueIndex};
use crate::section::trie::{SectionTrie, SectionTrieBuilder};
use crate::stats::AssemblyReport;
use crate::store::cursor::QuerySpec;
use crate::store::document::DocumentStore;
use crate::store::predicate::{KindIn, Sort, SortKey};
use crate::store::rewrite::{BulkRewriter, StagedRewrite};

/// 排序标记：控制字符小于任何合法路径段字符，
/// 因此每个 section 的记录排在其页面之前，页面排在子 section 之前。
const SECTION_MARKER: &str = "\u{1}a";
const PAGE_MARKER: &str = "\u{1}b";

/// 组装合成的 Section 记录带此参数；同路径出现内容 Section 时由后者接管
pub const SYNTHETIC_PARAM: &str = "synthetic_section";

pub fn section_storage_path(key: &str) -> String {
    if key.is_empty() {
        SECTION_MARKER.to_string()
    } else {
        format!("{key}/{SECTION_MARKER}")
    }
}

/// 序号补零到 12 位：字典序即数值序
pub fn page_storage_path(key: &str, seq: u64) -> String {
    if key.is_empty() {
        format!("{PAGE_MARKER}/{seq:012}")
    } else {
        format!("{key}/{PAGE_MARKER}/{seq:012}")
    }
}

pub fn is_synthetic(record: &Record) -> bool {
    record
        .param(SYNTHETIC_PARAM)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// 组装期的 section 节点（只在一次组装内存在）
#[derive(Clone, Debug, PartialEq)]
pub struct SectionNode {
    pub record_id: RecordId,
    pub sections: Vec<String>,
    pub kind: Kind,
    pub parent_id: Option<RecordId>,
    /// 父节点在节点表中的键；父节点是 Home 时为 None
    pub parent_key: Option<String>,
    pub child_record_ids: Vec<RecordId>,
    pub subsection_ids: Vec<RecordId>,
    /// 是否已有对应的 Section 记录（合成节点在 pass 3 之后落库）
    pub persisted: bool,
    pub synthetic: bool,
}

impl SectionNode {
    fn new(record_id: RecordId, sections: Vec<String>, persisted: bool, synthetic: bool) -> Self {
        Self {
            record_id,
            sections,
            kind: Kind::Section,
            parent_id: None,
            parent_key: None,
            child_record_ids: Vec::new(),
            subsection_ids: Vec::new(),
            persisted,
            synthetic,
        }
    }
}

/// 组装结果
#[derive(Debug)]
pub struct Assembly {
    pub home_id: RecordId,
    /// 路径键 → 节点（BTreeMap：父路径总在子路径之前）
    pub nodes: BTreeMap<String, SectionNode>,
    pub trie: SectionTrie,
    pub report: AssemblyReport,
}

/// sweep 暂存的结果：记录改动尚未交换，children 列表尚未写入 KV
struct Sweep<'a> {
    staged: StagedRewrite<'a>,
    children: Vec<(RecordId, Vec<RecordId>)>,
}

/// (节点键, 父节点 id, 父节点键)
type ParentLink = (String, RecordId, Option<String>);

/// section 树组装（五个 pass）
///
/// 1. 索引已有 Section 记录（重复路径报错；合成记录让位于内容记录）
/// 2. 发现：流式遍历，为页面分配 StoragePath，缺失的 section 合成节点
/// 3. 回填：补齐所有缺失的中间 section
/// 4. 提交前缀树
/// 5. 按 StoragePath 有序扫描，归属页面；解析 section 父子关系
///
/// pass 5 的记录改动在解析完父节点之后才交换，KV 邻接表只在交换成功后写入：
/// 失败或取消的组装不改动已有的 children / subsections。
/// 假设同一时刻只有一个组装在写。
pub struct HierarchyBuilder<'a> {
    docs: &'a DocumentStore,
    kv: &'a KeyValueIndex,
    collection: String,
    flush_threshold: usize,
    progress_interval: u64,
    cancel: CancelToken,
}

impl<'a> HierarchyBuilder<'a> {
    pub fn new(docs: &'a DocumentStore, kv: &'a KeyValueIndex, collection: &str) -> Self {
        Self {
            docs,
            kv,
            collection: collection.to_string(),
            flush_threshold: 500,
            progress_interval: 0,
            cancel: CancelToken::new(),
        }
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

    fn rewriter(&self) -> BulkRewriter<'a> {
        BulkRewriter::new(self.docs, &self.collection)
            .flush_threshold(self.flush_threshold)
            .progress_interval(self.progress_interval)
            .cancel(self.cancel.clone())
    }

    pub fn assemble(&self) -> Result<Assembly> {
        let started = Instant::now();
        let mut report = AssemblyReport::default();

        let home_id = self.find_home()?;
        let (mut nodes, superseded) = self.index_sections()?;
        report.sections_indexed = nodes.len();
        tracing::info!(
            "Assembly pass 1 (index): home={} sections={} superseded={}",
            home_id,
            nodes.len(),
            superseded.len()
        );

        let mut taken: HashSet<RecordId> = nodes.values().map(|n| n.record_id.clone()).collect();
        taken.extend(superseded.iter().cloned());
        self.discover(&mut nodes, &mut taken, &mut report)?;
        tracing::info!(
            "Assembly pass 2 (discover): pages={} sections={}",
            report.pages_assigned,
            nodes.len()
        );

        self.backfill(&mut nodes, &mut taken)?;
        report.sections_created = self.persist_synthetic(&mut nodes)?;
        tracing::info!(
            "Assembly pass 3 (backfill): sections={} created={}",
            nodes.len(),
            report.sections_created
        );

        let trie = build_trie(&home_id, &nodes);
        tracing::info!("Assembly pass 4 (trie): paths={}", trie.len());

        let skip: HashSet<RecordId> = superseded.iter().cloned().collect();
        let sweep = self.sweep(&trie, &skip)?;
        let links = self.resolve_parents(&home_id, &nodes, &trie)?;
        sweep.staged.commit()?;

        self.publish(&home_id, &mut nodes, sweep.children, links, &superseded, &mut report)?;

        report.elapsed = started.elapsed();
        tracing::info!("Assembly pass 5 (sweep): {}", report);
        Ok(Assembly {
            home_id,
            nodes,
            trie,
            report,
        })
    }

    fn kind_spec(&self, kind: Kind) -> QuerySpec {
        QuerySpec::new(&self.collection)
            .filter(KindIn::one(kind))
            .cancel(self.cancel.clone())
    }

    fn find_home(&self) -> Result<RecordId> {
        let mut homes = self.docs.find_ids(&self.kind_spec(Kind::Home))?;
        match homes.len() {
            0 => Err(StoreError::MissingHome),
            1 => Ok(homes.remove(0)),
            _ => Err(StoreError::integrity("index", homes)),
        }
    }

    /// pass 1：返回节点表和被内容 Section 接管的合成记录
    fn index_sections(&self) -> Result<(BTreeMap<String, SectionNode>, Vec<RecordId>)> {
        let mut nodes: BTreeMap<String, SectionNode> = BTreeMap::new();
        let mut superseded = Vec::new();
        let mut duplicates = Vec::new();
        for record in self.docs.query(&self.kind_spec(Kind::Section)) {
            let record = record?;
            let key = record.section_key();
            let synthetic = is_synthetic(&record);
            match nodes.get_mut(&key) {
                None => {
                    nodes.insert(key, SectionNode::new(record.id, record.sections, true, synthetic));
                }
                Some(existing) if existing.synthetic && !synthetic => {
                    tracing::debug!(
                        "Section {} takes over synthetic {} at {}",
                        record.id,
                        existing.record_id,
                        key
                    );
                    superseded.push(existing.record_id.clone());
                    *existing = SectionNode::new(record.id, record.sections, true, false);
                }
                Some(existing) if !existing.synthetic && synthetic => superseded.push(record.id),
                Some(existing) => {
                    duplicates.push(existing.record_id.clone());
                    duplicates.push(record.id);
                }
            }
        }
        if !duplicates.is_empty() {
            return Err(StoreError::integrity("index", duplicates));
        }
        Ok((nodes, superseded))
    }

    /// 确保路径有节点；返回是否新建
    fn ensure_section(
        &self,
        nodes: &mut BTreeMap<String, SectionNode>,
        taken: &mut HashSet<RecordId>,
        sections: &[String],
    ) -> bool {
        let key = section_key(sections);
        if nodes.contains_key(&key) {
            return false;
        }
        let id = self.allocate_id(taken, sections);
        tracing::debug!("Synthetic section: path={} id={}", key, id);
        nodes.insert(key, SectionNode::new(id, sections.to_vec(), false, true));
        true
    }

    /// `section_<seg>_<seg>`；与已有 id 冲突时追加序号
    fn allocate_id(&self, taken: &mut HashSet<RecordId>, sections: &[String]) -> RecordId {
        let base = RecordId::generate(Kind::Section, sections);
        let mut candidate = base.clone();
        let mut n = 2u32;
        while taken.contains(&candidate) || self.docs.exists(&self.collection, &candidate) {
            candidate = RecordId::new(format!("{}_{}", base, n));
            n += 1;
        }
        taken.insert(candidate.clone());
        candidate
    }

    /// pass 2：一次有序流式重写，写入 StoragePath
    fn discover(
        &self,
        nodes: &mut BTreeMap<String, SectionNode>,
        taken: &mut HashSet<RecordId>,
        report: &mut AssemblyReport,
    ) -> Result<()> {
        let mut seq: u64 = 0;
        let mut unresolved: Vec<RecordId> = Vec::new();

        let staged = self.rewriter().stage(|mut r| {
            match r.kind {
                Kind::Home => r.storage_path = section_storage_path(""),
                Kind::Section => r.storage_path = section_storage_path(&r.section_key()),
                Kind::Regular => {
                    if r.sections.is_empty() {
                        report.root_pages += 1;
                        report.pages_assigned += 1;
                        r.storage_path = page_storage_path("", seq);
                        seq += 1;
                    } else if !r.sections.iter().all(|s| valid_segment(s)) {
                        unresolved.push(r.id.clone());
                    } else {
                        // 根段没有 section 时先合成根，再合成页面所在的精确 section
                        self.ensure_section(nodes, taken, &r.sections[..1]);
                        self.ensure_section(nodes, taken, &r.sections);
                        r.storage_path = page_storage_path(&r.section_key(), seq);
                        report.pages_assigned += 1;
                        seq += 1;
                    }
                }
                _ => {}
            }
            Ok(r)
        })?;

        if !unresolved.is_empty() {
            drop(staged);
            return Err(StoreError::integrity("discover", unresolved));
        }
        staged.commit()?;
        Ok(())
    }

    /// pass 3：深度 N 的路径补齐 N-1..1 的所有前缀
    fn backfill(
        &self,
        nodes: &mut BTreeMap<String, SectionNode>,
        taken: &mut HashSet<RecordId>,
    ) -> Result<()> {
        let paths: Vec<Vec<String>> = nodes.values().map(|n| n.sections.clone()).collect();
        for sections in paths {
            self.cancel.check()?;
            for depth in (1..sections.len()).rev() {
                self.ensure_section(nodes, taken, &sections[..depth]);
            }
        }
        Ok(())
    }

    /// 合成节点落库为带标记的 Section 记录（StoragePath 已就位）
    fn persist_synthetic(&self, nodes: &mut BTreeMap<String, SectionNode>) -> Result<usize> {
        let mut batch = Vec::new();
        let mut created = 0usize;
        for (key, node) in nodes.iter_mut().filter(|(_, n)| !n.persisted) {
            let title = node.sections.last().cloned().unwrap_or_default();
            let mut record = Record::new(node.record_id.clone(), Kind::Section)
                .with_sections(&node.sections)
                .with_title(title)
                .with_param(SYNTHETIC_PARAM, json!(true));
            record.storage_path = section_storage_path(key);
            batch.push(record);
            node.persisted = true;
            created += 1;

            if batch.len() >= self.flush_threshold {
                self.docs.insert_batch(&self.collection, std::mem::take(&mut batch))?;
            }
        }
        if !batch.is_empty() {
            self.docs.insert_batch(&self.collection, batch)?;
        }
        Ok(created)
    }

    /// pass 5：按 StoragePath 有序扫描；children 列表只收集在内存里
    fn sweep(&self, trie: &SectionTrie, skip: &HashSet<RecordId>) -> Result<Sweep<'a>> {
        let mut current: Option<RecordId> = None;
        let mut pending: Vec<RecordId> = Vec::new();
        let mut children: Vec<(RecordId, Vec<RecordId>)> = Vec::new();
        let mut violations: Vec<RecordId> = Vec::new();

        let staged = self
            .rewriter()
            .sorted(Sort::asc(SortKey::StoragePath))
            .stage(|mut r| {
                if skip.contains(&r.id) {
                    return Ok(r);
                }
                if r.kind.is_node() {
                    if let Some(prev) = current.take() {
                        children.push((prev, std::mem::take(&mut pending)));
                    }
                    current = Some(r.id.clone());
                    return Ok(r);
                }
                if r.kind != Kind::Regular {
                    return Ok(r);
                }

                let Some(section) = current.as_ref() else {
                    violations.push(r.id.clone());
                    return Ok(r);
                };
                if r.storage_path.is_empty() || trie.get_exact(&r.sections) != Some(section) {
                    violations.push(r.id.clone());
                    return Ok(r);
                }
                r.parent_id = Some(section.clone());
                pending.push(r.id.clone());
                Ok(r)
            })?;

        if !violations.is_empty() {
            drop(staged);
            return Err(StoreError::integrity("sweep", violations));
        }
        // 最后一个 section 的 children 也要写出
        if let Some(prev) = current.take() {
            children.push((prev, pending));
        }
        Ok(Sweep { staged, children })
    }

    /// 按最长前缀解析每个 section 的父节点；只校验不写入
    fn resolve_parents(
        &self,
        home_id: &RecordId,
        nodes: &BTreeMap<String, SectionNode>,
        trie: &SectionTrie,
    ) -> Result<Vec<ParentLink>> {
        let mut links: Vec<ParentLink> = Vec::with_capacity(nodes.len());
        let mut violations = Vec::new();

        for (key, node) in nodes.iter() {
            self.cancel.check()?;
            let depth = node.sections.len();
            let parent = if depth <= 1 {
                Some((0, home_id))
            } else {
                trie.longest_prefix(&node.sections[..depth - 1])
            };
            match parent {
                Some((d, pid))
                    if self.docs.exists(&self.collection, pid)
                        && self.docs.exists(&self.collection, &node.record_id) =>
                {
                    let parent_key = (d > 0).then(|| section_key(&node.sections[..d]));
                    links.push((key.clone(), pid.clone(), parent_key));
                }
                _ => violations.push(node.record_id.clone()),
            }
        }
        if !violations.is_empty() {
            return Err(StoreError::integrity("parents", violations));
        }
        Ok(links)
    }

    /// 交换成功之后：重写 KV 邻接表、写 section 父节点、删除被接管的合成记录
    fn publish(
        &self,
        home_id: &RecordId,
        nodes: &mut BTreeMap<String, SectionNode>,
        children: Vec<(RecordId, Vec<RecordId>)>,
        links: Vec<ParentLink>,
        superseded: &[RecordId],
        report: &mut AssemblyReport,
    ) -> Result<()> {
        // 旧的 subsection 列表清空后重建，重复组装不会叠加
        let owners = std::iter::once(home_id)
            .chain(nodes.values().map(|n| &n.record_id))
            .chain(superseded.iter());
        for id in owners {
            if self.kv.get(&subsections_key(id)).is_some() {
                self.kv.set_subsections(id, &[])?;
            }
        }
        for id in superseded {
            if self.kv.get(&children_key(id)).is_some() {
                self.kv.set_children(id, &[])?;
            }
        }

        let key_by_id: HashMap<RecordId, String> = nodes
            .iter()
            .map(|(k, n)| (n.record_id.clone(), k.clone()))
            .collect();
        report.children_lists = children.len();
        for (section, ids) in children {
            self.kv.set_children(&section, &ids)?;
            if let Some(node) = key_by_id.get(&section).and_then(|k| nodes.get_mut(k)) {
                node.child_record_ids = ids;
            }
        }

        for (key, parent_id, parent_key) in links {
            let Some(node) = nodes.get_mut(&key) else { continue };
            let id = node.record_id.clone();
            node.parent_id = Some(parent_id.clone());
            node.parent_key = parent_key.clone();

            let updated = self.docs.update_by_id(&self.collection, &id, |r| {
                r.parent_id = Some(parent_id.clone());
            });
            if !updated {
                tracing::warn!("Section {} vanished before its parent {} was set", id, parent_id);
            }
            self.kv.append_subsection(&parent_id, &id)?;
            if let Some(parent) = parent_key.as_ref().and_then(|k| nodes.get_mut(k)) {
                parent.subsection_ids.push(id);
            }
            report.subsection_links += 1;
        }

        if !superseded.is_empty() {
            let removed = self.docs.remove_many(&self.collection, superseded);
            tracing::info!("Removed {} superseded synthetic section(s)", removed);
        }
        Ok(())
    }
}

fn build_trie(home_id: &RecordId, nodes: &BTreeMap<String, SectionNode>) -> SectionTrie {
    let mut builder = SectionTrieBuilder::new();
    builder.insert::<String>(&[], home_id.clone());
    for node in nodes.values() {
        builder.insert(&node.sections, node.record_id.clone());
    }
    builder.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::document::PAGES;

    fn page(id: &str, sections: &[&str]) -> Record {
        Record::new(id, Kind::Regular).with_sections(sections)
    }

    fn section(id: &str, sections: &[&str]) -> Record {
        Record::new(id, Kind::Section).with_sections(sections)
    }

    fn home() -> Record {
        Record::new("home", Kind::Home)
    }

    fn setup(records: Vec<Record>) -> (DocumentStore, KeyValueIndex) {
        let docs = DocumentStore::new(2);
        docs.insert_batch(PAGES, records).unwrap();
        (docs, KeyValueIndex::default())
    }

    fn ids(v: &[&str]) -> Vec<RecordId> {
        v.iter().map(|s| RecordId::from(*s)).collect()
    }

    fn parent_of(docs: &DocumentStore, id: &str) -> Option<RecordId> {
        docs.find_by_id(PAGES, &id.into()).unwrap().parent_id
    }

    /// 每个 id 的 (children, subsections)
    fn adjacency(kv: &KeyValueIndex, of: &[&str]) -> Vec<(Vec<RecordId>, Vec<RecordId>)> {
        of.iter()
            .map(|id| {
                let id = RecordId::from(*id);
                (kv.children(&id), kv.subsections(&id))
            })
            .collect()
    }

    #[test]
    fn blog_scenario() {
        let (docs, kv) = setup(vec![
            home(),
            page("p_root", &[]),
            page("p_blog", &["blog"]),
            page("p_2020", &["blog", "2020"]),
        ]);
        let assembly = HierarchyBuilder::new(&docs, &kv, PAGES)
            .flush_threshold(2)
            .assemble()
            .unwrap();

        assert_eq!(assembly.report.sections_created, 2);
        assert_eq!(assembly.report.root_pages, 1);
        assert_eq!(assembly.report.pages_assigned, 3);
        assert_eq!(kv.children(&"home".into()), ids(&["p_root"]));
        assert_eq!(kv.subsections(&"home".into()), ids(&["section_blog"]));
        assert_eq!(kv.children(&"section_blog".into()), ids(&["p_blog"]));
        assert_eq!(kv.subsections(&"section_blog".into()), ids(&["section_blog_2020"]));
        assert_eq!(kv.children(&"section_blog_2020".into()), ids(&["p_2020"]));

        assert_eq!(parent_of(&docs, "p_root"), Some("home".into()));
        assert_eq!(parent_of(&docs, "section_blog"), Some("home".into()));
        assert_eq!(parent_of(&docs, "section_blog_2020"), Some("section_blog".into()));
        assert_eq!(parent_of(&docs, "p_2020"), Some("section_blog_2020".into()));

        let blog = &assembly.nodes["blog"];
        assert_eq!(blog.subsection_ids, ids(&["section_blog_2020"]));
        assert_eq!(assembly.nodes["blog/2020"].parent_key.as_deref(), Some("blog"));
    }

    #[test]
    fn deep_path_backfills_every_ancestor() {
        let (docs, kv) = setup(vec![home(), page("p", &["a", "b", "c"])]);
        HierarchyBuilder::new(&docs, &kv, PAGES).assemble().unwrap();

        assert_eq!(parent_of(&docs, "section_a"), Some("home".into()));
        assert_eq!(parent_of(&docs, "section_a_b"), Some("section_a".into()));
        assert_eq!(parent_of(&docs, "section_a_b_c"), Some("section_a_b".into()));
        assert_eq!(parent_of(&docs, "p"), Some("section_a_b_c".into()));
        // 中间 section 没有直接页面，但有空 children 列表
        assert!(kv.children(&"section_a_b".into()).is_empty());
        assert!(kv.get("section_a_b:children").is_some());
    }

    #[test]
    fn existing_sections_are_reused_and_pages_partitioned() {
        let (docs, kv) = setup(vec![
            home(),
            section("docs", &["docs"]),
            page("d1", &["docs"]),
            page("x1", &["docs", "x"]),
            page("o1", &["other"]),
            page("d2", &["docs"]),
            page("y1", &["docs", "x", "y"]),
        ]);
        let assembly = HierarchyBuilder::new(&docs, &kv, PAGES).assemble().unwrap();
        assert_eq!(assembly.report.sections_indexed, 1);
        assert_eq!(assembly.report.sections_created, 3);

        // 页面保持发现顺序
        assert_eq!(kv.children(&"docs".into()), ids(&["d1", "d2"]));

        // 每个 Regular 页面恰好出现在一个 children 列表里
        let mut seen = Vec::new();
        for node in assembly.nodes.values() {
            seen.extend(kv.children(&node.record_id));
        }
        seen.extend(kv.children(&"home".into()));
        seen.sort();
        assert_eq!(seen, ids(&["d1", "d2", "o1", "x1", "y1"]));
    }

    #[test]
    fn reassembly_is_idempotent() {
        let (docs, kv) = setup(vec![
            home(),
            page("a1", &["a"]),
            page("b1", &["a", "b"]),
            page("c1", &["c"]),
        ]);
        let first = HierarchyBuilder::new(&docs, &kv, PAGES).assemble().unwrap();
        let home_subs = kv.subsections(&"home".into());
        let a_subs = kv.subsections(&"section_a".into());

        let second = HierarchyBuilder::new(&docs, &kv, PAGES).assemble().unwrap();
        assert_eq!(second.report.sections_created, 0);
        assert_eq!(second.report.sections_indexed, first.nodes.len());
        assert_eq!(kv.subsections(&"home".into()), home_subs);
        assert_eq!(kv.subsections(&"section_a".into()), a_subs);
        assert_eq!(home_subs, ids(&["section_a", "section_c"]));
    }

    #[test]
    fn missing_home_is_reported() {
        let (docs, kv) = setup(vec![page("p", &["a"])]);
        let err = HierarchyBuilder::new(&docs, &kv, PAGES).assemble().unwrap_err();
        assert!(matches!(err, StoreError::MissingHome));
    }

    #[test]
    fn duplicate_section_paths_report_every_id() {
        let (docs, kv) = setup(vec![
            home(),
            section("s1", &["a"]),
            section("s2", &["a"]),
            page("p", &["a"]),
        ]);
        let err = HierarchyBuilder::new(&docs, &kv, PAGES).assemble().unwrap_err();
        assert_eq!(err.offending_ids(), &ids(&["s1", "s2"])[..]);
        // 失败的组装不改动主集合
        assert!(docs.find_by_id(PAGES, &"p".into()).unwrap().storage_path.is_empty());
    }

    #[test]
    fn synthetic_id_avoids_collisions() {
        let (docs, kv) = setup(vec![home(), page("section_a", &[]), page("p", &["a"])]);
        let assembly = HierarchyBuilder::new(&docs, &kv, PAGES).assemble().unwrap();
        assert_eq!(assembly.nodes["a"].record_id, RecordId::from("section_a_2"));
        assert_eq!(parent_of(&docs, "p"), Some("section_a_2".into()));
    }

    #[test]
    fn cancelled_assembly_leaves_collection_intact() {
        let (docs, kv) = setup(vec![home(), page("p", &["a"])]);
        let token = CancelToken::new();
        token.cancel();
        let err = HierarchyBuilder::new(&docs, &kv, PAGES)
            .cancel(token)
            .assemble()
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        assert_eq!(docs.len(PAGES), 2);
        assert!(docs.collection("pages_temp").is_none());
    }

    #[test]
    fn cancelled_sweep_keeps_existing_adjacency() {
        let (docs, kv) = setup(vec![
            home(),
            page("p_blog", &["blog"]),
            page("p_2020", &["blog", "2020"]),
        ]);
        let first = HierarchyBuilder::new(&docs, &kv, PAGES).assemble().unwrap();
        let nodes = ["home", "section_blog", "section_blog_2020"];
        let before = adjacency(&kv, &nodes);
        assert_eq!(before[0].1, ids(&["section_blog"]));

        let token = CancelToken::new();
        token.cancel();
        let builder = HierarchyBuilder::new(&docs, &kv, PAGES).cancel(token.clone());
        match builder.sweep(&first.trie, &HashSet::new()) {
            Err(e) => assert!(matches!(e, StoreError::Cancelled)),
            Ok(_) => panic!("cancelled sweep staged a rewrite"),
        }
        assert_eq!(adjacency(&kv, &nodes), before);
        assert!(docs.collection("pages_temp").is_none());

        let err = HierarchyBuilder::new(&docs, &kv, PAGES)
            .cancel(token)
            .assemble()
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        assert_eq!(adjacency(&kv, &nodes), before);
    }

    #[test]
    fn sweep_violations_report_every_page_and_keep_adjacency() {
        let (docs, kv) = setup(vec![home(), page("p1", &["a"]), page("p2", &["b"])]);
        let first = HierarchyBuilder::new(&docs, &kv, PAGES).assemble().unwrap();
        let nodes = ["home", "section_a", "section_b"];
        let before = adjacency(&kv, &nodes);

        // 只有 Home 的前缀树：每个页面都找不到自己的精确 section
        let home_only = build_trie(&first.home_id, &BTreeMap::new());
        let builder = HierarchyBuilder::new(&docs, &kv, PAGES);
        match builder.sweep(&home_only, &HashSet::new()) {
            Err(e) => assert_eq!(e.offending_ids(), &ids(&["p1", "p2"])[..]),
            Ok(_) => panic!("sweep accepted unresolvable pages"),
        }
        assert_eq!(adjacency(&kv, &nodes), before);
        assert_eq!(parent_of(&docs, "p1"), Some("section_a".into()));
        assert!(docs.collection("pages_temp").is_none());
    }

    #[test]
    fn discover_reports_every_invalid_page() {
        let docs = DocumentStore::new(2);
        // 快照恢复不做插入校验，非法路径段可以进到集合里
        docs.restore(
            PAGES,
            vec![
                home(),
                page("bad1", &["a", ""]),
                page("ok", &["a"]),
                page("bad2", &["x/y"]),
            ],
        );
        let kv = KeyValueIndex::default();

        let err = HierarchyBuilder::new(&docs, &kv, PAGES).assemble().unwrap_err();
        assert!(matches!(err, StoreError::IntegrityViolation { pass: "discover", .. }));
        assert_eq!(err.offending_ids(), &ids(&["bad1", "bad2"])[..]);
        assert_eq!(docs.len(PAGES), 4);
        assert!(docs
            .query(&QuerySpec::new(PAGES))
            .all(|r| r.unwrap().storage_path.is_empty()));
        assert!(kv.is_empty());

        // 只统计真正拿到 StoragePath 的页面
        let builder = HierarchyBuilder::new(&docs, &kv, PAGES);
        let (mut nodes, _) = builder.index_sections().unwrap();
        let mut taken = HashSet::new();
        let mut report = AssemblyReport::default();
        assert!(builder.discover(&mut nodes, &mut taken, &mut report).is_err());
        assert_eq!(report.pages_assigned, 1);
    }

    #[test]
    fn content_section_takes_over_synthetic() {
        let (docs, kv) = setup(vec![
            home(),
            page("p_blog", &["blog"]),
            page("p_2020", &["blog", "2020"]),
        ]);
        HierarchyBuilder::new(&docs, &kv, PAGES).assemble().unwrap();
        assert!(is_synthetic(&docs.find_by_id(PAGES, &"section_blog".into()).unwrap()));

        docs.insert_batch(PAGES, vec![section("blog_index", &["blog"]).with_title("Blog")])
            .unwrap();
        let second = HierarchyBuilder::new(&docs, &kv, PAGES).assemble().unwrap();
        assert_eq!(second.report.sections_created, 0);
        assert_eq!(second.nodes["blog"].record_id, RecordId::from("blog_index"));
        assert!(!second.nodes["blog"].synthetic);

        assert!(!docs.exists(PAGES, &"section_blog".into()));
        assert_eq!(kv.subsections(&"home".into()), ids(&["blog_index"]));
        assert_eq!(kv.children(&"blog_index".into()), ids(&["p_blog"]));
        assert_eq!(kv.subsections(&"blog_index".into()), ids(&["section_blog_2020"]));
        assert!(kv.children(&"section_blog".into()).is_empty());
        assert!(kv.subsections(&"section_blog".into()).is_empty());
        assert_eq!(parent_of(&docs, "p_blog"), Some("blog_index".into()));
        assert_eq!(parent_of(&docs, "section_blog_2020"), Some("blog_index".into()));

        let third = HierarchyBuilder::new(&docs, &kv, PAGES).assemble().unwrap();
        assert_eq!(third.report.sections_created, 0);
        assert_eq!(kv.subsections(&"home".into()), ids(&["blog_index"]));
    }
}
