use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::cache::RecordCache;
use crate::core::{Kind, Record, RecordId};
use crate::index::KeyValueIndex;
use crate::section::trie::SectionTrie;
use crate::store::document::DocumentStore;

/// 递归深度上限：路径天然无环，这里只防止坏边导致无限递归
const MAX_DEPTH: usize = 256;

/// 记录所在的 section：Home / Section 是自身，其余取父节点
pub fn current_section(record: &Record) -> Option<&RecordId> {
    if record.kind.is_node() {
        Some(&record.id)
    } else {
        record.parent_id.as_ref()
    }
}

pub fn in_section(a: &Record, b: &Record) -> bool {
    match (current_section(a), current_section(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn has_prefix(path: &[String], prefix: &[String]) -> bool {
    path.len() >= prefix.len() && path[..prefix.len()] == *prefix
}

/// `a` 是否是 `b` 的祖先（按路径前缀）；同层的普通页面不是任何记录的祖先
pub fn is_ancestor(a: &Record, b: &Record) -> bool {
    if a.kind == Kind::Regular && a.sections.len() == b.sections.len() {
        return false;
    }
    has_prefix(&b.sections, &a.sections)
}

/// `a` 是否是 `b` 的后代；与同层普通页面比较时恒为 false
pub fn is_descendant(a: &Record, b: &Record) -> bool {
    if b.kind == Kind::Regular && a.sections.len() == b.sections.len() {
        return false;
    }
    has_prefix(&a.sections, &b.sections)
}

/// 读侧导航：通过 id 查表解析父子关系，不持有记录之间的引用
pub struct Navigator<'a> {
    docs: &'a DocumentStore,
    kv: &'a KeyValueIndex,
    cache: &'a RecordCache,
    trie: &'a SectionTrie,
    collection: &'a str,
    slow: Duration,
}

impl<'a> Navigator<'a> {
    pub fn new(
        docs: &'a DocumentStore,
        kv: &'a KeyValueIndex,
        cache: &'a RecordCache,
        trie: &'a SectionTrie,
        collection: &'a str,
    ) -> Self {
        Self {
            docs,
            kv,
            cache,
            trie,
            collection,
            slow: Duration::from_millis(500),
        }
    }

    pub fn slow_threshold(mut self, slow: Duration) -> Self {
        self.slow = slow;
        self
    }

    /// 路径 → 所属 section（最长前缀，整段匹配）
    pub fn section_for_path<S: AsRef<str>>(&self, segments: &[S]) -> Option<RecordId> {
        self.trie.longest_prefix(segments).map(|(_, id)| id.clone())
    }

    /// 记录之上的 section 链（根在前，不含 Home，不含自身）
    pub fn ancestor_ids(&self, id: &RecordId) -> Vec<RecordId> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = self
            .docs
            .find_by_id(self.collection, id)
            .and_then(|r| r.parent_id);

        while let Some(pid) = cursor {
            if !visited.insert(pid.clone()) || out.len() >= MAX_DEPTH {
                tracing::warn!("Ancestor walk aborted (cycle or depth): start={} at={}", id, pid);
                break;
            }
            let Some(parent) = self.docs.find_by_id(self.collection, &pid) else {
                break;
            };
            if parent.kind == Kind::Home {
                break;
            }
            out.push(pid);
            cursor = parent.parent_id;
        }
        out.reverse();
        out
    }

    /// 所有传递子 section（先序）
    pub fn all_subsection_ids(&self, id: &RecordId) -> Vec<RecordId> {
        let mut out = Vec::new();
        let mut visited = HashSet::from([id.clone()]);
        self.collect_subsections(id, 0, &mut visited, &mut out);
        out
    }

    fn collect_subsections(
        &self,
        id: &RecordId,
        depth: usize,
        visited: &mut HashSet<RecordId>,
        out: &mut Vec<RecordId>,
    ) {
        if depth >= MAX_DEPTH {
            tracing::warn!("Subsection walk depth limit reached at {}", id);
            return;
        }
        for sub in self.kv.subsections(id) {
            if !visited.insert(sub.clone()) {
                continue;
            }
            out.push(sub.clone());
            self.collect_subsections(&sub, depth + 1, visited, out);
        }
    }

    /// section 及其全部子孙 section 下的页面：先子 section（递归），最后自身页面
    ///
    /// 结果经 RecordCache 备忘；缓存关闭时结果相同。
    pub fn descendant_page_ids(&self, id: &RecordId) -> Vec<RecordId> {
        let subsections = self.kv.subsections(id);
        if subsections.is_empty() {
            return self.kv.children(id);
        }

        let key = format!("descendant_pages:{}", id);
        self.cache.get_or_compute(&key, || {
            let started = Instant::now();
            let mut out = Vec::new();
            let mut visited = HashSet::from([id.clone()]);
            for sub in subsections {
                self.collect_pages(&sub, 0, &mut visited, &mut out);
            }
            out.extend(self.kv.children(id));

            let elapsed = started.elapsed();
            if elapsed > self.slow {
                tracing::warn!(
                    "Slow descendant aggregation: id={} pages={} elapsed={:?}",
                    id,
                    out.len(),
                    elapsed
                );
            }
            out
        })
    }

    fn collect_pages(
        &self,
        id: &RecordId,
        depth: usize,
        visited: &mut HashSet<RecordId>,
        out: &mut Vec<RecordId>,
    ) {
        if !visited.insert(id.clone()) {
            return;
        }
        if depth >= MAX_DEPTH {
            tracing::warn!("Descendant walk depth limit reached at {}", id);
            return;
        }
        out.extend(self.kv.children(id));
        for sub in self.kv.subsections(id) {
            self.collect_pages(&sub, depth + 1, visited, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::builder::HierarchyBuilder;
    use crate::store::document::PAGES;
    use std::collections::BTreeSet;

    fn page(id: &str, sections: &[&str]) -> Record {
        Record::new(id, Kind::Regular).with_sections(sections)
    }

    fn assembled() -> (DocumentStore, KeyValueIndex, SectionTrie) {
        let docs = DocumentStore::new(4);
        docs.insert_batch(
            PAGES,
            vec![
                Record::new("home", Kind::Home),
                page("d1", &["docs"]),
                page("x1", &["docs", "x"]),
                page("y1", &["docs", "x", "y"]),
                page("z1", &["docs", "z"]),
                page("o1", &["other"]),
                page("r1", &[]),
            ],
        )
        .unwrap();
        let kv = KeyValueIndex::default();
        let assembly = HierarchyBuilder::new(&docs, &kv, PAGES).assemble().unwrap();
        (docs, kv, assembly.trie)
    }

    fn set(ids: Vec<RecordId>) -> BTreeSet<String> {
        ids.into_iter().map(|i| i.0).collect()
    }

    #[test]
    fn descendant_pages_cover_exactly_the_prefix() {
        let (docs, kv, trie) = assembled();
        let cache = RecordCache::new(16, Duration::from_secs(60));
        let nav = Navigator::new(&docs, &kv, &cache, &trie, PAGES);

        let docs_id = RecordId::from("section_docs");
        let pages = nav.descendant_page_ids(&docs_id);
        assert_eq!(pages.len(), 4);
        assert_eq!(pages.last(), Some(&RecordId::from("d1")));
        assert_eq!(set(pages.clone()), set(vec!["d1".into(), "x1".into(), "y1".into(), "z1".into()]));

        // 缓存关闭时结果一致
        let off = RecordCache::disabled();
        let nav_off = Navigator::new(&docs, &kv, &off, &trie, PAGES);
        assert_eq!(nav_off.descendant_page_ids(&docs_id), pages);
        assert_eq!(nav.descendant_page_ids(&docs_id), pages);
        assert_eq!(cache.stats().hits, 1);

        // 叶子 section 直接返回自身页面
        assert_eq!(nav.descendant_page_ids(&"section_other".into()), vec![RecordId::from("o1")]);
    }

    #[test]
    fn ancestors_and_subsections() {
        let (docs, kv, trie) = assembled();
        let cache = RecordCache::disabled();
        let nav = Navigator::new(&docs, &kv, &cache, &trie, PAGES);

        assert_eq!(
            nav.ancestor_ids(&"y1".into()),
            vec![
                RecordId::from("section_docs"),
                RecordId::from("section_docs_x"),
                RecordId::from("section_docs_x_y"),
            ]
        );
        assert!(nav.ancestor_ids(&"r1".into()).is_empty());

        assert_eq!(
            nav.all_subsection_ids(&"section_docs".into()),
            vec![
                RecordId::from("section_docs_x"),
                RecordId::from("section_docs_x_y"),
                RecordId::from("section_docs_z"),
            ]
        );
        assert_eq!(
            nav.section_for_path(&["docs", "x", "nope"]),
            Some(RecordId::from("section_docs_x"))
        );
        assert_eq!(nav.section_for_path(&["elsewhere"]), Some(RecordId::from("home")));
    }

    #[test]
    fn cyclic_edge_does_not_recurse_forever() {
        let (docs, kv, trie) = assembled();
        // 人为制造环：x 的子 section 指回 docs
        kv.append_subsection(&"section_docs_x".into(), &"section_docs".into()).unwrap();
        let cache = RecordCache::disabled();
        let nav = Navigator::new(&docs, &kv, &cache, &trie, PAGES);
        assert_eq!(nav.descendant_page_ids(&"section_docs".into()).len(), 4);
        assert_eq!(nav.all_subsection_ids(&"section_docs".into()).len(), 3);
    }

    #[test]
    fn path_relations() {
        let s = Record::new("s", Kind::Section).with_sections(&["a"]);
        let p = page("p", &["a"]);
        let q = page("q", &["a", "b"]);
        assert!(is_ancestor(&s, &p));
        assert!(is_ancestor(&s, &q));
        assert!(!is_ancestor(&p, &s));
        assert!(is_descendant(&q, &s));
        assert!(!is_descendant(&s, &p));

        let mut p = p;
        p.parent_id = Some("s".into());
        assert!(in_section(&s, &p));
        assert_eq!(current_section(&q), None);
    }
}
