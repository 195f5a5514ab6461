use std::collections::BTreeMap;

use crate::core::RecordId;

#[derive(Clone, Debug, Default)]
struct TrieNode {
    owner: Option<RecordId>,
    children: BTreeMap<String, TrieNode>,
}

/// 可变阶段：组装期间逐个插入 section 路径
#[derive(Debug, Default)]
pub struct SectionTrieBuilder {
    root: TrieNode,
    len: usize,
}

impl SectionTrieBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入路径 → 所属记录；空路径即根（Home）。返回被覆盖的旧值。
    pub fn insert<S: AsRef<str>>(&mut self, segments: &[S], id: RecordId) -> Option<RecordId> {
        let mut node = &mut self.root;
        for s in segments {
            node = node.children.entry(s.as_ref().to_string()).or_default();
        }
        let prev = node.owner.replace(id);
        if prev.is_none() {
            self.len += 1;
        }
        prev
    }

    /// 冻结为只读前缀树
    pub fn commit(self) -> SectionTrie {
        SectionTrie {
            root: self.root,
            len: self.len,
        }
    }
}

/// 已提交的只读 section 前缀树（按路径段匹配，不按字节）
///
/// `blog` 不会匹配 `blogroll`：前缀以整段为单位。
#[derive(Clone, Debug, Default)]
pub struct SectionTrie {
    root: TrieNode,
    len: usize,
}

impl SectionTrie {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get_exact<S: AsRef<str>>(&self, segments: &[S]) -> Option<&RecordId> {
        let mut node = &self.root;
        for s in segments {
            node = node.children.get(s.as_ref())?;
        }
        node.owner.as_ref()
    }

    /// 最长前缀匹配：返回 (匹配的段数, 所属记录)
    pub fn longest_prefix<S: AsRef<str>>(&self, segments: &[S]) -> Option<(usize, &RecordId)> {
        let mut node = &self.root;
        let mut best = node.owner.as_ref().map(|id| (0, id));
        for (i, s) in segments.iter().enumerate() {
            match node.children.get(s.as_ref()) {
                Some(next) => node = next,
                None => break,
            }
            if let Some(id) = node.owner.as_ref() {
                best = Some((i + 1, id));
            }
        }
        best
    }
}
