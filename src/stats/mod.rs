use std::fmt;
use std::time::Duration;

/// 一次层级组装的摘要
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssemblyReport {
    /// pass 1 读到的已有 section
    pub sections_indexed: usize,
    /// pass 2/3 合成的 section
    pub sections_created: usize,
    /// 参与 sweep 的 Regular 页面
    pub pages_assigned: usize,
    /// 路径为空、直接挂在 Home 下的页面
    pub root_pages: usize,
    /// 写入 KV 的 children 列表数
    pub children_lists: usize,
    /// 建立的 section → 父 section 边
    pub subsection_links: usize,
    pub elapsed: Duration,
}

impl fmt::Display for AssemblyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sections={} (+{} created) pages={} (root {}) children_lists={} links={} in {:?}",
            self.sections_indexed + self.sections_created,
            self.sections_created,
            self.pages_assigned,
            self.root_pages,
            self.children_lists,
            self.subsection_links,
            self.elapsed
        )
    }
}

/// 存储整体状态（条目级统计）
#[derive(Clone, Debug, Default)]
pub struct StoreReport {
    /// (集合名, 记录数)
    pub collections: Vec<(String, usize)>,
    pub pending_writes: usize,
    pub kv_entries: usize,
    pub term_rows: usize,
    pub cache_entries: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// 读取时按空处理的损坏条目（KV / LitePage / 快照记录）
    pub corrupt_skipped: u64,
    /// 已提交 trie 中的路径数（含 Home）
    pub trie_paths: usize,
    pub last_assembly: Option<AssemblyReport>,
}

impl StoreReport {
    pub fn total_records(&self) -> usize {
        self.collections.iter().map(|(_, n)| n).sum()
    }

    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

impl fmt::Display for StoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           pagestore Report                       ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║ Collections:                                     ║")?;
        for (name, n) in &self.collections {
            writeln!(f, "║   {:<16}{:>10}                       ║", name, n)?;
        }
        writeln!(
            f,
            "║   pending:      {:>10}                       ║",
            self.pending_writes
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Indexes:                                         ║")?;
        writeln!(
            f,
            "║   kv entries:   {:>10}                       ║",
            self.kv_entries
        )?;
        writeln!(
            f,
            "║   term rows:    {:>10}                       ║",
            self.term_rows
        )?;
        writeln!(
            f,
            "║   trie paths:   {:>10}                       ║",
            self.trie_paths
        )?;
        writeln!(
            f,
            "║   corrupt:      {:>10}                       ║",
            self.corrupt_skipped
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Record Cache:                                    ║")?;
        writeln!(
            f,
            "║   entries:      {:>10}                       ║",
            self.cache_entries
        )?;
        writeln!(
            f,
            "║   hit ratio:    {:>9.1}%                       ║",
            self.cache_hit_ratio() * 100.0
        )?;
        if let Some(a) = &self.last_assembly {
            writeln!(f, "╠──────────────────────────────────────────────────╣")?;
            writeln!(f, "║ Last assembly: {}", a)?;
        }
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}
