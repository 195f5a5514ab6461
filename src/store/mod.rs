pub mod cursor;
pub mod document;
pub mod pending;
pub mod predicate;
pub mod rewrite;

pub use cursor::{QuerySpec, RecordCursor};
pub use document::{Collection, DocumentStore, HEADLESS_PAGES, PAGES, RAW_PAGES};
pub use pending::PendingWrites;
pub use predicate::{KindIn, ParamEquals, ParamIn, Predicate, Sort, SortKey};
pub use rewrite::{BulkRewriter, StagedRewrite};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::cache::lite::{self, LitePage};
use crate::cache::RecordCache;
use crate::core::{
    CancelToken, Kind, Record, RecordId, Result, StoreConfig, StoreError, HUMAN_ID_PARAM,
};
use crate::index::{KeyValueIndex, TermIndex};
use crate::section::{HierarchyBuilder, Navigator, SectionTrie, SectionTrieBuilder};
use crate::stats::{AssemblyReport, StoreReport};
use crate::storage::{SnapshotStore, StoreImage, WalStore};

const SNAPSHOT_FILE: &str = "store.db";
const KV_WAL_DIR: &str = "kv";

fn unavailable(what: &str, e: anyhow::Error) -> StoreError {
    StoreError::Unavailable(format!("{what}: {e:#}"))
}

/// 显式的存储句柄：构造一次，传给所有需要它的组件（没有进程级单例）
pub struct PageStore {
    config: StoreConfig,
    docs: DocumentStore,
    kv: KeyValueIndex,
    terms: TermIndex,
    cache: RecordCache,
    pending: PendingWrites,
    /// 最近一次组装提交的 section 前缀树；重新组装时原子替换，读侧不阻塞
    sections: ArcSwap<SectionTrie>,
    snapshot: Option<SnapshotStore>,
    last_assembly: Mutex<Option<AssemblyReport>>,
    corrupt_records: AtomicU64,
}

impl PageStore {
    /// 纯内存存储（忽略 data_dir）
    pub fn in_memory(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, None, None))
    }

    fn build(config: StoreConfig, snapshot: Option<SnapshotStore>, wal: Option<Arc<WalStore>>) -> Self {
        Self {
            docs: DocumentStore::new(config.batch_size),
            kv: KeyValueIndex::new(wal),
            terms: TermIndex::new(),
            cache: RecordCache::new(config.cache_capacity, config.cache_ttl()),
            pending: PendingWrites::new(config.flush_threshold),
            sections: ArcSwap::from_pointee(SectionTrie::empty()),
            snapshot,
            last_assembly: Mutex::new(None),
            corrupt_records: AtomicU64::new(0),
            config,
        }
    }

    /// 打开存储：加载快照镜像（若有）并回放 KV WAL。
    ///
    /// 后端初始化失败返回 `Unavailable`，调用方不应重试。
    pub async fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let Some(dir) = config.data_dir.clone() else {
            return Self::in_memory(config);
        };

        std::fs::create_dir_all(&dir)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", dir.display(), e)))?;
        let snapshot = SnapshotStore::new(dir.join(SNAPSHOT_FILE));
        let wal = WalStore::open_in_dir(dir.join(KV_WAL_DIR)).map_err(|e| unavailable("kv wal", e))?;

        if config.reset_on_open {
            snapshot.remove().await.map_err(|e| unavailable("reset snapshot", e))?;
            wal.reset().map_err(|e| unavailable("reset kv wal", e))?;
            tracing::info!("Store reset on open: {}", dir.display());
        }

        let image = match snapshot.load_if_valid().await {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!("Failed to load snapshot: {}, starting empty", e);
                None
            }
        };

        let store = Self::build(config, Some(snapshot), Some(Arc::new(wal)));
        let seal_id = match image {
            Some(image) => store.restore_image(image),
            None => {
                tracing::info!("No valid snapshot, starting with empty store");
                0
            }
        };
        store.replay_kv_wal(seal_id);
        store.refresh_sections()?;
        Ok(store)
    }

    fn restore_image(&self, image: StoreImage) -> u64 {
        let mut records = 0usize;
        for collection in &image.collections {
            let (decoded, skipped) = collection.decode();
            records += self.docs.restore(&collection.name, decoded);
            self.corrupt_records.fetch_add(skipped as u64, Ordering::Relaxed);
        }
        tracing::info!(
            "Loaded store snapshot: collections={} records={} terms={} kv={} seal={:016x}",
            image.collections.len(),
            records,
            image.terms.len(),
            image.kv.len(),
            image.kv_seal_id
        );
        self.terms.restore(image.terms);
        self.kv.restore(image.kv);
        image.kv_seal_id
    }

    fn replay_kv_wal(&self, checkpoint_seal_id: u64) {
        let Some(wal) = self.kv.wal().cloned() else { return };
        match wal.replay_since_seal(checkpoint_seal_id) {
            Ok(r) => {
                if !r.ops.is_empty() {
                    tracing::info!(
                        "KV WAL replay: ops={} sealed_used={} truncated_tail={}",
                        r.ops.len(),
                        r.sealed_used,
                        r.truncated_tail_records
                    );
                    self.kv.apply(r.ops);
                }
            }
            Err(e) => {
                tracing::warn!("KV WAL replay failed, ignoring: {}", e);
            }
        }
    }

    /// 落盘：seal WAL → 写整库镜像（记录 seal 边界）→ 清理已被镜像覆盖的 sealed 文件
    pub async fn checkpoint(&self) -> Result<()> {
        self.flush()?;
        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };

        let started = Instant::now();
        let wal = self.kv.wal().cloned();
        let seal_id = match &wal {
            Some(w) => match w.seal() {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!("KV WAL seal failed, continuing: {}", e);
                    0
                }
            },
            None => 0,
        };

        let mut image = StoreImage {
            terms: self.terms.export(),
            kv: self.kv.export(),
            kv_seal_id: seal_id,
            ..Default::default()
        };
        for (name, records) in self.docs.export() {
            image
                .push_collection(&name, &records)
                .map_err(|e| StoreError::Serialization(format!("{name}: {e:#}")))?;
        }
        snapshot
            .write_atomic(&image)
            .await
            .map_err(|e| unavailable("snapshot write", e))?;

        if let Some(w) = wal {
            match w.cleanup_sealed_up_to(seal_id) {
                Ok(n) if n > 0 => tracing::debug!("KV WAL cleanup: removed={}", n),
                Ok(_) => {}
                Err(e) => tracing::warn!("KV WAL cleanup failed: {}", e),
            }
        }
        tracing::info!("Checkpoint complete in {:?}", started.elapsed());
        Ok(())
    }

    // ---- 组件访问 ----

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.docs
    }

    pub fn kv(&self) -> &KeyValueIndex {
        &self.kv
    }

    pub fn terms(&self) -> &TermIndex {
        &self.terms
    }

    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }

    // ---- 写入 ----

    /// 整批写入；记录携带的邻接边剥离到 KV，主文档只存精简载荷。
    ///
    /// 先整批校验，再写邻接边，最后写文档：KV 写失败时文档一条都不落，
    /// 被拒绝的批次也不会在 KV 里留下邻接边。
    pub fn insert_batch(&self, collection: &str, mut records: Vec<Record>) -> Result<usize> {
        self.docs.check_batch(collection, &records)?;

        let adjacency: Vec<(RecordId, Vec<RecordId>, Vec<RecordId>)> = records
            .iter_mut()
            .filter_map(|r| {
                let (pages, subs) = r.take_adjacency();
                (!pages.is_empty() || !subs.is_empty()).then(|| (r.id.clone(), pages, subs))
            })
            .collect();

        for (id, pages, subs) in &adjacency {
            self.kv.store_adjacency(id, pages, subs)?;
        }
        self.docs.insert_batch(collection, records)
    }

    /// 经待写缓冲写入；达到 flush_threshold 时自动整批写出
    pub fn enqueue(&self, collection: &str, record: Record) -> Result<usize> {
        self.pending
            .enqueue(collection, record, |c, batch| self.insert_batch(c, batch))
    }

    pub fn flush(&self) -> Result<usize> {
        self.pending.flush(|c, batch| self.insert_batch(c, batch))
    }

    /// 流式遍历并原地写回每条被修改的记录（逐条读-改-写，非原子）
    pub fn for_each_update<F>(&self, collection: &str, mut f: F) -> Result<usize>
    where
        F: FnMut(&mut Record) -> anyhow::Result<()>,
    {
        let started = Instant::now();
        let spec = QuerySpec::new(collection);
        let mut total = 0usize;
        for record in self.docs.query(&spec) {
            let mut record = record?;
            let id = record.id.clone();
            self.kv.hydrate(&mut record);
            f(&mut record).map_err(|e| StoreError::Transform {
                id: id.clone(),
                reason: format!("{e:#}"),
            })?;

            let (pages, subs) = record.take_adjacency();
            self.kv.store_adjacency(&id, &pages, &subs)?;
            let written = self.docs.update_by_id(collection, &id, |slot| {
                record.id = slot.id.clone();
                *slot = record;
            });
            if !written {
                tracing::warn!("for_each_update {}: record {} vanished, update dropped", collection, id);
                continue;
            }

            total += 1;
            let every = self.config.progress_report_interval;
            if every > 0 && total as u64 % every == 0 {
                tracing::info!(
                    "Update progress: collection={} records={} elapsed={:?}",
                    collection,
                    total,
                    started.elapsed()
                );
            }
        }
        tracing::debug!("for_each_update {} took {:?}", collection, started.elapsed());
        Ok(total)
    }

    /// 按配置构造的批量重写器
    pub fn rewriter(&self, collection: &str) -> BulkRewriter<'_> {
        BulkRewriter::new(&self.docs, collection)
            .flush_threshold(self.config.flush_threshold)
            .progress_interval(self.config.progress_report_interval)
    }

    pub fn rewrite_all<F>(&self, collection: &str, transform: F) -> Result<usize>
    where
        F: FnMut(Record) -> anyhow::Result<Record>,
    {
        self.rewriter(collection).rewrite_all(transform)
    }

    // ---- 读取 ----

    pub fn query(&self, spec: &QuerySpec) -> RecordCursor {
        self.docs.query(spec)
    }

    /// 点查主集合并从 KV 装回邻接边
    pub fn get_record(&self, id: &RecordId) -> Option<Record> {
        let mut record = self.docs.find_by_id(PAGES, id)?;
        self.kv.hydrate(&mut record);
        Some(record)
    }

    pub fn home(&self) -> Option<Record> {
        self.first_by_kind(Kind::Home)
    }

    pub fn find_by_kind(&self, kind: Kind) -> Result<Vec<Record>> {
        self.docs
            .query(&QuerySpec::new(PAGES).filter(KindIn::one(kind)))
            .collect()
    }

    pub fn first_by_kind(&self, kind: Kind) -> Option<Record> {
        self.docs
            .query(&QuerySpec::new(PAGES).filter(KindIn::one(kind)).batch_size(1))
            .next()
            .and_then(|r| r.ok())
    }

    pub fn find_by_human_id(&self, human_id: &str) -> Option<Record> {
        self.docs
            .query(&QuerySpec::new(PAGES).filter(ParamIn::new(HUMAN_ID_PARAM, &[human_id])))
            .next()
            .and_then(|r| r.ok())
    }

    pub fn find_many_by_human_ids<S: AsRef<str>>(&self, human_ids: &[S]) -> Result<Vec<Record>> {
        self.docs
            .query(&QuerySpec::new(PAGES).filter(ParamIn::new(HUMAN_ID_PARAM, human_ids)))
            .collect()
    }

    // ---- 层级 ----

    pub fn assemble(&self) -> Result<AssemblyReport> {
        self.assemble_with(CancelToken::new())
    }

    /// 组装 section 树；成功后原子发布新的前缀树并清空聚合缓存
    pub fn assemble_with(&self, cancel: CancelToken) -> Result<AssemblyReport> {
        self.flush()?;
        let assembly = HierarchyBuilder::new(&self.docs, &self.kv, PAGES)
            .flush_threshold(self.config.flush_threshold)
            .progress_interval(self.config.progress_report_interval)
            .cancel(cancel)
            .assemble()?;

        self.sections.store(Arc::new(assembly.trie));
        self.cache.clear();
        *self.last_assembly.lock() = Some(assembly.report.clone());
        Ok(assembly.report)
    }

    /// 从已有 Home / Section 记录重建前缀树（打开存储时调用）
    pub fn refresh_sections(&self) -> Result<usize> {
        let spec = QuerySpec::new(PAGES).filter(KindIn(vec![Kind::Home, Kind::Section]));
        let mut builder = SectionTrieBuilder::new();
        for record in self.docs.query(&spec) {
            let record = record?;
            builder.insert(&record.sections, record.id);
        }
        let trie = builder.commit();
        let n = trie.len();
        self.sections.store(Arc::new(trie));
        Ok(n)
    }

    pub fn with_navigator<R>(&self, f: impl FnOnce(&Navigator<'_>) -> R) -> R {
        let trie = self.sections.load_full();
        let nav = Navigator::new(&self.docs, &self.kv, &self.cache, &trie, PAGES)
            .slow_threshold(self.config.slow_aggregate());
        f(&nav)
    }

    pub fn descendant_page_ids(&self, id: &RecordId) -> Vec<RecordId> {
        self.with_navigator(|nav| nav.descendant_page_ids(id))
    }

    pub fn ancestor_ids(&self, id: &RecordId) -> Vec<RecordId> {
        self.with_navigator(|nav| nav.ancestor_ids(id))
    }

    pub fn all_subsection_ids(&self, id: &RecordId) -> Vec<RecordId> {
        self.with_navigator(|nav| nav.all_subsection_ids(id))
    }

    pub fn section_for_path<S: AsRef<str>>(&self, segments: &[S]) -> Option<RecordId> {
        self.sections
            .load()
            .longest_prefix(segments)
            .map(|(_, id)| id.clone())
    }

    // ---- LitePage ----

    pub fn set_lite_page(&self, prefix: &str, id: &str, record: &Record) -> Result<()> {
        lite::put_lite_page(&self.kv, prefix, id, &LitePage::from_record(record))
    }

    pub fn lite_page_by_human_id(&self, human_id: &str) -> Option<LitePage> {
        lite::lite_page_by_human_id(&self.kv, human_id)
    }

    pub fn lite_page_by_id(&self, id: &str) -> Option<LitePage> {
        lite::lite_page_by_id(&self.kv, id)
    }

    pub fn lite_pages_by_ids<S: AsRef<str>>(&self, ids: &[S]) -> Vec<Option<LitePage>> {
        lite::lite_pages_by_ids(&self.kv, ids)
    }

    // ---- 统计 ----

    pub fn report(&self) -> StoreReport {
        let cache = self.cache.stats();
        StoreReport {
            collections: self
                .docs
                .collection_names()
                .into_iter()
                .map(|name| {
                    let n = self.docs.len(&name);
                    (name, n)
                })
                .collect(),
            pending_writes: self.pending.len(),
            kv_entries: self.kv.len(),
            term_rows: self.terms.len(),
            cache_entries: cache.entries,
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            corrupt_skipped: self.kv.corrupt_entries()
                + self.corrupt_records.load(Ordering::Relaxed),
            trie_paths: self.sections.load().len(),
            last_assembly: self.last_assembly.lock().clone(),
        }
    }
}
