use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

use crate::core::Record;
use crate::index::term::WeightedTermEntry;

/// 镜像文件 Header
const MAGIC: u32 = 0x5053_0001; // "PS" + v1
const VERSION_CURRENT: u32 = 1;
const STATE_COMMITTED: u32 = 0x0000_0001;
const STATE_INCOMPLETE: u32 = 0xFFFF_FFFF;
const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 8; // magic + version + state + data_len + checksum

/// 一个集合的镜像：记录以 JSON 文本保存（params 是任意 JSON 值，bincode 无法自描述）
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ImageCollection {
    pub name: String,
    pub records: Vec<String>,
}

/// 整库镜像
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreImage {
    pub collections: Vec<ImageCollection>,
    pub terms: Vec<WeightedTermEntry>,
    pub kv: Vec<(String, String)>,
    /// 镜像覆盖到的 KV WAL seal 边界；大于它的 sealed 文件与当前 WAL 需要回放
    pub kv_seal_id: u64,
}

impl StoreImage {
    pub fn push_collection(&mut self, name: &str, records: &[Record]) -> anyhow::Result<()> {
        let records = records
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        self.collections.push(ImageCollection {
            name: name.to_string(),
            records,
        });
        Ok(())
    }

    pub fn record_count(&self) -> usize {
        self.collections.iter().map(|c| c.records.len()).sum()
    }
}

impl ImageCollection {
    /// 解码记录；单条损坏只跳过并计数，不影响其余记录
    pub fn decode(&self) -> (Vec<Record>, usize) {
        let mut out = Vec::with_capacity(self.records.len());
        let mut skipped = 0usize;
        for (i, raw) in self.records.iter().enumerate() {
            match serde_json::from_str::<Record>(raw) {
                Ok(r) => out.push(r),
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(
                        "Snapshot record skipped: collection={} index={} err={}",
                        self.name,
                        i,
                        e
                    );
                }
            }
        }
        (out, skipped)
    }
}

/// 原子快照存储（atomic replacement）
///
/// 落盘流程：
/// 1) 写 store.db.tmp 的 INCOMPLETE header（len/checksum 先置 0）
/// 2) `bincode::serialize_into` 流式写 body，并边写边计算 checksum / data_len
/// 3) seek 回开头覆盖 COMMITTED header
/// 4) fsync(tmpfile)
/// 5) rename(tmp, target)
/// 6) fsync(dir)
///
/// 加载时校验 magic + version + state + data_len + checksum，任何不一致都视为没有快照。
pub struct SnapshotStore {
    path: PathBuf,
}

struct ChecksumWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: Xxh3,
    bytes: u64,
}

impl<'a, W: Write> ChecksumWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: Xxh3::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (u64, u64) {
        (self.bytes, self.hasher.digest())
    }
}

impl<'a, W: Write> Write for ChecksumWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn encode_header(state: u32, data_len: u64, checksum: u64) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&VERSION_CURRENT.to_le_bytes());
    header[8..12].copy_from_slice(&state.to_le_bytes());
    header[12..20].copy_from_slice(&data_len.to_le_bytes());
    header[20..28].copy_from_slice(&checksum.to_le_bytes());
    header
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载快照（校验 magic/version/state/checksum）；任何不一致返回 None
    pub async fn load_if_valid(&self) -> anyhow::Result<Option<StoreImage>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let data = fs::read(&self.path).await?;
        if data.len() < HEADER_SIZE {
            tracing::warn!("Snapshot too small, ignoring");
            return Ok(None);
        }

        let magic = u32::from_le_bytes(data[0..4].try_into()?);
        let version = u32::from_le_bytes(data[4..8].try_into()?);
        let state = u32::from_le_bytes(data[8..12].try_into()?);
        let data_len = u64::from_le_bytes(data[12..20].try_into()?);
        let stored_checksum = u64::from_le_bytes(data[20..28].try_into()?);

        if magic != MAGIC {
            tracing::warn!("Snapshot magic mismatch: {:#x} != {:#x}", magic, MAGIC);
            return Ok(None);
        }
        if version != VERSION_CURRENT {
            tracing::warn!("Snapshot version mismatch: {} != {}", version, VERSION_CURRENT);
            return Ok(None);
        }
        if state != STATE_COMMITTED {
            tracing::warn!("Snapshot state INCOMPLETE, ignoring");
            return Ok(None);
        }

        let body = &data[HEADER_SIZE..];
        if body.len() as u64 != data_len {
            tracing::warn!("Snapshot data length mismatch");
            return Ok(None);
        }

        let computed = xxh3_64(body);
        if computed != stored_checksum {
            tracing::warn!(
                "Snapshot checksum mismatch: {:#x} != {:#x}",
                computed,
                stored_checksum
            );
            return Ok(None);
        }

        match bincode::deserialize::<StoreImage>(body) {
            Ok(image) => Ok(Some(image)),
            Err(e) => {
                tracing::warn!("Snapshot deserialize failed: {}", e);
                Ok(None)
            }
        }
    }

    /// 原子写入快照
    pub async fn write_atomic(&self, image: &StoreImage) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.path.with_extension("db.tmp");

        // 先写 INCOMPLETE header，再流式写 body，避免整份镜像先序列化进一个巨型 Vec
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&encode_header(STATE_INCOMPLETE, 0, 0))?;

        let (data_len, checksum) = {
            let mut buffered = BufWriter::new(&mut file);
            let mut cw = ChecksumWriter::new(&mut buffered);
            bincode::serialize_into(&mut cw, image)?;
            cw.flush()?;
            let out = cw.finish();
            buffered.flush()?;
            out
        };

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&encode_header(STATE_COMMITTED, data_len, checksum))?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        tracing::info!(
            "Snapshot written: {} records, {} terms, {} kv entries, {} bytes",
            image.record_count(),
            image.terms.len(),
            image.kv.len(),
            HEADER_SIZE as u64 + data_len
        );
        Ok(())
    }

    /// 删除镜像（reset_on_open）
    pub async fn remove(&self) -> anyhow::Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).await?;
        }
        Ok(())
    }
}
