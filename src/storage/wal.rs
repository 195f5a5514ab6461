use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64;

const WAL_MAGIC: u32 = 0x3156_564B; // "KVV1"
const WAL_VERSION: u32 = 1;
const WAL_FILE: &str = "kv.wal";
const SEAL_PREFIX: &str = "kv.wal.seal-";

const OP_SET: u8 = 1;

fn now_seal_id() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// WAL 中的一条 KV 操作（整值覆盖）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvOp {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Default)]
pub struct WalReplayResult {
    pub ops: Vec<KvOp>,
    pub sealed_used: usize,
    pub truncated_tail_records: usize,
}

/// Append-only KV 写日志。
///
/// - current: kv.wal
/// - sealed: kv.wal.seal-<id>（checkpoint 边界切分）
///
/// 帧格式：`len:u32 | xxh3:u64 | payload`；payload = `op:u8 | klen:u32 | key | vlen:u32 | value`。
pub struct WalStore {
    dir: PathBuf,
    current: PathBuf,
    file: Mutex<File>,
}

impl WalStore {
    pub fn open_in_dir(dir: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let current = dir.join(WAL_FILE);
        let f = open_or_init(&current)?;
        Ok(Self {
            dir,
            current,
            file: Mutex::new(f),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append(&self, ops: &[KvOp]) -> anyhow::Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut f = self.file.lock();
        for op in ops {
            let payload = encode_op(op)?;
            let len: u32 = payload.len().try_into()?;
            f.write_all(&len.to_le_bytes())?;
            f.write_all(&xxh3_64(&payload).to_le_bytes())?;
            f.write_all(&payload)?;
        }
        f.flush()?;
        Ok(())
    }

    /// seal：把当前 WAL rename 成 sealed 文件并换上新的空 WAL，返回 seal_id
    pub fn seal(&self) -> anyhow::Result<u64> {
        let mut f = self.file.lock();
        f.flush()?;
        f.sync_all()?;

        let id = now_seal_id();
        let sealed = self.dir.join(format!("{SEAL_PREFIX}{id:016x}"));
        if self.current.exists() {
            std::fs::rename(&self.current, &sealed)?;
        }
        // 锁一直持有到新文件就位，append 不会写进已 seal 的文件
        *f = open_or_init(&self.current)?;
        Ok(id)
    }

    pub fn cleanup_sealed_up_to(&self, seal_id: u64) -> anyhow::Result<usize> {
        if seal_id == 0 {
            return Ok(0);
        }
        let mut removed = 0;
        for (id, p) in self.sealed_files()? {
            if id <= seal_id && std::fs::remove_file(&p).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// 回放：只读取 seal_id > checkpoint 的 sealed WAL + 当前 WAL
    pub fn replay_since_seal(&self, checkpoint_seal_id: u64) -> anyhow::Result<WalReplayResult> {
        let mut sealed: Vec<(u64, PathBuf)> = self
            .sealed_files()?
            .into_iter()
            .filter(|(id, _)| *id > checkpoint_seal_id)
            .collect();
        sealed.sort_by_key(|(id, _)| *id);

        let mut out = WalReplayResult {
            sealed_used: sealed.len(),
            ..Default::default()
        };
        for (_, p) in sealed.iter() {
            let (mut ops, t) = read_wal_file(p)?;
            out.truncated_tail_records += t;
            out.ops.append(&mut ops);
        }
        let (mut cur, t) = read_wal_file(&self.current)?;
        out.truncated_tail_records += t;
        out.ops.append(&mut cur);

        if out.truncated_tail_records > 0 {
            tracing::warn!(
                "KV WAL replay stopped early: truncated_or_corrupt={}",
                out.truncated_tail_records
            );
        }
        Ok(out)
    }

    /// 丢弃全部日志（reset_on_open）
    pub fn reset(&self) -> anyhow::Result<()> {
        let mut f = self.file.lock();
        for (_, p) in self.sealed_files()? {
            let _ = std::fs::remove_file(p);
        }
        let _ = std::fs::remove_file(&self.current);
        *f = open_or_init(&self.current)?;
        Ok(())
    }

    fn sealed_files(&self) -> anyhow::Result<Vec<(u64, PathBuf)>> {
        let mut out = Vec::new();
        for ent in std::fs::read_dir(&self.dir)? {
            let Ok(ent) = ent else { continue };
            let p = ent.path();
            if let Some(id) = parse_seal_id(&p) {
                out.push((id, p));
            }
        }
        Ok(out)
    }
}

fn write_header(f: &mut File) -> std::io::Result<()> {
    f.write_all(&WAL_MAGIC.to_le_bytes())?;
    f.write_all(&WAL_VERSION.to_le_bytes())?;
    f.flush()
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).read(true).append(true).open(path)
}

fn open_or_init(path: &Path) -> anyhow::Result<File> {
    let exists = path.exists();
    let mut f = open_append(path)?;
    if !exists {
        write_header(&mut f)?;
        return Ok(f);
    }

    // header 不匹配（空文件/截断/历史格式）则清空重建
    let mut hdr = [0u8; 8];
    f.seek(SeekFrom::Start(0))?;
    let valid = f.read_exact(&mut hdr).is_ok()
        && u32::from_le_bytes(hdr[0..4].try_into()?) == WAL_MAGIC
        && u32::from_le_bytes(hdr[4..8].try_into()?) == WAL_VERSION;
    if !valid {
        tracing::warn!("KV WAL header invalid, truncating: {}", path.display());
        let mut nf = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        write_header(&mut nf)?;
        drop(nf);
        f = open_append(path)?;
    }
    Ok(f)
}

fn parse_seal_id(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let hex = name.strip_prefix(SEAL_PREFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

fn read_wal_file(path: &Path) -> anyhow::Result<(Vec<KvOp>, usize)> {
    if !path.exists() {
        return Ok((Vec::new(), 0));
    }
    let mut f = BufReader::new(File::open(path)?);

    let mut hdr = [0u8; 8];
    if f.read_exact(&mut hdr).is_err() {
        return Ok((Vec::new(), 0));
    }
    let magic = u32::from_le_bytes(hdr[0..4].try_into()?);
    let ver = u32::from_le_bytes(hdr[4..8].try_into()?);
    if magic != WAL_MAGIC || ver != WAL_VERSION {
        return Ok((Vec::new(), 0));
    }

    let mut out = Vec::new();
    let mut truncated_tail = 0usize;
    loop {
        let mut fh = [0u8; 12];
        if f.read_exact(&mut fh).is_err() {
            break;
        }
        let len = u32::from_le_bytes(fh[0..4].try_into()?) as usize;
        let sum = u64::from_le_bytes(fh[4..12].try_into()?);
        let mut buf = vec![0u8; len];
        if f.read_exact(&mut buf).is_err() {
            truncated_tail += 1;
            break;
        }
        if xxh3_64(&buf) != sum {
            // 校验失败：视为截断/损坏，停止读取本文件
            truncated_tail += 1;
            break;
        }
        match decode_op(&buf) {
            Some(op) => out.push(op),
            None => truncated_tail += 1,
        }
    }
    Ok((out, truncated_tail))
}

fn encode_op(op: &KvOp) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(1 + 8 + op.key.len() + op.value.len());
    out.push(OP_SET);
    for field in [&op.key, &op.value] {
        let len: u32 = field.len().try_into()?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(field.as_bytes());
    }
    Ok(out)
}

fn decode_op(buf: &[u8]) -> Option<KvOp> {
    if *buf.first()? != OP_SET {
        return None;
    }
    let mut off = 1usize;
    let mut field = || -> Option<String> {
        let len = u32::from_le_bytes(buf.get(off..off + 4)?.try_into().ok()?) as usize;
        off += 4;
        let bytes = buf.get(off..off + len)?;
        off += len;
        String::from_utf8(bytes.to_vec()).ok()
    };
    let key = field()?;
    let value = field()?;
    Some(KvOp { key, value })
}
