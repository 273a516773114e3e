/// SID（64bit文字列ハッシュ）の計算と名前解決
///
/// 名前の実体は外部のsidbaseファイル（ハッシュでソート済みのテーブル）にあり、
/// ここではそれを二分探索で引き、結果をプロセス内キャッシュに保持する。

use crate::error::FormatError;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::debug;

const FNV_OFFSET_BASIS: u64 = 0xCBF2_9CE4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

/// FNV-1a 64bit
pub const fn sid64(name: &str) -> u64 {
    let bytes = name.as_bytes();
    let mut hash = FNV_OFFSET_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        hash = FNV_PRIME.wrapping_mul(hash ^ bytes[i] as u64);
        i += 1;
    }
    hash
}

/// 未解決ハッシュの表記 `#XXXXXXXXXXXXXXXX`
pub fn format_unresolved(hash: u64) -> String {
    format!("#{:016X}", hash)
}

/// ハッシュ → 名前 の検索
pub trait SidLookup: Send + Sync {
    fn lookup(&self, hash: u64) -> Option<&str>;
}

/// メモリ上のSIDテーブル
#[derive(Debug, Clone, Default)]
pub struct SidTable {
    names: HashMap<u64, String>,
}

impl SidTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str) -> u64 {
        let hash = sid64(name);
        self.names.insert(hash, name.to_string());
        hash
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// コンテナ形式とエンジン組み込み関数で必ず現れる名前
    pub fn builtin() -> Self {
        [
            "array",
            "script-lambda",
            "function",
            "global",
            "self",
            "player",
            "get-int32",
            "get-boolean",
        ]
        .into_iter()
        .collect()
    }
}

impl<'a> FromIterator<&'a str> for SidTable {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut table = SidTable::new();
        for name in iter {
            table.insert(name);
        }
        table
    }
}

impl SidLookup for SidTable {
    fn lookup(&self, hash: u64) -> Option<&str> {
        self.names.get(&hash).map(String::as_str)
    }
}

/// sidbaseファイル
///
/// レイアウト: `u64 count`、続いて `{hash: u64, offset: u64}` × count（hash昇順）。
/// offsetはファイル先頭からのNUL終端文字列の位置。
pub struct SidBase {
    bytes: Vec<u8>,
    count: usize,
}

impl SidBase {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, FormatError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| FormatError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if bytes.is_empty() {
            return Err(FormatError::Empty {
                path: path.display().to_string(),
            });
        }
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, FormatError> {
        let count = read_u64(&bytes, 0).ok_or(FormatError::Truncated {
            what: "sidbase count",
            offset: 0,
            needed: 8,
            len: bytes.len() as u64,
        })? as usize;

        let needed = count
            .checked_mul(16)
            .and_then(|n| n.checked_add(8))
            .ok_or(FormatError::Truncated {
                what: "sidbase entries",
                offset: 8,
                needed: u64::MAX,
                len: bytes.len() as u64,
            })?;
        if needed > bytes.len() {
            return Err(FormatError::Truncated {
                what: "sidbase entries",
                offset: 8,
                needed: needed as u64,
                len: bytes.len() as u64,
            });
        }

        debug!("sidbase loaded: {} entries", count);
        Ok(Self { bytes, count })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn entry(&self, index: usize) -> Option<(u64, u64)> {
        let at = 8 + index * 16;
        Some((read_u64(&self.bytes, at)?, read_u64(&self.bytes, at + 8)?))
    }

    /// 最小のハッシュ値（これ未満の値はSIDとみなさない）
    pub fn lowest_sid(&self) -> Option<u64> {
        self.entry(0).map(|(hash, _)| hash)
    }

    fn name_at(&self, offset: u64) -> Option<&str> {
        let start = usize::try_from(offset).ok()?;
        let tail = self.bytes.get(start..)?;
        let end = tail.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&tail[..end]).ok()
    }
}

impl SidLookup for SidBase {
    fn lookup(&self, hash: u64) -> Option<&str> {
        let mut low = 0usize;
        let mut high = self.count;
        while low < high {
            let mid = low + (high - low) / 2;
            let (current, offset) = self.entry(mid)?;
            if current == hash {
                return self.name_at(offset);
            }
            if current < hash {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        None
    }
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    let raw = bytes.get(at..at.checked_add(8)?)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(raw);
    Some(u64::from_le_bytes(buf))
}

/// キャッシュ付きSIDリゾルバ
///
/// 複数スレッドから同時に参照される。見つからなかったハッシュもキャッシュする。
pub struct SidResolver {
    backend: Option<Box<dyn SidLookup>>,
    builtin: SidTable,
    cache: RwLock<HashMap<u64, Option<Arc<str>>>>,
}

impl SidResolver {
    /// 組み込み名だけで解決するリゾルバ
    pub fn new() -> Self {
        Self {
            backend: None,
            builtin: SidTable::builtin(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_backend(backend: Box<dyn SidLookup>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new()
        }
    }

    /// 名前が見つかればその名前
    pub fn lookup(&self, hash: u64) -> Option<Arc<str>> {
        if let Ok(cache) = self.cache.read() {
            if let Some(name) = cache.get(&hash) {
                return name.clone();
            }
        }

        let name: Option<Arc<str>> = self
            .backend
            .as_ref()
            .and_then(|backend| backend.lookup(hash))
            .or_else(|| self.builtin.lookup(hash))
            .map(Arc::from);

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(hash, name.clone());
        }
        name
    }

    /// 名前、見つからなければ `#XXXXXXXXXXXXXXXX`
    pub fn resolve(&self, hash: u64) -> Arc<str> {
        self.lookup(hash)
            .unwrap_or_else(|| Arc::from(format_unresolved(hash)))
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().map(|cache| cache.len()).unwrap_or(0)
    }
}

impl Default for SidResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) fn sidbase_bytes(names: &[&str]) -> Vec<u8> {
    let mut entries: Vec<(u64, &str)> = names.iter().map(|n| (sid64(n), *n)).collect();
    entries.sort_by_key(|(hash, _)| *hash);

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    let mut string_offset = 8 + entries.len() * 16;
    for (hash, name) in &entries {
        bytes.extend_from_slice(&hash.to_le_bytes());
        bytes.extend_from_slice(&(string_offset as u64).to_le_bytes());
        string_offset += name.len() + 1;
    }
    for (_, name) in &entries {
        bytes.extend_from_slice(name.as_bytes());
        bytes.push(0);
    }
    bytes
}
