/// DCコンテナの読み込み
///
/// レイアウト（リトルエンディアン）:
/// - `0x00` ヘッダ `{magic, version, text_size, strings_offset, unk, num_entries, entries_ptr}`
/// - `0x28` エントリ配列 `{name_hash, type_hash, data_ptr}` × num_entries
/// - 各エントリのデータ（script-lambda、命令列、定数プール）
/// - `strings_offset` から文字列テーブル
/// - `text_size` に再配置テーブルのバイト長 `u32`、続いてビットマップ（1bit = 8バイトスロット）
///
/// 再配置は読み込み時に一度だけ行い、以降バッファは変更しない。
/// 再配置されたスロットには `image_base + offset` が入る。

use crate::decompiler::instruction::{Instruction, INSTRUCTION_SIZE};
use crate::decompiler::stack_frame::{ConstantKind, ConstantPool};
use crate::error::{DecodeError, FormatError};
use crate::sid::sid64;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, error, info};

pub const DC_MAGIC: u32 = 0x4443_3030;
pub const DC_VERSION: u32 = 1;
/// 再配置後のアドレス空間の既定ベース
pub const DEFAULT_IMAGE_BASE: u64 = 0x7F00_0000_0000;
/// script-lambdaの識別フラグ
pub const LAMBDA_FLAG: u64 = 0xDEAD_BEEF_1337_F00D;

pub const HEADER_SIZE: u64 = 0x28;
pub const ENTRY_SIZE: u64 = 24;
pub const LAMBDA_SIZE: u64 = 0x50;

const SCRIPT_LAMBDA_SID: u64 = sid64("script-lambda");

/// ファイルヘッダ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DcHeader {
    pub magic: u32,
    pub version: u32,
    pub text_size: u32,
    pub strings_offset: u32,
    pub unk: u32,
    pub num_entries: u32,
    /// エントリ配列のオフセット
    pub entries_offset: u64,
}

/// エントリ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub index: usize,
    pub name_hash: u64,
    pub type_hash: u64,
    /// データのオフセット
    pub data_offset: u64,
}

impl Entry {
    pub fn is_script_lambda(&self) -> bool {
        self.type_hash == SCRIPT_LAMBDA_SID
    }
}

/// script-lambdaレコード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptFunction {
    pub entry_index: usize,
    pub name_hash: u64,
    pub lambda_offset: u64,
    pub instructions_offset: u64,
    pub symbols_offset: u64,
    pub type_id: u64,
    pub instruction_count: usize,
    pub symbol_count: usize,
}

/// 再配置済みのDCコンテナ
pub struct DcContainer {
    bytes: Vec<u8>,
    header: DcHeader,
    image_base: u64,
    reloc_table: Vec<u8>,
    pointed_at: Vec<u8>,
}

impl DcContainer {
    pub fn from_path<P: AsRef<Path>>(path: P, image_base: u64) -> Result<Self, FormatError> {
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
        let container = Self::from_bytes_with_base(bytes, image_base)?;
        info!(
            "{}: {} entries, {} bytes",
            path.display(),
            container.header.num_entries,
            container.len()
        );
        Ok(container)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, FormatError> {
        Self::from_bytes_with_base(bytes, DEFAULT_IMAGE_BASE)
    }

    pub fn from_bytes_with_base(mut bytes: Vec<u8>, image_base: u64) -> Result<Self, FormatError> {
        if bytes.is_empty() {
            return Err(FormatError::Empty {
                path: "<buffer>".to_string(),
            });
        }
        let header = parse_header(&bytes)?;
        let reloc_table = read_reloc_table(&bytes, &header)?;
        let pointed_at = relocate(&mut bytes, &reloc_table, image_base)?;
        debug!(
            "relocated container: text_size=0x{:X} strings=0x{:X} reloc_bytes={}",
            header.text_size,
            header.strings_offset,
            reloc_table.len()
        );
        Ok(Self {
            bytes,
            header,
            image_base,
            reloc_table,
            pointed_at,
        })
    }

    pub fn header(&self) -> &DcHeader {
        &self.header
    }

    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// 再配置後のバイト列
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// そのオフセットの8バイトが再配置されたポインタか
    pub fn is_relocated_pointer(&self, offset: u64) -> bool {
        if offset % 8 != 0 || offset >= self.bytes.len() as u64 {
            return false;
        }
        bit_is_set(&self.reloc_table, offset / 8)
    }

    /// そのオフセットが他の再配置スロットから指されているか
    pub fn gets_pointed_at(&self, offset: u64) -> bool {
        bit_is_set(&self.pointed_at, offset / 8)
    }

    /// オフセットが文字列テーブル内か
    pub fn is_string(&self, offset: u64) -> bool {
        offset >= self.header.strings_offset as u64 && offset < self.header.text_size as u64
    }

    /// そのスロットが文字列テーブルを指すポインタか
    pub fn points_into_string_table(&self, offset: u64) -> bool {
        self.pointer_target(offset)
            .map(|target| self.is_string(target))
            .unwrap_or(false)
    }

    /// 再配置スロットの指す先のオフセット
    pub fn pointer_target(&self, offset: u64) -> Option<u64> {
        if !self.is_relocated_pointer(offset) {
            return None;
        }
        let address = read_u64(&self.bytes, offset)?;
        self.to_offset(address)
    }

    /// アドレス → オフセット
    pub fn to_offset(&self, address: u64) -> Option<u64> {
        let offset = address.checked_sub(self.image_base)?;
        (offset <= self.bytes.len() as u64).then_some(offset)
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64, FormatError> {
        read_u64(&self.bytes, offset).ok_or(FormatError::Truncated {
            what: "u64 read",
            offset,
            needed: 8,
            len: self.bytes.len() as u64,
        })
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32, FormatError> {
        read_u32(&self.bytes, offset).ok_or(FormatError::Truncated {
            what: "u32 read",
            offset,
            needed: 4,
            len: self.bytes.len() as u64,
        })
    }

    /// NUL終端文字列。改行は空白に置き換える
    pub fn c_string_at(&self, offset: u64) -> Option<String> {
        let start = usize::try_from(offset).ok()?;
        let tail = self.bytes.get(start..)?;
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        let text = String::from_utf8_lossy(&tail[..end]);
        Some(text.replace('\n', " "))
    }

    /// 再配置前のバイト列を復元
    pub fn get_unmapped(&self) -> Vec<u8> {
        let mut unmapped = self.bytes.clone();
        for slot in 0..self.reloc_table.len() as u64 * 8 {
            if !bit_is_set(&self.reloc_table, slot) {
                continue;
            }
            let at = (slot * 8) as usize;
            if let Some(raw) = unmapped.get_mut(at..at + 8) {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(raw);
                let offset = u64::from_le_bytes(buf).wrapping_sub(self.image_base);
                raw.copy_from_slice(&offset.to_le_bytes());
            }
        }
        unmapped
    }

    /// エントリ配列
    pub fn entries(&self) -> Result<Vec<Entry>, FormatError> {
        (0..self.header.num_entries as usize)
            .map(|index| {
                let at = self.header.entries_offset + index as u64 * ENTRY_SIZE;
                let data_slot = at + 16;
                let data_offset = self.pointer_target(data_slot).ok_or(FormatError::RelocationOutOfRange {
                    slot: data_slot,
                    target: self.read_u64(data_slot).unwrap_or(0),
                })?;
                Ok(Entry {
                    index,
                    name_hash: self.read_u64(at)?,
                    type_hash: self.read_u64(at + 8)?,
                    data_offset,
                })
            })
            .collect()
    }

    /// script-lambdaレコードの読み込み
    pub fn script_function(&self, entry: &Entry) -> Result<ScriptFunction, DecodeError> {
        let at = entry.data_offset;
        let malformed = |reason: &str| DecodeError::MalformedLambda {
            offset: at,
            reason: reason.to_string(),
        };
        if !entry.is_script_lambda() {
            return Err(malformed("entry is not a script-lambda"));
        }
        if at.checked_add(LAMBDA_SIZE).map_or(true, |end| end > self.bytes.len() as u64) {
            return Err(malformed("record extends past the end of the container"));
        }
        if read_u64(&self.bytes, at + 0x28) != Some(LAMBDA_FLAG) {
            return Err(malformed("missing 0xDEADBEEF1337F00D flag"));
        }

        let instructions_offset = self
            .pointer_target(at)
            .ok_or_else(|| malformed("instruction pointer is not relocated"))?;
        let symbols_offset = self
            .pointer_target(at + 8)
            .ok_or_else(|| malformed("symbol table pointer is not relocated"))?;
        if symbols_offset < instructions_offset {
            return Err(malformed("symbol table precedes instructions"));
        }
        let instruction_count = ((symbols_offset - instructions_offset) / INSTRUCTION_SIZE as u64) as usize;

        let type_id = read_u64(&self.bytes, at + 0x10).unwrap_or(0);
        let sum = read_u64(&self.bytes, at + 0x18).unwrap_or(0);
        let symbol_count = self.symbol_count(symbols_offset, instruction_count, sum);

        Ok(ScriptFunction {
            entry_index: entry.index,
            name_hash: entry.name_hash,
            lambda_offset: at,
            instructions_offset,
            symbols_offset,
            type_id,
            instruction_count,
            symbol_count,
        })
    }

    /// `sum = 12 + 4 * (命令数 + スロット数)`。矛盾する場合は次に指されている位置まで
    fn symbol_count(&self, symbols_offset: u64, instruction_count: usize, sum: u64) -> usize {
        let limit = self.header.strings_offset as u64;
        let from_sum = sum
            .checked_sub(12)
            .filter(|n| n % 4 == 0)
            .and_then(|n| (n / 4).checked_sub(instruction_count as u64))
            .filter(|&n| {
                n.checked_mul(8)
                    .and_then(|bytes| symbols_offset.checked_add(bytes))
                    .is_some_and(|end| end <= limit)
            });
        if let Some(count) = from_sum {
            return count as usize;
        }

        let mut count = 0u64;
        let mut cursor = symbols_offset;
        while let Some(next) = cursor.checked_add(8).filter(|&next| next <= limit) {
            if count > 0 && self.gets_pointed_at(cursor) {
                break;
            }
            count += 1;
            cursor = next;
        }
        count as usize
    }

    /// script-lambdaのエントリをすべて。壊れたレコードはログに残して飛ばす
    pub fn script_functions(&self) -> crate::error::Result<Vec<ScriptFunction>> {
        let mut functions = Vec::new();
        for entry in self.entries()?.iter().filter(|e| e.is_script_lambda()) {
            match self.script_function(entry) {
                Ok(function) => functions.push(function),
                Err(source) => {
                    let error = crate::error::DecompileError::Decode {
                        function: crate::sid::format_unresolved(entry.name_hash),
                        source,
                    };
                    error!("skipping entry {}: {}", entry.index, error);
                }
            }
        }
        Ok(functions)
    }

    /// 命令列のデコード
    pub fn instructions(&self, function: &ScriptFunction) -> Result<Vec<Instruction>, DecodeError> {
        let start = function.instructions_offset as usize;
        let end = start + function.instruction_count * INSTRUCTION_SIZE;
        let raw = self.bytes.get(start..end).ok_or(DecodeError::MalformedLambda {
            offset: function.lambda_offset,
            reason: "instructions extend past the end of the container".to_string(),
        })?;
        raw.chunks_exact(INSTRUCTION_SIZE)
            .enumerate()
            .map(|(line, chunk)| Instruction::decode(chunk, line))
            .collect()
    }

    /// 定数プール
    pub fn constant_pool(&self, function: &ScriptFunction) -> ConstantPool {
        let mut pool = ConstantPool::new(function.symbols_offset);
        for slot in 0..function.symbol_count as u64 {
            let offset = function.symbols_offset + slot * 8;
            let Some(raw) = read_u64(&self.bytes, offset) else {
                break;
            };
            let kind = match self.pointer_target(offset) {
                Some(target) if self.is_string(target) => {
                    ConstantKind::String(self.c_string_at(target).unwrap_or_default())
                }
                Some(target) => ConstantKind::Pointer { target },
                None => ConstantKind::Value,
            };
            pool.push(raw, kind);
        }
        pool
    }
}

fn parse_header(bytes: &[u8]) -> Result<DcHeader, FormatError> {
    let truncated = |what: &'static str, offset: u64, needed: u64| FormatError::Truncated {
        what,
        offset,
        needed,
        len: bytes.len() as u64,
    };
    let magic = read_u32(bytes, 0).ok_or(truncated("header magic", 0, 4))?;
    if magic != DC_MAGIC {
        return Err(FormatError::BadMagic { found: magic });
    }
    let version = read_u32(bytes, 4).ok_or(truncated("header version", 4, 4))?;
    if version != DC_VERSION {
        return Err(FormatError::BadVersion { found: version });
    }
    if (bytes.len() as u64) < HEADER_SIZE {
        return Err(truncated("header", 0, HEADER_SIZE));
    }
    let header = DcHeader {
        magic,
        version,
        text_size: read_u32(bytes, 0x8).unwrap_or(0),
        strings_offset: read_u32(bytes, 0xC).unwrap_or(0),
        unk: read_u32(bytes, 0x10).unwrap_or(0),
        num_entries: read_u32(bytes, 0x14).unwrap_or(0),
        entries_offset: read_u64(bytes, 0x18).unwrap_or(0),
    };
    let entries_end = header
        .entries_offset
        .saturating_add(header.num_entries as u64 * ENTRY_SIZE);
    if entries_end > bytes.len() as u64 {
        return Err(truncated("entry table", header.entries_offset, entries_end - header.entries_offset));
    }
    Ok(header)
}

fn read_reloc_table(bytes: &[u8], header: &DcHeader) -> Result<Vec<u8>, FormatError> {
    let at = header.text_size as u64;
    let size = read_u32(bytes, at).ok_or(FormatError::Truncated {
        what: "relocation table size",
        offset: at,
        needed: 4,
        len: bytes.len() as u64,
    })?;
    if size == 0 {
        return Err(FormatError::Truncated {
            what: "relocation table",
            offset: at + 4,
            needed: 1,
            len: 0,
        });
    }
    let start = (at + 4) as usize;
    bytes
        .get(start..start + size as usize)
        .map(<[u8]>::to_vec)
        .ok_or(FormatError::Truncated {
            what: "relocation table",
            offset: at + 4,
            needed: size as u64,
            len: bytes.len() as u64,
        })
}

/// 再配置を適用し、指されている位置のビットマップを返す
fn relocate(bytes: &mut [u8], reloc_table: &[u8], image_base: u64) -> Result<Vec<u8>, FormatError> {
    let len = bytes.len() as u64;
    let mut pointed_at = vec![0u8; (len as usize / 64) + 1];
    for slot in 0..reloc_table.len() as u64 * 8 {
        if !bit_is_set(reloc_table, slot) {
            continue;
        }
        let at = slot * 8;
        let offset = read_u64(bytes, at).ok_or(FormatError::Truncated {
            what: "relocation slot",
            offset: at,
            needed: 8,
            len,
        })?;
        if offset > len {
            return Err(FormatError::RelocationOutOfRange { slot: at, target: offset });
        }
        let address = image_base.wrapping_add(offset);
        bytes[at as usize..at as usize + 8].copy_from_slice(&address.to_le_bytes());
        pointed_at[(offset / 64) as usize] |= 1 << ((offset / 8) % 8);
    }
    Ok(pointed_at)
}

fn bit_is_set(bitmap: &[u8], bit: u64) -> bool {
    bitmap
        .get((bit / 8) as usize)
        .map(|byte| byte & (1 << (bit % 8)) != 0)
        .unwrap_or(false)
}

fn read_u64(bytes: &[u8], offset: u64) -> Option<u64> {
    let start = usize::try_from(offset).ok()?;
    let raw = bytes.get(start..start.checked_add(8)?)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(raw);
    Some(u64::from_le_bytes(buf))
}

fn read_u32(bytes: &[u8], offset: u64) -> Option<u32> {
    let start = usize::try_from(offset).ok()?;
    let raw = bytes.get(start..start.checked_add(4)?)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(raw);
    Some(u32::from_le_bytes(buf))
}


#[cfg(test)]
mod tests {
    use super::tests_support::{ImageBuilder, SymbolImage};
    use super::*;
    use crate::decompiler::instruction::Opcode;

    fn sample_image() -> Vec<u8> {
        ImageBuilder::new()
            .function(
                "first",
                &[
                    Instruction::new(Opcode::LoadStaticPointer, 0, 1, 0),
                    Instruction::new(Opcode::Return, 0, 0, 0),
                ],
                vec![SymbolImage::Value(42), SymbolImage::Str("line\nbreak".to_string())],
            )
            .function(
                "second",
                &[Instruction::new(Opcode::Return, 49, 0, 0)],
                vec![],
            )
            .build()
    }

    #[test]
    fn test_relocation_roundtrip() -> anyhow::Result<()> {
        let raw = sample_image();
        let container = DcContainer::from_bytes(raw.clone())?;
        assert_ne!(container.bytes(), raw.as_slice());
        assert_eq!(container.get_unmapped(), raw);
        Ok(())
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut raw = sample_image();
        raw[0] = 0;
        assert!(matches!(
            DcContainer::from_bytes(raw),
            Err(FormatError::BadMagic { found: 0x4443_3000 })
        ));

        let mut raw = sample_image();
        raw[4] = 2;
        assert!(matches!(
            DcContainer::from_bytes(raw),
            Err(FormatError::BadVersion { found: 2 })
        ));
    }

    #[test]
    fn test_empty_and_truncated() {
        assert!(matches!(DcContainer::from_bytes(Vec::new()), Err(FormatError::Empty { .. })));

        let mut raw = sample_image();
        raw.truncate(0x30);
        assert!(matches!(DcContainer::from_bytes(raw), Err(FormatError::Truncated { .. })));
    }

    #[test]
    fn test_pointer_queries() -> anyhow::Result<()> {
        let container = DcContainer::from_bytes(sample_image())?;
        // entries_ptr
        assert!(container.is_relocated_pointer(0x18));
        assert!(!container.is_relocated_pointer(0x10));
        assert!(!container.is_relocated_pointer(0x19));
        assert_eq!(container.pointer_target(0x18), Some(HEADER_SIZE));
        assert!(container.gets_pointed_at(HEADER_SIZE));

        let first = &container.script_functions()?[0];
        let string_slot = first.symbols_offset + 8;
        assert!(container.points_into_string_table(string_slot));
        assert!(!container.points_into_string_table(first.symbols_offset));
        let target = container.pointer_target(string_slot).unwrap_or(0);
        assert!(container.is_string(target));
        Ok(())
    }

    #[test]
    fn test_entries_and_functions() -> anyhow::Result<()> {
        let container = DcContainer::from_bytes(sample_image())?;
        let entries = container.entries()?;
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(Entry::is_script_lambda));
        assert_eq!(entries[1].name_hash, sid64("second"));

        let functions = container.script_functions()?;
        assert_eq!(functions[0].instruction_count, 2);
        assert_eq!(functions[0].symbol_count, 2);
        assert_eq!(functions[0].type_id, sid64("function"));
        assert_eq!(functions[1].instruction_count, 1);
        assert_eq!(functions[1].symbol_count, 0);

        let instructions = container.instructions(&functions[0])?;
        assert_eq!(instructions[0].opcode, Opcode::LoadStaticPointer);
        assert_eq!(instructions[1].opcode, Opcode::Return);

        let pool = container.constant_pool(&functions[0]);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(0).map(|c| c.raw), Some(42));
        // 改行は読み出し時に空白へ
        assert_eq!(pool.get(1).and_then(|c| c.as_str()), Some("line break"));
        Ok(())
    }

    #[test]
    fn test_overflowing_sum_falls_back_to_scan() -> anyhow::Result<()> {
        let mut raw = sample_image();
        let container = DcContainer::from_bytes(raw.clone())?;
        let first = container.script_functions()?[0];
        let sum_at = (first.lambda_offset + 0x18) as usize;
        raw[sum_at..sum_at + 8].copy_from_slice(&0xFFFF_FFFF_FFFF_FFF0u64.to_le_bytes());

        let container = DcContainer::from_bytes(raw)?;
        let entries = container.entries()?;
        let function = container.script_function(&entries[0])?;
        assert_eq!(function.instruction_count, 2);
        assert!(function.symbol_count >= 2 && function.symbol_count < 8);
        Ok(())
    }

    #[test]
    fn test_malformed_lambda_is_skipped() -> anyhow::Result<()> {
        let mut raw = sample_image();
        let container = DcContainer::from_bytes(raw.clone())?;
        let second = container.script_functions()?[1];
        let flag_at = (second.lambda_offset + 0x28) as usize;
        raw[flag_at..flag_at + 8].copy_from_slice(&0u64.to_le_bytes());

        let container = DcContainer::from_bytes(raw)?;
        let entries = container.entries()?;
        assert!(matches!(
            container.script_function(&entries[1]),
            Err(DecodeError::MalformedLambda { .. })
        ));
        let functions = container.script_functions()?;
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].name_hash, sid64("first"));
        Ok(())
    }

    #[test]
    fn test_unknown_opcode_is_per_function() -> anyhow::Result<()> {
        let mut raw = sample_image();
        let container = DcContainer::from_bytes(raw.clone())?;
        let second = container.script_functions()?[1];
        raw[second.instructions_offset as usize] = 0xF0;

        let container = DcContainer::from_bytes(raw)?;
        let functions = container.script_functions()?;
        assert!(container.instructions(&functions[0]).is_ok());
        assert_eq!(
            container.instructions(&functions[1]),
            Err(DecodeError::UnknownOpcode { line: 0, byte: 0xF0 })
        );
        Ok(())
    }
}
