/// エラー分類
///
/// - `FormatError`: コンテナ全体が読めない（処理はそこで停止）
/// - `DecodeError`: 1関数だけが読めない（バッチは次の関数へ進む）
/// - `AnalysisInconsistency`: 警告として記録し、構造化を諦めて平坦なブロックを出力

use std::path::PathBuf;
use thiserror::Error;

/// コンテナ読み込み時のエラー
#[derive(Error, Debug)]
pub enum FormatError {
    /// 空のファイル
    #[error("{path} is empty")]
    Empty { path: String },

    /// マジックナンバー不一致
    #[error("not a DC-file. magic number 0x{found:08X} doesn't equal 0x44433030")]
    BadMagic { found: u32 },

    /// バージョン不一致
    #[error("not a DC-file. version number {found} doesn't equal 1")]
    BadVersion { found: u32 },

    /// 読み込み範囲がバッファ外
    #[error("truncated container: {what} needs 0x{needed:X} bytes at 0x{offset:X}, buffer has 0x{len:X}")]
    Truncated {
        what: &'static str,
        offset: u64,
        needed: u64,
        len: u64,
    },

    /// 再配置スロットの格納値がバッファ外を指している
    #[error("relocation slot 0x{slot:X} points outside the container (offset 0x{target:X})")]
    RelocationOutOfRange { slot: u64, target: u64 },

    /// ファイル読み込み失敗
    #[error("couldn't open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// 関数単位のデコードエラー
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown opcode 0x{byte:02X} at line {line}")]
    UnknownOpcode { line: usize, byte: u8 },

    #[error("register r{register} out of range at line {line}")]
    RegisterOutOfRange { line: usize, register: u8 },

    #[error("symbol table slot {slot} out of range at line {line} (table has {len} slots)")]
    SymbolSlotOutOfRange { line: usize, slot: u8, len: usize },

    #[error("branch target {target} out of range at line {line} (function has {len} lines)")]
    BranchTargetOutOfRange { line: usize, target: u32, len: usize },

    #[error("function has no instructions")]
    EmptyFunction,

    /// script-lambdaレコードが壊れている
    #[error("malformed script lambda at 0x{offset:X}: {reason}")]
    MalformedLambda { offset: u64, reason: String },
}

/// 解析の不整合（致命的ではない）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisInconsistency {
    #[error("function has no terminal Return node")]
    MissingTerminal,

    #[error("branch at node {node} has no resolvable postdominator")]
    UnresolvedMerge { node: usize },

    #[error("loop head {head} produces statements that cannot live in a condition")]
    ImpureLoopCondition { head: usize },

    #[error("offset arithmetic overflowed at line {line}")]
    OffsetOverflow { line: usize },
}

/// ライブラリ全体のエラー
#[derive(Error, Debug)]
pub enum DecompileError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("failed to decode {function}: {source}")]
    Decode {
        function: String,
        #[source]
        source: DecodeError,
    },
}

pub type Result<T, E = DecompileError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = FormatError::BadMagic { found: 0x1234 };
        assert_eq!(
            err.to_string(),
            "not a DC-file. magic number 0x00001234 doesn't equal 0x44433030"
        );

        let err = DecompileError::Decode {
            function: "foo".to_string(),
            source: DecodeError::UnknownOpcode { line: 3, byte: 0xFF },
        };
        assert_eq!(err.to_string(), "failed to decode foo: unknown opcode 0xFF at line 3");
    }
}
