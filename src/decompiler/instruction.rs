/// DC-Script命令
///
/// 1命令は8バイト固定 `{opcode, dest, op1, op2, padding: u32}`。
/// オペランドの意味（レジスタ / 即値 / 定数プールのスロット）はオペコードごとに決まる。

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 論理レジスタ数
pub const REGISTER_COUNT: usize = 128;
/// 引数レジスタの先頭（arg_0）
pub const ARGUMENT_REGISTER_START: u8 = 49;
/// 引数レジスタの終端（排他的）
pub const ARGUMENT_REGISTER_END: u8 = 70;
/// 命令のバイトサイズ
pub const INSTRUCTION_SIZE: usize = 8;

/// オペコード（全96種類、値は命令バイトそのもの）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    Return = 0,
    // 整数・浮動小数点算術
    IAdd = 1,
    ISub = 2,
    IMul = 3,
    IDiv = 4,
    FAdd = 5,
    FSub = 6,
    FMul = 7,
    FDiv = 8,
    // 定数プール読み込み
    LoadStaticInt = 9,
    LoadStaticFloat = 10,
    LoadStaticPointer = 11,
    LoadU16Imm = 12,
    // メモリ読み込み
    LoadU32 = 13,
    LoadFloat = 14,
    LoadPointer = 15,
    // メモリ書き込み（旧形式）
    StoreInt = 16,
    StoreFloat = 17,
    StorePointer = 18,
    // シンボル参照
    LookupInt = 19,
    LookupFloat = 20,
    LookupPointer = 21,
    MoveInt = 22,
    MoveFloat = 23,
    MovePointer = 24,
    CastInteger = 25,
    CastFloat = 26,
    Call = 27,
    CallFf = 28,
    // 比較
    IEqual = 29,
    IGreaterThan = 30,
    IGreaterThanEqual = 31,
    ILessThan = 32,
    ILessThanEqual = 33,
    FEqual = 34,
    FGreaterThan = 35,
    FGreaterThanEqual = 36,
    FLessThan = 37,
    FLessThanEqual = 38,
    IMod = 39,
    FMod = 40,
    IAbs = 41,
    FAbs = 42,
    // 制御フロー
    GoTo = 43,
    Label = 44,
    Branch = 45,
    BranchIf = 46,
    BranchIfNot = 47,
    // 論理・ビット演算
    OpLogNot = 48,
    OpBitAnd = 49,
    OpBitNot = 50,
    OpBitOr = 51,
    OpBitXor = 52,
    OpBitNor = 53,
    OpLogAnd = 54,
    OpLogOr = 55,
    INeg = 56,
    FNeg = 57,
    LoadParamCnt = 58,
    // 即値演算
    IAddImm = 59,
    ISubImm = 60,
    IMulImm = 61,
    IDivImm = 62,
    LoadStaticI32Imm = 63,
    LoadStaticFloatImm = 64,
    LoadStaticPointerImm = 65,
    IntAsh = 66,
    Move = 67,
    LoadStaticU32Imm = 68,
    LoadStaticI8Imm = 69,
    LoadStaticU8Imm = 70,
    LoadStaticI16Imm = 71,
    LoadStaticU16Imm = 72,
    LoadStaticI64Imm = 73,
    LoadStaticU64Imm = 74,
    // 幅指定メモリ読み込み
    LoadI8 = 75,
    LoadU8 = 76,
    LoadI16 = 77,
    LoadU16 = 78,
    LoadI32 = 79,
    LoadI64 = 80,
    LoadU64 = 81,
    // 幅指定メモリ書き込み
    StoreI8 = 82,
    StoreU8 = 83,
    StoreI16 = 84,
    StoreU16 = 85,
    StoreI32 = 86,
    StoreU32 = 87,
    StoreI64 = 88,
    StoreU64 = 89,
    INotEqual = 90,
    FNotEqual = 91,
    StoreArray = 92,
    AssertPointer = 93,
    BreakFlag = 94,
    Breakpoint = 95,
}

use Opcode::*;

const OPCODE_TABLE: [(Opcode, &str); 96] = [
    (Return, "Return"),
    (IAdd, "IAdd"),
    (ISub, "ISub"),
    (IMul, "IMul"),
    (IDiv, "IDiv"),
    (FAdd, "FAdd"),
    (FSub, "FSub"),
    (FMul, "FMul"),
    (FDiv, "FDiv"),
    (LoadStaticInt, "LoadStaticInt"),
    (LoadStaticFloat, "LoadStaticFloat"),
    (LoadStaticPointer, "LoadStaticPointer"),
    (LoadU16Imm, "LoadU16Imm"),
    (LoadU32, "LoadU32"),
    (LoadFloat, "LoadFloat"),
    (LoadPointer, "LoadPointer"),
    (StoreInt, "StoreInt"),
    (StoreFloat, "StoreFloat"),
    (StorePointer, "StorePointer"),
    (LookupInt, "LookupInt"),
    (LookupFloat, "LookupFloat"),
    (LookupPointer, "LookupPointer"),
    (MoveInt, "MoveInt"),
    (MoveFloat, "MoveFloat"),
    (MovePointer, "MovePointer"),
    (CastInteger, "CastInteger"),
    (CastFloat, "CastFloat"),
    (Call, "Call"),
    (CallFf, "CallFf"),
    (IEqual, "IEqual"),
    (IGreaterThan, "IGreaterThan"),
    (IGreaterThanEqual, "IGreaterThanEqual"),
    (ILessThan, "ILessThan"),
    (ILessThanEqual, "ILessThanEqual"),
    (FEqual, "FEqual"),
    (FGreaterThan, "FGreaterThan"),
    (FGreaterThanEqual, "FGreaterThanEqual"),
    (FLessThan, "FLessThan"),
    (FLessThanEqual, "FLessThanEqual"),
    (IMod, "IMod"),
    (FMod, "FMod"),
    (IAbs, "IAbs"),
    (FAbs, "FAbs"),
    (GoTo, "GoTo"),
    (Label, "Label"),
    (Branch, "Branch"),
    (BranchIf, "BranchIf"),
    (BranchIfNot, "BranchIfNot"),
    (OpLogNot, "OpLogNot"),
    (OpBitAnd, "OpBitAnd"),
    (OpBitNot, "OpBitNot"),
    (OpBitOr, "OpBitOr"),
    (OpBitXor, "OpBitXor"),
    (OpBitNor, "OpBitNor"),
    (OpLogAnd, "OpLogAnd"),
    (OpLogOr, "OpLogOr"),
    (INeg, "INeg"),
    (FNeg, "FNeg"),
    (LoadParamCnt, "LoadParamCnt"),
    (IAddImm, "IAddImm"),
    (ISubImm, "ISubImm"),
    (IMulImm, "IMulImm"),
    (IDivImm, "IDivImm"),
    (LoadStaticI32Imm, "LoadStaticI32Imm"),
    (LoadStaticFloatImm, "LoadStaticFloatImm"),
    (LoadStaticPointerImm, "LoadStaticPointerImm"),
    (IntAsh, "IntAsh"),
    (Move, "Move"),
    (LoadStaticU32Imm, "LoadStaticU32Imm"),
    (LoadStaticI8Imm, "LoadStaticI8Imm"),
    (LoadStaticU8Imm, "LoadStaticU8Imm"),
    (LoadStaticI16Imm, "LoadStaticI16Imm"),
    (LoadStaticU16Imm, "LoadStaticU16Imm"),
    (LoadStaticI64Imm, "LoadStaticI64Imm"),
    (LoadStaticU64Imm, "LoadStaticU64Imm"),
    (LoadI8, "LoadI8"),
    (LoadU8, "LoadU8"),
    (LoadI16, "LoadI16"),
    (LoadU16, "LoadU16"),
    (LoadI32, "LoadI32"),
    (LoadI64, "LoadI64"),
    (LoadU64, "LoadU64"),
    (StoreI8, "StoreI8"),
    (StoreU8, "StoreU8"),
    (StoreI16, "StoreI16"),
    (StoreU16, "StoreU16"),
    (StoreI32, "StoreI32"),
    (StoreU32, "StoreU32"),
    (StoreI64, "StoreI64"),
    (StoreU64, "StoreU64"),
    (INotEqual, "INotEqual"),
    (FNotEqual, "FNotEqual"),
    (StoreArray, "StoreArray"),
    (AssertPointer, "AssertPointer"),
    (BreakFlag, "BreakFlag"),
    (Breakpoint, "Breakpoint"),
];

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        OPCODE_TABLE.get(byte as usize).map(|(op, _)| *op)
    }

    pub fn mnemonic(self) -> &'static str {
        OPCODE_TABLE[self as usize].1
    }

    /// オペランドの読み書きパターン
    pub fn class(self) -> OpClass {
        match self {
            IAdd | ISub | IMul | IDiv | FAdd | FSub | FMul | FDiv | IEqual | IGreaterThan
            | IGreaterThanEqual | ILessThan | ILessThanEqual | FEqual | FGreaterThan
            | FGreaterThanEqual | FLessThan | FLessThanEqual | IMod | FMod | OpBitAnd
            | OpBitOr | OpBitXor | OpBitNor | OpLogAnd | OpLogOr | IntAsh | INotEqual
            | FNotEqual => OpClass::Binary,

            IAbs | FAbs | OpLogNot | OpBitNot | INeg | FNeg | CastInteger | CastFloat
            | MoveInt | MoveFloat | MovePointer | Move => OpClass::Unary,

            LoadU32 | LoadFloat | LoadPointer | LoadI8 | LoadU8 | LoadI16 | LoadU16 | LoadI32
            | LoadI64 | LoadU64 => OpClass::MemoryLoad,

            IAddImm | ISubImm | IMulImm | IDivImm => OpClass::Immediate,

            LoadStaticInt | LoadStaticFloat | LoadStaticPointer | LookupInt | LookupFloat
            | LookupPointer | LoadStaticI32Imm | LoadStaticFloatImm | LoadStaticPointerImm
            | LoadStaticU32Imm | LoadStaticI8Imm | LoadStaticU8Imm | LoadStaticI16Imm
            | LoadStaticU16Imm | LoadStaticI64Imm | LoadStaticU64Imm => OpClass::SymbolLoad,

            LoadU16Imm | LoadParamCnt => OpClass::LoadImmediate,

            StoreI8 | StoreU8 | StoreI16 | StoreU16 | StoreI32 | StoreU32 | StoreI64
            | StoreU64 => OpClass::Store,

            StoreInt | StoreFloat | StorePointer => OpClass::LegacyStore,

            Return | AssertPointer => OpClass::ReadDest,

            BranchIf | BranchIfNot => OpClass::ConditionalBranch,
            Branch => OpClass::Branch,
            Call | CallFf => OpClass::Call,

            GoTo | Label | BreakFlag | Breakpoint | StoreArray => OpClass::NoOperands,
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(self, Branch | BranchIf | BranchIfNot)
    }

    pub fn is_conditional_branch(self) -> bool {
        matches!(self, BranchIf | BranchIfNot)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 書式指定（幅・寄せ）を効かせる
        f.pad(self.mnemonic())
    }
}

/// オペランドの使われ方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// dest = op1 ◦ op2
    Binary,
    /// dest = ◦op1
    Unary,
    /// dest = *(T*)op1
    MemoryLoad,
    /// dest = op1 ◦ imm(op2)
    Immediate,
    /// dest = 定数プール[op1]
    SymbolLoad,
    /// dest = 即値
    LoadImmediate,
    /// *(T*)op1 = op2, dest = op2
    Store,
    /// *(T*)dest = op1
    LegacyStore,
    /// destを読むだけ
    ReadDest,
    /// op1で条件分岐
    ConditionalBranch,
    Branch,
    /// dest = op1(arg_0 .. arg_{op2})
    Call,
    NoOperands,
}

/// 128bitのレジスタ集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RegisterSet(u128);

impl RegisterSet {
    pub const EMPTY: RegisterSet = RegisterSet(0);

    pub fn new() -> Self {
        Self::EMPTY
    }

    pub fn single(register: u8) -> Self {
        let mut set = Self::EMPTY;
        set.insert(register);
        set
    }

    pub fn insert(&mut self, register: u8) {
        if (register as usize) < REGISTER_COUNT {
            self.0 |= 1u128 << register;
        }
    }

    pub fn remove(&mut self, register: u8) {
        if (register as usize) < REGISTER_COUNT {
            self.0 &= !(1u128 << register);
        }
    }

    pub fn contains(&self, register: u8) -> bool {
        (register as usize) < REGISTER_COUNT && self.0 & (1u128 << register) != 0
    }

    pub fn union(self, other: RegisterSet) -> RegisterSet {
        RegisterSet(self.0 | other.0)
    }

    pub fn intersection(self, other: RegisterSet) -> RegisterSet {
        RegisterSet(self.0 & other.0)
    }

    pub fn difference(self, other: RegisterSet) -> RegisterSet {
        RegisterSet(self.0 & !other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn bits(&self) -> u128 {
        self.0
    }

    /// 小さい番号から順に列挙
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        let bits = self.0;
        (0..REGISTER_COUNT as u8).filter(move |r| bits & (1u128 << r) != 0)
    }
}

impl FromIterator<u8> for RegisterSet {
    fn from_iter<I: IntoIterator<Item = u8>>(iter: I) -> Self {
        let mut set = RegisterSet::new();
        for register in iter {
            set.insert(register);
        }
        set
    }
}

impl fmt::Display for RegisterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|r| format!("r{}", r)).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}

/// デコード済み命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub dest: u8,
    pub op1: u8,
    pub op2: u8,
}

impl Instruction {
    pub const fn new(opcode: Opcode, dest: u8, op1: u8, op2: u8) -> Self {
        Self { opcode, dest, op1, op2 }
    }

    /// 8バイトの生データから。未知のオペコードはエラー
    pub fn decode(raw: &[u8], line: usize) -> Result<Self, DecodeError> {
        let (&byte, rest) = raw.split_first().ok_or(DecodeError::MalformedLambda {
            offset: (line * INSTRUCTION_SIZE) as u64,
            reason: "instruction stream ends mid-record".to_string(),
        })?;
        if rest.len() < 3 {
            return Err(DecodeError::MalformedLambda {
                offset: (line * INSTRUCTION_SIZE) as u64,
                reason: "instruction stream ends mid-record".to_string(),
            });
        }
        let opcode = Opcode::from_u8(byte).ok_or(DecodeError::UnknownOpcode { line, byte })?;
        Ok(Self::new(opcode, rest[0], rest[1], rest[2]))
    }

    pub fn encode(&self) -> [u8; INSTRUCTION_SIZE] {
        [self.opcode as u8, self.dest, self.op1, self.op2, 0, 0, 0, 0]
    }

    pub fn class(&self) -> OpClass {
        self.opcode.class()
    }

    /// 分岐先の行番号 `dest | (op2 << 8)`
    pub fn branch_target(&self) -> Option<u32> {
        if self.opcode.is_branch() {
            Some(self.dest as u32 | ((self.op2 as u32) << 8))
        } else {
            None
        }
    }

    /// `LoadU16Imm` の即値 `op1 | (op2 << 8)`
    pub fn u16_immediate(&self) -> u16 {
        self.op1 as u16 | ((self.op2 as u16) << 8)
    }

    /// 定数プールを参照する命令のスロット番号
    pub fn symbol_slot(&self) -> Option<u8> {
        match self.class() {
            OpClass::SymbolLoad => Some(self.op1),
            _ => None,
        }
    }

    /// 呼び出しの引数レジスタ
    pub fn call_arguments(&self) -> impl Iterator<Item = u8> {
        let count = if self.class() == OpClass::Call { self.op2 as u16 } else { 0 };
        let start = ARGUMENT_REGISTER_START as u16;
        (start..start + count).filter_map(|r| u8::try_from(r).ok())
    }

    /// 読み込むレジスタ（登場順）
    pub fn read_registers(&self) -> Vec<u8> {
        match self.class() {
            OpClass::Binary | OpClass::Store => vec![self.op1, self.op2],
            OpClass::Unary | OpClass::MemoryLoad | OpClass::Immediate => vec![self.op1],
            OpClass::LegacyStore => vec![self.dest, self.op1],
            OpClass::ReadDest => vec![self.dest],
            OpClass::ConditionalBranch => vec![self.op1],
            OpClass::Call => std::iter::once(self.op1).chain(self.call_arguments()).collect(),
            OpClass::SymbolLoad | OpClass::LoadImmediate | OpClass::Branch | OpClass::NoOperands => {
                Vec::new()
            }
        }
    }

    /// 書き込むレジスタ
    pub fn written_register(&self) -> Option<u8> {
        match self.class() {
            OpClass::Binary
            | OpClass::Unary
            | OpClass::MemoryLoad
            | OpClass::Immediate
            | OpClass::SymbolLoad
            | OpClass::LoadImmediate
            | OpClass::Store
            | OpClass::Call => Some(self.dest),
            _ => None,
        }
    }

    pub fn reads(&self) -> RegisterSet {
        self.read_registers().into_iter().collect()
    }

    pub fn writes(&self) -> RegisterSet {
        self.written_register().into_iter().collect()
    }

    /// レジスタ番号・スロット番号・分岐先の範囲検査
    pub fn validate(&self, line: usize, symbol_count: usize, line_count: usize) -> Result<(), DecodeError> {
        let registers = self.read_registers().into_iter().chain(self.written_register());
        for register in registers {
            if register as usize >= REGISTER_COUNT {
                return Err(DecodeError::RegisterOutOfRange { line, register });
            }
        }
        if self.class() == OpClass::Call
            && ARGUMENT_REGISTER_START as usize + self.op2 as usize > REGISTER_COUNT
        {
            return Err(DecodeError::RegisterOutOfRange { line, register: self.op2 });
        }
        if let Some(slot) = self.symbol_slot() {
            if slot as usize >= symbol_count {
                return Err(DecodeError::SymbolSlotOutOfRange { line, slot, len: symbol_count });
            }
        }
        if let Some(target) = self.branch_target() {
            if target as usize >= line_count {
                return Err(DecodeError::BranchTargetOutOfRange { line, target, len: line_count });
            }
        }
        Ok(())
    }

    /// 逆アセンブル表記のオペランド部
    pub fn operand_text(&self) -> String {
        match self.class() {
            OpClass::Binary | OpClass::Store => {
                format!("r{}, r{}, r{}", self.dest, self.op1, self.op2)
            }
            OpClass::Unary => format!("r{}, r{}", self.dest, self.op1),
            OpClass::MemoryLoad => format!("r{}, [r{}]", self.dest, self.op1),
            OpClass::Immediate => format!("r{}, r{}, {}", self.dest, self.op1, self.op2),
            OpClass::SymbolLoad => format!("r{}, {}", self.dest, self.op1),
            OpClass::LoadImmediate => match self.opcode {
                LoadU16Imm => format!("r{}, {}", self.dest, self.u16_immediate()),
                _ => format!("r{}", self.dest),
            },
            OpClass::LegacyStore => format!("[r{}], r{}", self.dest, self.op1),
            OpClass::ReadDest => format!("r{}", self.dest),
            OpClass::ConditionalBranch => {
                format!("r{}, {}", self.op1, self.branch_target().unwrap_or(0))
            }
            OpClass::Branch => format!("{}", self.branch_target().unwrap_or(0)),
            OpClass::Call => format!("r{}, r{}, {}", self.dest, self.op1, self.op2),
            OpClass::NoOperands => String::new(),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<21}{}", self.opcode, self.operand_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_table_is_dense() {
        for byte in 0..96u8 {
            let op = Opcode::from_u8(byte).unwrap();
            assert_eq!(op as u8, byte);
        }
        assert_eq!(Opcode::from_u8(96), None);
        assert_eq!(Opcode::from_u8(0xFF), None);
        assert_eq!(Opcode::LoadStaticU64Imm.mnemonic(), "LoadStaticU64Imm");
    }

    #[test]
    fn test_decode_unknown_opcode() {
        let raw = [0x80, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            Instruction::decode(&raw, 7),
            Err(DecodeError::UnknownOpcode { line: 7, byte: 0x80 })
        );
    }

    #[test]
    fn test_branch_target_and_immediate() {
        let branch = Instruction::new(Opcode::BranchIfNot, 0x04, 3, 0x01);
        assert_eq!(branch.branch_target(), Some(0x104));
        assert_eq!(branch.reads(), RegisterSet::single(3));
        assert!(branch.writes().is_empty());

        let load = Instruction::new(Opcode::LoadU16Imm, 0, 0x34, 0x12);
        assert_eq!(load.u16_immediate(), 0x1234);
        assert_eq!(load.to_string(), format!("{:<21}r0, 4660", "LoadU16Imm"));
    }

    #[test]
    fn test_call_reads_argument_registers() {
        let call = Instruction::new(Opcode::Call, 0, 1, 2);
        assert_eq!(call.read_registers(), vec![1, 49, 50]);
        assert_eq!(call.written_register(), Some(0));
    }

    #[test]
    fn test_validate_ranges() {
        let add = Instruction::new(Opcode::IAdd, 200, 0, 1);
        assert_eq!(
            add.validate(0, 0, 1),
            Err(DecodeError::RegisterOutOfRange { line: 0, register: 200 })
        );

        let lookup = Instruction::new(Opcode::LookupPointer, 1, 4, 0);
        assert_eq!(
            lookup.validate(2, 4, 3),
            Err(DecodeError::SymbolSlotOutOfRange { line: 2, slot: 4, len: 4 })
        );

        let branch = Instruction::new(Opcode::Branch, 9, 0, 0);
        assert!(branch.validate(0, 0, 9).is_err());
        assert!(branch.validate(0, 0, 10).is_ok());
    }

    #[test]
    fn test_register_set_ops() {
        let a: RegisterSet = [0u8, 5, 127].into_iter().collect();
        let b: RegisterSet = [5u8, 6].into_iter().collect();
        assert_eq!(a.union(b).len(), 4);
        assert_eq!(a.intersection(b), RegisterSet::single(5));
        assert_eq!(a.difference(b).iter().collect::<Vec<_>>(), vec![0, 127]);
        assert_eq!(b.to_string(), "{r5, r6}");
    }
}
