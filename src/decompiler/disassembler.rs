/// 命令デコーダとレジスタ状態シミュレータ
///
/// 関数の命令列を先頭から一度だけ走査し、各命令について
/// 1. 書き込み先レジスタの型と値を推論する
/// 2. 逆アセンブル表記と解釈コメントを作る
/// 3. 定数プールのスロットに型を束縛する（最初の1回だけ）
///
/// 分岐先ラベルと後方ジャンプもここで記録する。

use super::instruction::{
    Instruction, OpClass, Opcode, RegisterSet, ARGUMENT_REGISTER_END, ARGUMENT_REGISTER_START,
    INSTRUCTION_SIZE,
};
use super::stack_frame::{BackwardJump, ConstantKind, ConstantPool, PointerValue, StackFrame};
use super::types::{FunctionType, Type};
use crate::container::{DcContainer, ScriptFunction};
use crate::error::{AnalysisInconsistency, DecodeError};
use crate::sid::{sid64, SidResolver};
use std::collections::HashMap;
use std::fmt::Write as _;
use tracing::{debug, warn};

/// この値以上の64bit即値はSIDとみなす
pub const SID_THRESHOLD: u64 = 0x000F_FFFF_FFFF_FFFF;

/// 逆アセンブル済みの1行
#[derive(Debug, Clone)]
pub struct DisassemblyLine {
    pub location: usize,
    /// 命令のファイルオフセット
    pub offset: u64,
    pub instruction: Instruction,
    pub text: String,
    pub comment: String,
    /// 分岐先の行
    pub target: Option<usize>,
    /// 直前の `OpLogNot` を畳み込んだ条件 `(レジスタ, 反転するか)`
    pub condition: Option<(u8, bool)>,
    /// 書き込み先レジスタの推論型
    pub written_type: Option<Type>,
}

/// 1関数ぶんの逆アセンブル結果
#[derive(Debug, Clone)]
pub struct FunctionDisassembly {
    pub id: String,
    pub lines: Vec<DisassemblyLine>,
    pub frame: StackFrame,
    pub pool: ConstantPool,
    pub warnings: Vec<AnalysisInconsistency>,
}

impl FunctionDisassembly {
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn instruction(&self, line: usize) -> Option<&Instruction> {
        self.lines.get(line).map(|l| &l.instruction)
    }

    /// ラベル名。最終行への分岐は `L_RETURN`
    pub fn label_name(&self, line: usize) -> Option<String> {
        if !self.frame.is_label(line) {
            return None;
        }
        if line + 1 == self.lines.len() {
            return Some("L_RETURN".to_string());
        }
        let last = self.lines.len().saturating_sub(1);
        let index = self
            .frame
            .labels
            .iter()
            .filter(|&&l| l != last)
            .position(|&l| l == line)?;
        Some(format!("L_{}", index))
    }

    /// シグネチャ `<ret> <name>(<type> arg_0, ...)`
    pub fn signature(&self) -> String {
        let params: Vec<String> = (0..self.frame.argument_count)
            .map(|i| format!("{} arg_{}", self.frame.argument_types[i], i))
            .collect();
        format!("{} {}({})", self.frame.return_type, self.id, params.join(", "))
    }

    /// 逆アセンブルリスト
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            if let Some(label) = self.label_name(line.location) {
                let _ = writeln!(out, "{}:", label);
            }
            if line.comment.is_empty() {
                let _ = writeln!(out, "{}", line.text);
            } else {
                let _ = writeln!(out, "{:<72}{}", line.text, line.comment);
            }
        }
        out
    }

    /// 参照されたスロットのダンプ `SSSS   0xOOOOOO   kind: <value>`
    pub fn symbol_table_dump(&self, resolver: &SidResolver) -> String {
        let mut out = String::new();
        for (slot, ty) in self.frame.symbol_types.iter().enumerate() {
            if ty.is_unknown() {
                continue;
            }
            let Some(constant) = self.pool.get(slot) else {
                continue;
            };
            let value = match (ty, &constant.kind) {
                (_, ConstantKind::String(s)) => format!("\"{}\"", s),
                (Type::Int(_), _) => format_integer(ty, constant.raw),
                (Type::Float(_), _) => format!("{:.2}", constant.as_f32()),
                (Type::Bool, _) => (constant.raw != 0).to_string(),
                (Type::Function(_), _) => format!("{} {}", resolver.resolve(constant.raw), ty),
                (_, ConstantKind::Pointer { target }) => format!("0x{:06X}", target),
                _ => resolver.resolve(constant.raw).to_string(),
            };
            let kind = match ty {
                Type::Function(_) => "function".to_string(),
                other => other.to_c_string(),
            };
            let _ = writeln!(out, "{:04X}   0x{:06X}   {}: {}", slot, constant.offset, kind, value);
        }
        out
    }
}

/// 幅と符号に合わせた整数表記
pub fn format_integer(ty: &Type, raw: u64) -> String {
    use super::types::IntType::*;
    match ty {
        Type::Int(I8) => (raw as i8).to_string(),
        Type::Int(I16) => (raw as i16).to_string(),
        Type::Int(I32) => (raw as i32).to_string(),
        Type::Int(I64) => (raw as i64).to_string(),
        Type::Int(U8) => (raw as u8).to_string(),
        Type::Int(U16) => (raw as u16).to_string(),
        Type::Int(U32) => (raw as u32).to_string(),
        _ => raw.to_string(),
    }
}

/// 二項演算子の表記
pub fn binary_symbol(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::IAdd | Opcode::FAdd | Opcode::IAddImm => "+",
        Opcode::ISub | Opcode::FSub | Opcode::ISubImm => "-",
        Opcode::IMul | Opcode::FMul | Opcode::IMulImm => "*",
        Opcode::IDiv | Opcode::FDiv | Opcode::IDivImm => "/",
        Opcode::IMod | Opcode::FMod => "%",
        Opcode::IEqual | Opcode::FEqual => "==",
        Opcode::INotEqual | Opcode::FNotEqual => "!=",
        Opcode::IGreaterThan | Opcode::FGreaterThan => ">",
        Opcode::IGreaterThanEqual | Opcode::FGreaterThanEqual => ">=",
        Opcode::ILessThan | Opcode::FLessThan => "<",
        Opcode::ILessThanEqual | Opcode::FLessThanEqual => "<=",
        Opcode::OpBitAnd => "&",
        Opcode::OpBitOr => "|",
        Opcode::OpBitXor => "^",
        Opcode::OpBitNor => "~|",
        Opcode::OpLogAnd => "&&",
        Opcode::OpLogOr => "||",
        Opcode::IntAsh => "<<",
        _ => "?",
    }
}

/// 組み込み関数のシグネチャ
pub fn builtin_signatures() -> HashMap<u64, FunctionType> {
    let sid_params = || {
        vec![
            ("symbol".to_string(), Type::Sid),
            ("location".to_string(), Type::Sid),
        ]
    };
    let mut builtins = HashMap::new();
    builtins.insert(
        sid64("get-int32"),
        FunctionType {
            ret: Type::I32,
            params: sid_params(),
        },
    );
    builtins.insert(
        sid64("get-boolean"),
        FunctionType {
            ret: Type::Bool,
            params: sid_params(),
        },
    );
    builtins
}

/// 逆アセンブラ
pub struct Disassembler<'a> {
    resolver: &'a SidResolver,
    builtins: HashMap<u64, FunctionType>,
}

impl<'a> Disassembler<'a> {
    pub fn new(resolver: &'a SidResolver) -> Self {
        Self {
            resolver,
            builtins: builtin_signatures(),
        }
    }

    /// コンテナ内のscript-lambdaを逆アセンブル
    pub fn disassemble_function(
        &self,
        container: &DcContainer,
        function: &ScriptFunction,
    ) -> Result<FunctionDisassembly, DecodeError> {
        let instructions = container.instructions(function)?;
        let pool = container.constant_pool(function);
        let id = self.resolver.resolve(function.name_hash).to_string();
        self.disassemble(id, &instructions, pool, function.instructions_offset)
    }

    /// 命令列と定数プールから
    pub fn disassemble(
        &self,
        id: impl Into<String>,
        instructions: &[Instruction],
        pool: ConstantPool,
        instructions_offset: u64,
    ) -> Result<FunctionDisassembly, DecodeError> {
        if instructions.is_empty() {
            return Err(DecodeError::EmptyFunction);
        }
        for (line, instruction) in instructions.iter().enumerate() {
            instruction.validate(line, pool.len(), instructions.len())?;
        }

        let id = id.into();
        let mut simulation = Simulation {
            resolver: self.resolver,
            builtins: &self.builtins,
            instructions,
            frame: StackFrame::new(pool.len()),
            pool: &pool,
            warnings: Vec::new(),
            void_return: false,
        };

        let mut lines = Vec::with_capacity(instructions.len());
        for (location, instruction) in instructions.iter().enumerate() {
            let offset = instructions_offset + (location * INSTRUCTION_SIZE) as u64;
            lines.push(simulation.process(location, offset, *instruction));
        }

        let Simulation {
            mut frame,
            warnings,
            void_return,
            ..
        } = simulation;
        frame.argument_count = count_arguments(instructions);
        if frame.return_type.is_unknown() && void_return {
            frame.return_type = Type::Void;
        }

        debug!(
            "disassembled {}: {} lines, {} labels, {} backward jumps, {} args",
            id,
            lines.len(),
            frame.labels.len(),
            frame.backward_jumps.len(),
            frame.argument_count
        );

        Ok(FunctionDisassembly {
            id,
            lines,
            frame,
            pool,
            warnings,
        })
    }
}

/// 書き込み前に読まれた引数レジスタの最大番号 + 1
fn count_arguments(instructions: &[Instruction]) -> usize {
    let mut written = RegisterSet::new();
    let mut count = 0usize;
    for instruction in instructions {
        for register in instruction.read_registers() {
            if (ARGUMENT_REGISTER_START..ARGUMENT_REGISTER_END).contains(&register) && !written.contains(register) {
                count = count.max((register - ARGUMENT_REGISTER_START) as usize + 1);
            }
        }
        if let Some(register) = instruction.written_register() {
            written.insert(register);
        }
    }
    count
}

struct Simulation<'s> {
    resolver: &'s SidResolver,
    builtins: &'s HashMap<u64, FunctionType>,
    instructions: &'s [Instruction],
    frame: StackFrame,
    pool: &'s ConstantPool,
    warnings: Vec<AnalysisInconsistency>,
    void_return: bool,
}

impl<'s> Simulation<'s> {
    fn name(&self, register: u8) -> String {
        let reg = self.frame.register(register);
        match reg.argument {
            Some(arg) => format!("arg_{}", arg),
            None => format!("r{}", register),
        }
    }

    fn process(&mut self, location: usize, offset: u64, istr: Instruction) -> DisassemblyLine {
        let text = format!(
            "{:04X}   0x{:06X}   {:02X} {:02X} {:02X} {:02X}   {}",
            location, offset, istr.opcode as u8, istr.dest, istr.op1, istr.op2, istr
        );
        let mut line = DisassemblyLine {
            location,
            offset,
            instruction: istr,
            text,
            comment: String::new(),
            target: None,
            condition: None,
            written_type: None,
        };

        line.comment = match istr.class() {
            OpClass::Binary => self.binary(location, istr),
            OpClass::Immediate => self.immediate(location, istr),
            OpClass::Unary => self.unary(istr),
            OpClass::MemoryLoad => self.memory_load(istr),
            OpClass::SymbolLoad => self.symbol_load(location, istr),
            OpClass::LoadImmediate => self.load_immediate(istr),
            OpClass::Store => self.store(istr),
            OpClass::LegacyStore => format!("*{} = {}", self.name(istr.dest), self.name(istr.op1)),
            OpClass::ReadDest => self.read_dest(istr),
            OpClass::Call => self.call(istr),
            OpClass::Branch | OpClass::ConditionalBranch => self.branch(location, istr, &mut line),
            OpClass::NoOperands => String::new(),
        };
        line.written_type = istr.written_register().map(|r| self.frame.type_of(r));
        line
    }

    /// 型が未知の引数は、相手側の型を引き継ぐ
    fn infer_arguments(&mut self, a: u8, b: u8) {
        for (arg, other) in [(a, b), (b, a)] {
            let register = self.frame.register(arg);
            if let Some(index) = register.argument {
                let other_ty = self.frame.type_of(other);
                if self.frame.type_of(arg).is_unknown() && !other_ty.is_unknown() {
                    self.frame.bind_argument(index, other_ty);
                }
            }
        }
    }

    fn integer_result(&self, a: u8, b: u8) -> Type {
        let ta = self.frame.type_of(a);
        if ta.is_integer() {
            return ta;
        }
        let tb = self.frame.type_of(b);
        if tb.is_integer() {
            tb
        } else {
            Type::I64
        }
    }

    fn binary(&mut self, location: usize, istr: Instruction) -> String {
        self.infer_arguments(istr.op1, istr.op2);
        let comment = format!(
            "r{} = {} {} {}",
            istr.dest,
            self.name(istr.op1),
            binary_symbol(istr.opcode),
            self.name(istr.op2)
        );

        let a = self.frame.register(istr.op1).clone();
        let b = self.frame.register(istr.op2).clone();
        let fa = f32::from_bits(a.value as u32);
        let fb = f32::from_bits(b.value as u32);
        let float = |v: f32| v.to_bits() as u64;

        match istr.opcode {
            Opcode::IAdd if a.is_pointer() || b.is_pointer() => {
                let (ptr, other) = if a.is_pointer() { (&a, &b) } else { (&b, &a) };
                let ty = if a.is_pointer() {
                    self.frame.type_of(istr.op1)
                } else {
                    self.frame.type_of(istr.op2)
                };
                let pointer = ptr.pointer.unwrap_or_default();
                let offset = match pointer.offset.checked_add(other.value) {
                    Some(offset) => offset,
                    None => {
                        warn!("pointer offset overflow at line {}", location);
                        self.warnings.push(AnalysisInconsistency::OffsetOverflow { line: location });
                        pointer.offset.wrapping_add(other.value)
                    }
                };
                self.frame.write_pointer(istr.dest, ty, PointerValue { base: pointer.base, offset });
            }
            Opcode::IAdd | Opcode::ISub | Opcode::IMul | Opcode::IDiv | Opcode::IMod => {
                let ty = self.integer_result(istr.op1, istr.op2);
                let divisor = if b.value == 0 { 1 } else { b.value };
                let value = match istr.opcode {
                    Opcode::IAdd => a.value.wrapping_add(b.value),
                    Opcode::ISub => a.value.wrapping_sub(b.value),
                    Opcode::IMul => a.value.wrapping_mul(b.value),
                    Opcode::IDiv => (a.value as i64).wrapping_div(divisor as i64) as u64,
                    _ => (a.value as i64).wrapping_rem(divisor as i64) as u64,
                };
                self.frame.write(istr.dest, ty, value);
            }
            Opcode::FAdd | Opcode::FSub | Opcode::FMul | Opcode::FDiv | Opcode::FMod => {
                let divisor = if fb == 0.0 { 1.0 } else { fb };
                let value = match istr.opcode {
                    Opcode::FAdd => fa + fb,
                    Opcode::FSub => fa - fb,
                    Opcode::FMul => fa * fb,
                    Opcode::FDiv => fa / divisor,
                    _ => fa % divisor,
                };
                self.frame.write(istr.dest, Type::F32, float(value));
            }
            Opcode::IEqual | Opcode::INotEqual | Opcode::IGreaterThan | Opcode::IGreaterThanEqual
            | Opcode::ILessThan | Opcode::ILessThanEqual => {
                let (x, y) = (a.value as i64, b.value as i64);
                let result = match istr.opcode {
                    Opcode::IEqual => x == y,
                    Opcode::INotEqual => x != y,
                    Opcode::IGreaterThan => x > y,
                    Opcode::IGreaterThanEqual => x >= y,
                    Opcode::ILessThan => x < y,
                    _ => x <= y,
                };
                self.frame.write(istr.dest, Type::Bool, result as u64);
            }
            Opcode::FEqual | Opcode::FNotEqual | Opcode::FGreaterThan | Opcode::FGreaterThanEqual
            | Opcode::FLessThan | Opcode::FLessThanEqual => {
                let result = match istr.opcode {
                    Opcode::FEqual => fa == fb,
                    Opcode::FNotEqual => fa != fb,
                    Opcode::FGreaterThan => fa > fb,
                    Opcode::FGreaterThanEqual => fa >= fb,
                    Opcode::FLessThan => fa < fb,
                    _ => fa <= fb,
                };
                self.frame.write(istr.dest, Type::Bool, result as u64);
            }
            Opcode::OpLogAnd | Opcode::OpLogOr => {
                let result = match istr.opcode {
                    Opcode::OpLogAnd => a.value != 0 && b.value != 0,
                    _ => a.value != 0 || b.value != 0,
                };
                self.frame.write(istr.dest, Type::Bool, result as u64);
            }
            _ => {
                let ty = self.integer_result(istr.op1, istr.op2);
                let value = match istr.opcode {
                    Opcode::OpBitAnd => a.value & b.value,
                    Opcode::OpBitOr => a.value | b.value,
                    Opcode::OpBitXor => a.value ^ b.value,
                    Opcode::OpBitNor => !(a.value | b.value),
                    _ => {
                        let shift = b.value as i64;
                        if shift >= 0 {
                            a.value.wrapping_shl(shift as u32)
                        } else {
                            ((a.value as i64) >> (shift.unsigned_abs().min(63) as u32)) as u64
                        }
                    }
                };
                self.frame.write(istr.dest, ty, value);
            }
        }
        comment
    }

    fn immediate(&mut self, location: usize, istr: Instruction) -> String {
        let comment = format!(
            "r{} = {} {} {}",
            istr.dest,
            self.name(istr.op1),
            binary_symbol(istr.opcode),
            istr.op2
        );
        let src = self.frame.register(istr.op1).clone();
        let imm = istr.op2 as u64;
        if istr.opcode == Opcode::IAddImm && src.is_pointer() {
            let ty = self.frame.type_of(istr.op1);
            let pointer = src.pointer.unwrap_or_default();
            let offset = pointer.offset.checked_add(imm).unwrap_or_else(|| {
                warn!("pointer offset overflow at line {}", location);
                self.warnings.push(AnalysisInconsistency::OffsetOverflow { line: location });
                pointer.offset.wrapping_add(imm)
            });
            self.frame.write_pointer(istr.dest, ty, PointerValue { base: pointer.base, offset });
            return comment;
        }

        let ty = match self.frame.type_of(istr.op1) {
            ty if ty.is_integer() => ty,
            _ => Type::I64,
        };
        let value = match istr.opcode {
            Opcode::IAddImm => src.value.wrapping_add(imm),
            Opcode::ISubImm => src.value.wrapping_sub(imm),
            Opcode::IMulImm => src.value.wrapping_mul(imm),
            _ => src.value / imm.max(1),
        };
        self.frame.write(istr.dest, ty, value);
        comment
    }

    fn unary(&mut self, istr: Instruction) -> String {
        let src_name = self.name(istr.op1);
        let src = self.frame.register(istr.op1).clone();
        let src_ty = self.frame.type_of(istr.op1);
        let (comment, ty, value) = match istr.opcode {
            Opcode::MoveInt | Opcode::MoveFloat | Opcode::MovePointer | Opcode::Move => {
                self.frame.copy(istr.dest, istr.op1);
                let fallback = match istr.opcode {
                    Opcode::MoveInt => Some(Type::I64),
                    Opcode::MoveFloat => Some(Type::F32),
                    Opcode::MovePointer => Some(Type::pointer_to(Type::Unknown)),
                    _ => None,
                };
                if let Some(fallback) = fallback {
                    let dest = self.frame.register_mut(istr.dest);
                    if dest.argument.is_none() {
                        dest.set_first_type(fallback);
                    }
                }
                return format!("r{} = {}", istr.dest, src_name);
            }
            Opcode::CastInteger => {
                let f = f32::from_bits(src.value as u32);
                (format!("r{} = (int){}", istr.dest, src_name), Type::I32, (f as i32) as i64 as u64)
            }
            Opcode::CastFloat => {
                let f = src.value as i64 as f32;
                (format!("r{} = (float){}", istr.dest, src_name), Type::F32, f.to_bits() as u64)
            }
            Opcode::IAbs => {
                let ty = if src_ty.is_integer() { src_ty } else { Type::I64 };
                (format!("r{} = abs({})", istr.dest, src_name), ty, (src.value as i64).wrapping_abs() as u64)
            }
            Opcode::FAbs => {
                let f = f32::from_bits(src.value as u32).abs();
                (format!("r{} = abs({})", istr.dest, src_name), Type::F32, f.to_bits() as u64)
            }
            Opcode::INeg => {
                let ty = if src_ty.is_integer() { src_ty } else { Type::I64 };
                (format!("r{} = -{}", istr.dest, src_name), ty, (src.value as i64).wrapping_neg() as u64)
            }
            Opcode::FNeg => {
                let f = -f32::from_bits(src.value as u32);
                (format!("r{} = -{}", istr.dest, src_name), Type::F32, f.to_bits() as u64)
            }
            Opcode::OpLogNot => (format!("r{} = !{}", istr.dest, src_name), Type::Bool, (src.value == 0) as u64),
            _ => {
                let ty = if src_ty.is_integer() { src_ty } else { Type::U64 };
                (format!("r{} = ~{}", istr.dest, src_name), ty, !src.value)
            }
        };
        self.frame.write(istr.dest, ty, value);
        comment
    }

    fn memory_load(&mut self, istr: Instruction) -> String {
        let ty = match istr.opcode {
            Opcode::LoadU32 => Type::U32,
            Opcode::LoadFloat => Type::F32,
            Opcode::LoadI8 => Type::I8,
            Opcode::LoadU8 => Type::U8,
            Opcode::LoadI16 => Type::I16,
            Opcode::LoadU16 => Type::U16,
            Opcode::LoadI32 => Type::I32,
            Opcode::LoadI64 => Type::I64,
            Opcode::LoadU64 => Type::U64,
            _ => Type::pointer_to(Type::Unknown),
        };
        let comment = format!("r{} = *({}*){}", istr.dest, ty, self.name(istr.op1));
        // 型が不明な引数をポインタとして読んでいる
        if let Some(arg) = self.frame.register(istr.op1).argument {
            if self.frame.type_of(istr.op1).is_unknown() {
                self.frame.bind_argument(arg, Type::pointer_to(ty.clone()));
            }
        }
        if istr.opcode == Opcode::LoadPointer {
            let pointer = self.frame.register(istr.op1).pointer.unwrap_or_default();
            self.frame.write_pointer(istr.dest, ty, pointer);
        } else {
            self.frame.write(istr.dest, ty, 0);
        }
        comment
    }

    /// 読み込んだポインタがこのあと呼び出されるか
    fn pointer_gets_called(&self, location: usize, register: u8) -> bool {
        for istr in &self.instructions[location + 1..] {
            if istr.class() == OpClass::Call && istr.op1 == register {
                return true;
            }
            if istr.written_register() == Some(register) {
                return false;
            }
        }
        false
    }

    fn symbol_load(&mut self, location: usize, istr: Instruction) -> String {
        let slot = istr.op1;
        let pool = self.pool;
        let Some(constant) = pool.get(slot as usize) else {
            return String::new();
        };
        let raw = constant.raw;
        let string = constant.as_str().map(str::to_string);
        let pointee = match &constant.kind {
            ConstantKind::Pointer { target } => Some(*target),
            _ => None,
        };

        let (ty, binding, shown) = match istr.opcode {
            Opcode::LoadStaticInt => (Type::I64, Some(Type::I64), (raw as i64).to_string()),
            Opcode::LoadStaticFloat | Opcode::LoadStaticFloatImm => {
                (Type::F32, Some(Type::F32), format!("{:.2}", constant.as_f32()))
            }
            Opcode::LookupInt => (Type::I64, Some(Type::Sid), self.resolver.resolve(raw).to_string()),
            Opcode::LookupFloat => (Type::F32, Some(Type::Sid), self.resolver.resolve(raw).to_string()),
            Opcode::LoadStaticI32Imm => (Type::I32, Some(Type::I32), (raw as i32).to_string()),
            Opcode::LoadStaticU32Imm => (Type::U32, Some(Type::U32), (raw as u32).to_string()),
            Opcode::LoadStaticI8Imm => (Type::I8, Some(Type::I8), (raw as i8).to_string()),
            Opcode::LoadStaticU8Imm => (Type::U8, Some(Type::U8), (raw as u8).to_string()),
            Opcode::LoadStaticI16Imm => (Type::I16, Some(Type::I16), (raw as i16).to_string()),
            Opcode::LoadStaticU16Imm => (Type::U16, Some(Type::U16), (raw as u16).to_string()),
            Opcode::LoadStaticI64Imm => (Type::I64, Some(Type::I64), (raw as i64).to_string()),
            Opcode::LoadStaticU64Imm if raw >= SID_THRESHOLD => {
                (Type::Sid, Some(Type::Sid), self.resolver.resolve(raw).to_string())
            }
            Opcode::LoadStaticU64Imm => (Type::U64, Some(Type::U64), raw.to_string()),
            // LoadStaticPointer / LoadStaticPointerImm / LookupPointer
            _ => match (&string, pointee) {
                (Some(s), _) => (Type::String, Some(Type::String), format!("\"{}\"", s)),
                (None, Some(target)) => (
                    Type::pointer_to(Type::Unknown),
                    Some(Type::pointer_to(Type::Unknown)),
                    format!("0x{:06X}", target),
                ),
                (None, None) => {
                    let called = istr.opcode == Opcode::LookupPointer && self.pointer_gets_called(location, istr.dest);
                    // 呼び出される場合は呼び出し側で関数型を束縛する
                    let binding = (!called).then_some(Type::Sid);
                    (Type::pointer_to(Type::Unknown), binding, self.resolver.resolve(raw).to_string())
                }
            },
        };

        if let Some(binding) = binding {
            self.frame.bind_symbol(slot, binding);
        }
        if ty.is_pointer() {
            self.frame.write_pointer(istr.dest, ty, PointerValue { base: raw, offset: 0 });
        } else {
            self.frame.write(istr.dest, ty, raw);
        }
        self.frame.register_mut(istr.dest).from_symbol = Some(slot);
        format!("r{} = ST[{}] -> <{}>", istr.dest, slot, shown)
    }

    fn load_immediate(&mut self, istr: Instruction) -> String {
        match istr.opcode {
            Opcode::LoadU16Imm => {
                let value = istr.u16_immediate();
                self.frame.write(istr.dest, Type::U16, value as u64);
                format!("r{} = {}", istr.dest, value)
            }
            _ => {
                self.frame.write(istr.dest, Type::U64, 0);
                format!("r{} = param_count", istr.dest)
            }
        }
    }

    fn store(&mut self, istr: Instruction) -> String {
        let width = match istr.opcode {
            Opcode::StoreI8 => Type::I8,
            Opcode::StoreU8 => Type::U8,
            Opcode::StoreI16 => Type::I16,
            Opcode::StoreU16 => Type::U16,
            Opcode::StoreI32 => Type::I32,
            Opcode::StoreU32 => Type::U32,
            Opcode::StoreI64 => Type::I64,
            _ => Type::U64,
        };
        let comment = format!("*({}*){} = {}", width, self.name(istr.op1), self.name(istr.op2));
        if let Some(arg) = self.frame.register(istr.op1).argument {
            if self.frame.type_of(istr.op1).is_unknown() {
                self.frame.bind_argument(arg, Type::pointer_to(width));
            }
        }
        self.frame.copy(istr.dest, istr.op2);
        comment
    }

    fn read_dest(&mut self, istr: Instruction) -> String {
        let name = self.name(istr.dest);
        if istr.opcode == Opcode::AssertPointer {
            return format!("assert({})", name);
        }
        let register = self.frame.register(istr.dest);
        if register.written || register.argument.is_some() {
            let ty = self.frame.type_of(istr.dest);
            if self.frame.return_type.is_unknown() || self.frame.return_type == Type::Void {
                self.frame.return_type = ty;
            }
        } else {
            self.void_return = true;
        }
        format!("return {}", name)
    }

    fn call(&mut self, istr: Instruction) -> String {
        let callee = self.frame.register(istr.op1).clone();
        let sid = callee.pointer.map(|p| p.base).unwrap_or(callee.value);
        let callee_name = self.resolver.resolve(sid);

        let args: Vec<u8> = istr.call_arguments().collect();
        let signature = match self.builtins.get(&sid) {
            Some(signature) => signature.clone(),
            None => FunctionType {
                ret: Type::Unknown,
                params: args
                    .iter()
                    .enumerate()
                    .map(|(i, &r)| (format!("arg_{}", i), self.frame.type_of(r)))
                    .collect(),
            },
        };
        if let Some(slot) = callee.from_symbol {
            self.frame.bind_symbol(slot, Type::Function(Box::new(signature.clone())));
        }

        let arg_names: Vec<String> = args.iter().map(|&r| self.name(r)).collect();
        self.frame.write(istr.dest, signature.ret, 0);
        format!("r{} = {}({})", istr.dest, callee_name, arg_names.join(", "))
    }

    fn branch(&mut self, location: usize, istr: Instruction, line: &mut DisassemblyLine) -> String {
        let Some(target) = istr.branch_target().map(|t| t as usize) else {
            return String::new();
        };
        line.target = Some(target);
        self.frame.add_target_label(target);
        if target < location {
            self.frame.backward_jumps.push(BackwardJump { location, target });
        }
        let label = if target + 1 == self.instructions.len() {
            "L_RETURN".to_string()
        } else {
            let last = self.instructions.len() - 1;
            let index = self
                .frame
                .labels
                .iter()
                .filter(|&&l| l != last)
                .position(|&l| l == target)
                .unwrap_or(0);
            format!("L_{}", index)
        };

        match istr.opcode {
            Opcode::Branch => format!("GOTO {}", label),
            _ => {
                let mut register = istr.op1;
                let mut negated = istr.opcode == Opcode::BranchIfNot;
                // `r = !x; BranchIf r` → `BranchIfNot x`
                if let Some(prev) = location.checked_sub(1).map(|l| self.instructions[l]) {
                    if prev.opcode == Opcode::OpLogNot && prev.dest == register {
                        register = prev.op1;
                        negated = !negated;
                        line.condition = Some((register, negated));
                    }
                }
                let name = self.name(register);
                if negated {
                    format!("IF NOT {} GOTO {}", name, label)
                } else {
                    format!("IF {} GOTO {}", name, label)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::tests_support::{ImageBuilder, SymbolImage};
    use crate::sid::SidTable;
    use Opcode::*;

    fn resolver() -> SidResolver {
        let table: SidTable = ["ddict-key-count", "DetermineArgumentType"].into_iter().collect();
        SidResolver::with_backend(Box::new(table))
    }

    fn ins(op: Opcode, dest: u8, op1: u8, op2: u8) -> Instruction {
        Instruction::new(op, dest, op1, op2)
    }

    #[test]
    fn test_argument_type_inference() -> anyhow::Result<()> {
        let resolver = resolver();
        let disassembler = Disassembler::new(&resolver);
        let function = disassembler.disassemble(
            "DetermineArgumentType",
            &[ins(LoadU16Imm, 0, 5, 0), ins(IEqual, 1, 49, 0), ins(Return, 1, 0, 0)],
            ConstantPool::default(),
            0,
        )?;
        assert_eq!(function.frame.argument_count, 1);
        assert_eq!(function.frame.argument_types[0], Type::U16);
        assert_eq!(function.frame.return_type, Type::Bool);
        assert_eq!(function.signature(), "bool DetermineArgumentType(u16 arg_0)");
        assert_eq!(function.lines[1].comment, "r1 = arg_0 == r0");
        Ok(())
    }

    #[test]
    fn test_listing_text_and_labels() -> anyhow::Result<()> {
        let resolver = resolver();
        let disassembler = Disassembler::new(&resolver);
        let function = disassembler.disassemble(
            "f",
            &[
                ins(LoadU16Imm, 0, 0, 0),
                ins(BranchIfNot, 4, 0, 0),
                ins(LoadU16Imm, 1, 1, 0),
                ins(Branch, 1, 0, 0),
                ins(Return, 0, 0, 0),
            ],
            ConstantPool::default(),
            0x100,
        )?;
        assert_eq!(
            function.lines[0].text,
            format!("0000   0x000100   0C 00 00 00   {:<21}r0, 0", "LoadU16Imm")
        );
        assert_eq!(function.lines[1].target, Some(4));
        assert_eq!(function.lines[1].comment, "IF NOT r0 GOTO L_RETURN");
        assert_eq!(function.lines[3].comment, "GOTO L_0");
        assert_eq!(function.label_name(1).as_deref(), Some("L_0"));
        assert_eq!(function.label_name(4).as_deref(), Some("L_RETURN"));
        assert_eq!(
            function.frame.backward_jumps,
            vec![BackwardJump { location: 3, target: 1 }]
        );
        assert!(function.listing().contains("L_RETURN:\n"));
        Ok(())
    }

    #[test]
    fn test_call_binds_function_signature() -> anyhow::Result<()> {
        let resolver = resolver();
        let disassembler = Disassembler::new(&resolver);
        let pool = ConstantPool::from_values(&[sid64("ddict-key-count")]);
        let function = disassembler.disassemble(
            "f",
            &[
                ins(LookupPointer, 0, 0, 0),
                ins(LoadU16Imm, 49, 5, 0),
                ins(Call, 0, 0, 1),
                ins(Return, 0, 0, 0),
            ],
            pool,
            0,
        )?;
        assert_eq!(function.lines[0].comment, "r0 = ST[0] -> <ddict-key-count>");
        assert_eq!(function.lines[2].comment, "r0 = ddict-key-count(r49)");
        let bound = function.frame.symbol_types[0].as_function().cloned();
        assert_eq!(bound.map(|f| f.params.len()), Some(1));
        assert_eq!(function.frame.argument_count, 0);
        assert!(function
            .symbol_table_dump(&resolver)
            .starts_with("0000   0x000000   function: ddict-key-count (u16) -> u64?"));
        Ok(())
    }

    #[test]
    fn test_builtin_signature() -> anyhow::Result<()> {
        let resolver = resolver();
        let disassembler = Disassembler::new(&resolver);
        let pool = ConstantPool::from_values(&[sid64("get-int32")]);
        let function = disassembler.disassemble(
            "f",
            &[ins(LookupPointer, 0, 0, 0), ins(Call, 0, 0, 2), ins(Return, 0, 0, 0)],
            pool,
            0,
        )?;
        assert_eq!(function.frame.return_type, Type::I32);
        Ok(())
    }

    #[test]
    fn test_pointer_arithmetic_and_symbol_binding_once() -> anyhow::Result<()> {
        let resolver = resolver();
        let disassembler = Disassembler::new(&resolver);
        let pool = ConstantPool::from_values(&[0x1234, 8]);
        let function = disassembler.disassemble(
            "f",
            &[
                ins(LookupPointer, 0, 0, 0),
                ins(LoadStaticInt, 1, 1, 0),
                ins(IAdd, 2, 0, 1),
                ins(LoadStaticFloat, 3, 1, 0),
                ins(LoadI32, 4, 2, 0),
                ins(Return, 4, 0, 0),
            ],
            pool,
            0,
        )?;
        let pointer = function.frame.register(2).pointer;
        assert_eq!(pointer, Some(PointerValue { base: 0x1234, offset: 8 }));
        // スロット1は最初のLoadStaticIntで確定
        assert_eq!(function.frame.symbol_types[1], Type::I64);
        assert_eq!(function.frame.return_type, Type::I32);
        Ok(())
    }

    #[test]
    fn test_void_return_and_errors() {
        let resolver = resolver();
        let disassembler = Disassembler::new(&resolver);
        let function = disassembler
            .disassemble("f", &[ins(Return, 0, 0, 0)], ConstantPool::default(), 0)
            .unwrap();
        assert_eq!(function.frame.return_type, Type::Void);

        assert_eq!(
            disassembler.disassemble("f", &[], ConstantPool::default(), 0).err(),
            Some(DecodeError::EmptyFunction)
        );
        assert_eq!(
            disassembler
                .disassemble("f", &[ins(LookupInt, 0, 3, 0), ins(Return, 0, 0, 0)], ConstantPool::default(), 0)
                .err(),
            Some(DecodeError::SymbolSlotOutOfRange { line: 0, slot: 3, len: 0 })
        );
    }

    #[test]
    fn test_not_branch_chain_is_canonicalized() -> anyhow::Result<()> {
        let resolver = resolver();
        let disassembler = Disassembler::new(&resolver);
        let function = disassembler.disassemble(
            "f",
            &[
                ins(LoadU16Imm, 0, 1, 0),
                ins(OpLogNot, 1, 0, 0),
                ins(BranchIf, 3, 1, 0),
                ins(Return, 0, 0, 0),
            ],
            ConstantPool::default(),
            0,
        )?;
        assert_eq!(function.lines[2].condition, Some((0, true)));
        assert_eq!(function.lines[2].comment, "IF NOT r0 GOTO L_RETURN");
        Ok(())
    }

    #[test]
    fn test_disassemble_from_container() -> anyhow::Result<()> {
        let raw = ImageBuilder::new()
            .function(
                "ddict-key-count",
                &[ins(LoadStaticPointer, 0, 0, 0), ins(Return, 0, 0, 0)],
                vec![SymbolImage::Str("hello".to_string())],
            )
            .build();
        let container = DcContainer::from_bytes(raw)?;
        let functions = container.script_functions()?;
        let resolver = resolver();
        let function = Disassembler::new(&resolver).disassemble_function(&container, &functions[0])?;
        assert_eq!(function.id, "ddict-key-count");
        assert_eq!(function.lines[0].comment, "r0 = ST[0] -> <\"hello\">");
        assert_eq!(function.frame.return_type, Type::String);
        assert!(function.symbol_table_dump(&resolver).contains("string: \"hello\""));
        Ok(())
    }
}
