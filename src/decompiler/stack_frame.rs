/// レジスタファイルと定数プール
///
/// `StackFrame` は1関数ぶんのシミュレーション状態。関数ごとに作り直す。

use super::instruction::{ARGUMENT_REGISTER_END, ARGUMENT_REGISTER_START, REGISTER_COUNT};
use super::types::Type;
use serde::{Deserialize, Serialize};

/// 定数プールのスロットの種類
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstantKind {
    /// 生の8バイト（整数・浮動小数点・ハッシュ）
    Value,
    /// 再配置されたポインタ（ファイル内オフセット）
    Pointer { target: u64 },
    /// 文字列テーブルへのポインタ
    String(String),
}

/// 定数プールの1スロット
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    /// スロット自身のファイルオフセット
    pub offset: u64,
    pub raw: u64,
    pub kind: ConstantKind,
}

impl Constant {
    pub fn as_i64(&self) -> i64 {
        self.raw as i64
    }

    /// 下位32bitをf32として読む
    pub fn as_f32(&self) -> f32 {
        f32::from_bits(self.raw as u32)
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            ConstantKind::String(s) => Some(s),
            _ => None,
        }
    }
}

/// 関数の定数プール（シンボルテーブル）。8バイト単位でインデックスされる
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstantPool {
    base_offset: u64,
    slots: Vec<Constant>,
}

impl ConstantPool {
    pub fn new(base_offset: u64) -> Self {
        Self {
            base_offset,
            slots: Vec::new(),
        }
    }

    /// 生の値だけからなるプール
    pub fn from_values(values: &[u64]) -> Self {
        let mut pool = Self::new(0);
        for &value in values {
            pool.push_value(value);
        }
        pool
    }

    fn next_offset(&self) -> u64 {
        self.base_offset + self.slots.len() as u64 * 8
    }

    pub fn push_value(&mut self, raw: u64) -> usize {
        self.push(raw, ConstantKind::Value)
    }

    pub fn push_string(&mut self, raw: u64, value: impl Into<String>) -> usize {
        self.push(raw, ConstantKind::String(value.into()))
    }

    pub fn push(&mut self, raw: u64, kind: ConstantKind) -> usize {
        let offset = self.next_offset();
        self.slots.push(Constant { offset, raw, kind });
        self.slots.len() - 1
    }

    pub fn get(&self, slot: usize) -> Option<&Constant> {
        self.slots.get(slot)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constant> {
        self.slots.iter()
    }
}

/// ポインタ値（ベースのハッシュ + バイトオフセット）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointerValue {
    pub base: u64,
    pub offset: u64,
}

/// 論理レジスタ
#[derive(Debug, Clone, Default)]
pub struct Register {
    pub ty: Type,
    /// 生の64bit値
    pub value: u64,
    pub pointer: Option<PointerValue>,
    /// 関数入口の引数をまだ保持している場合の引数番号
    pub argument: Option<u8>,
    /// 定数プールから読み込まれた場合のスロット
    pub from_symbol: Option<u8>,
    pub written: bool,
}

impl Register {
    /// 型が未確定なら設定
    pub fn set_first_type(&mut self, ty: Type) {
        if self.ty.is_unknown() {
            self.ty = ty;
        }
    }

    pub fn is_pointer(&self) -> bool {
        self.pointer.is_some() || self.ty.is_pointer()
    }

    /// 書き込みで引数・定数の由来を失う
    fn overwrite(&mut self, ty: Type, value: u64) {
        self.ty = ty;
        self.value = value;
        self.pointer = None;
        self.argument = None;
        self.from_symbol = None;
        self.written = true;
    }
}

/// 後方ジャンプ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackwardJump {
    /// 分岐命令の行
    pub location: usize,
    /// 分岐先の行
    pub target: usize,
}

/// 1関数ぶんのレジスタ状態と、そこから推論された情報
#[derive(Debug, Clone)]
pub struct StackFrame {
    registers: Vec<Register>,
    /// 定数プールのスロットごとの型（最初に確定した型）
    pub symbol_types: Vec<Type>,
    /// 分岐先の行（初出順）
    pub labels: Vec<usize>,
    pub backward_jumps: Vec<BackwardJump>,
    pub argument_types: Vec<Type>,
    pub argument_count: usize,
    pub return_type: Type,
}

impl StackFrame {
    pub fn new(symbol_count: usize) -> Self {
        let mut registers = vec![Register::default(); REGISTER_COUNT];
        for r in ARGUMENT_REGISTER_START..ARGUMENT_REGISTER_END {
            registers[r as usize].argument = Some(r - ARGUMENT_REGISTER_START);
        }
        Self {
            registers,
            symbol_types: vec![Type::Unknown; symbol_count],
            labels: Vec::new(),
            backward_jumps: Vec::new(),
            argument_types: vec![Type::Unknown; (ARGUMENT_REGISTER_END - ARGUMENT_REGISTER_START) as usize],
            argument_count: 0,
            return_type: Type::Unknown,
        }
    }

    /// 範囲外は呼び出し前に検査済みであること
    pub fn register(&self, index: u8) -> &Register {
        &self.registers[index as usize % REGISTER_COUNT]
    }

    pub fn register_mut(&mut self, index: u8) -> &mut Register {
        &mut self.registers[index as usize % REGISTER_COUNT]
    }

    /// レジスタの型（引数の場合は推論済みの引数型）
    pub fn type_of(&self, index: u8) -> Type {
        let register = self.register(index);
        match register.argument {
            Some(arg) if register.ty.is_unknown() => self.argument_types[arg as usize].clone(),
            _ => register.ty.clone(),
        }
    }

    pub fn write(&mut self, index: u8, ty: Type, value: u64) {
        self.register_mut(index).overwrite(ty, value);
    }

    pub fn write_pointer(&mut self, index: u8, ty: Type, pointer: PointerValue) {
        let register = self.register_mut(index);
        register.overwrite(ty, pointer.base.wrapping_add(pointer.offset));
        register.pointer = Some(pointer);
    }

    /// レジスタ間コピー
    pub fn copy(&mut self, dest: u8, src: u8) {
        let mut copied = self.register(src).clone();
        if copied.ty.is_unknown() {
            copied.ty = self.type_of(src);
        }
        copied.written = true;
        *self.register_mut(dest) = copied;
    }

    /// シンボルテーブルのスロット型を束縛（最初の1回だけ）
    pub fn bind_symbol(&mut self, slot: u8, ty: Type) -> bool {
        match self.symbol_types.get_mut(slot as usize) {
            Some(current) if current.is_unknown() => {
                *current = ty;
                true
            }
            _ => false,
        }
    }

    /// 引数の型を束縛（最初の1回だけ）
    pub fn bind_argument(&mut self, arg: u8, ty: Type) {
        if ty.is_unknown() {
            return;
        }
        if let Some(current) = self.argument_types.get_mut(arg as usize) {
            if current.is_unknown() {
                *current = ty;
            }
        }
    }

    /// ラベルを登録して番号を返す
    pub fn add_target_label(&mut self, target: usize) -> usize {
        match self.labels.iter().position(|&l| l == target) {
            Some(index) => index,
            None => {
                self.labels.push(target);
                self.labels.len() - 1
            }
        }
    }

    pub fn is_label(&self, line: usize) -> bool {
        self.labels.contains(&line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_registers_start_flagged() {
        let frame = StackFrame::new(0);
        assert_eq!(frame.register(49).argument, Some(0));
        assert_eq!(frame.register(69).argument, Some(20));
        assert_eq!(frame.register(70).argument, None);
        assert_eq!(frame.register(48).argument, None);
    }

    #[test]
    fn test_symbol_binding_first_writer_wins() {
        let mut frame = StackFrame::new(2);
        assert!(frame.bind_symbol(1, Type::F32));
        assert!(!frame.bind_symbol(1, Type::I32));
        assert_eq!(frame.symbol_types[1], Type::F32);
        // 範囲外は無視
        assert!(!frame.bind_symbol(5, Type::I32));
    }

    #[test]
    fn test_write_clears_argument_origin() {
        let mut frame = StackFrame::new(0);
        frame.bind_argument(0, Type::U16);
        assert_eq!(frame.type_of(49), Type::U16);

        frame.write(49, Type::Bool, 1);
        assert_eq!(frame.register(49).argument, None);
        assert_eq!(frame.type_of(49), Type::Bool);
    }

    #[test]
    fn test_constant_pool_offsets() {
        let mut pool = ConstantPool::new(0x100);
        pool.push_value(5);
        let slot = pool.push_string(0x7F00_0000_0200, "hello");
        assert_eq!(slot, 1);
        assert_eq!(pool.get(1).map(|c| c.offset), Some(0x108));
        assert_eq!(pool.get(1).and_then(Constant::as_str), Some("hello"));
        assert_eq!(pool.get(0).map(Constant::as_i64), Some(5));
    }
}
