/// 型推論で扱う型
///
/// レジスタへの書き込みから推論される型。最初の書き込みで確定するまでは `Unknown`。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 型
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Type {
    /// 未知の型
    #[default]
    Unknown,
    /// 戻り値なし
    Void,
    /// 整数型
    Int(IntType),
    /// 浮動小数点型
    Float(FloatType),
    Bool,
    Char,
    /// 文字列テーブルへのポインタ
    String,
    /// 64bitハッシュ
    Sid,
    /// ポインタ型
    Pointer(Box<Type>),
    /// 関数型
    Function(Box<FunctionType>),
}

/// 整数型の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
}

/// 浮動小数点型の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FloatType {
    F32,
    F64,
}

/// 関数シグネチャ
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionType {
    pub ret: Type,
    /// (引数名, 型)
    pub params: Vec<(String, Type)>,
}

static CHAR: Type = Type::Char;

impl Type {
    pub const I8: Type = Type::Int(IntType::I8);
    pub const I16: Type = Type::Int(IntType::I16);
    pub const I32: Type = Type::Int(IntType::I32);
    pub const I64: Type = Type::Int(IntType::I64);
    pub const U8: Type = Type::Int(IntType::U8);
    pub const U16: Type = Type::Int(IntType::U16);
    pub const U32: Type = Type::Int(IntType::U32);
    pub const U64: Type = Type::Int(IntType::U64);
    pub const F32: Type = Type::Float(FloatType::F32);

    /// サイズから基本的な整数型を推論
    pub fn int_from_size(size: usize, signed: bool) -> Self {
        match (size, signed) {
            (1, true) => Type::I8,
            (1, false) => Type::U8,
            (2, true) => Type::I16,
            (2, false) => Type::U16,
            (4, true) => Type::I32,
            (4, false) => Type::U32,
            (8, true) => Type::I64,
            _ => Type::U64,
        }
    }

    pub fn pointer_to(pointee: Type) -> Self {
        Type::Pointer(Box::new(pointee))
    }

    pub fn function(ret: Type, params: Vec<(String, Type)>) -> Self {
        Type::Function(Box::new(FunctionType { ret, params }))
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Type::Unknown)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Int(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::Float(_))
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Pointer(_) | Type::String)
    }

    pub fn as_function(&self) -> Option<&FunctionType> {
        match self {
            Type::Function(f) => Some(f),
            _ => None,
        }
    }

    /// 指す先の型（`String` は `char`）
    pub fn pointee(&self) -> Option<&Type> {
        match self {
            Type::Pointer(inner) => Some(inner),
            Type::String => Some(&CHAR),
            _ => None,
        }
    }

    /// バイトサイズ
    pub fn size(&self) -> Option<usize> {
        match self {
            Type::Int(IntType::I8 | IntType::U8) | Type::Bool | Type::Char => Some(1),
            Type::Int(IntType::I16 | IntType::U16) => Some(2),
            Type::Int(IntType::I32 | IntType::U32) | Type::Float(FloatType::F32) => Some(4),
            Type::Int(_) | Type::Float(FloatType::F64) | Type::Sid => Some(8),
            Type::Pointer(_) | Type::String | Type::Function(_) => Some(8),
            Type::Unknown | Type::Void => None,
        }
    }

    /// 宣言で使う型名
    pub fn to_c_string(&self) -> String {
        match self {
            Type::Unknown => "u64?".to_string(),
            Type::Void => "void".to_string(),
            Type::Int(int_ty) => match int_ty {
                IntType::I8 => "i8".to_string(),
                IntType::I16 => "i16".to_string(),
                IntType::I32 => "i32".to_string(),
                IntType::I64 => "i64".to_string(),
                IntType::U8 => "u8".to_string(),
                IntType::U16 => "u16".to_string(),
                IntType::U32 => "u32".to_string(),
                IntType::U64 => "u64".to_string(),
            },
            Type::Float(float_ty) => match float_ty {
                FloatType::F32 => "f32".to_string(),
                FloatType::F64 => "f64".to_string(),
            },
            Type::Bool => "bool".to_string(),
            Type::Char => "char".to_string(),
            Type::String => "string".to_string(),
            Type::Sid => "sid".to_string(),
            Type::Pointer(inner) => format!("{}*", inner.to_c_string()),
            Type::Function(func) => {
                let params: Vec<String> = func.params.iter().map(|(_, t)| t.to_c_string()).collect();
                format!("({}) -> {}", params.join(", "), func.ret.to_c_string())
            }
        }
    }

    /// 型が互換性があるかチェック
    pub fn is_compatible_with(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Unknown, _) | (_, Type::Unknown) => true,
            (Type::Int(_), Type::Int(_)) => true,
            (Type::Float(_), Type::Float(_)) => true,
            (Type::Pointer(_) | Type::String, Type::Pointer(_) | Type::String) => true,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_c_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        assert_eq!(Type::Unknown.to_c_string(), "u64?");
        assert_eq!(Type::pointer_to(Type::I32).to_c_string(), "i32*");
        let get_int32 = Type::function(
            Type::I32,
            vec![("symbol".to_string(), Type::Sid), ("location".to_string(), Type::Sid)],
        );
        assert_eq!(get_int32.to_string(), "(sid, sid) -> i32");
    }

    #[test]
    fn test_sizes_and_pointee() {
        assert_eq!(Type::int_from_size(2, false), Type::U16);
        assert_eq!(Type::F32.size(), Some(4));
        assert_eq!(Type::String.pointee(), Some(&Type::Char));
        assert!(Type::String.is_compatible_with(&Type::pointer_to(Type::U8)));
        assert!(!Type::Bool.is_compatible_with(&Type::F32));
    }
}
