/// 復元結果の構文木
///
/// 式と文はそれぞれ閉じた列挙型。子ノードは親が排他的に所有する。

use super::types::Type;
use serde::{Deserialize, Serialize};

/// リテラル
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Int(i64),
    UInt(u64),
    Float(f32),
    Bool(bool),
    String(String),
    /// 解決済みのSID名（未解決なら `#XXXX...`）
    Sid(String),
}

/// 単項演算子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
    Abs,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "!",
            UnaryOp::BitNot => "~",
            UnaryOp::Abs => "abs",
        }
    }
}

/// 二項演算子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    BitAnd,
    BitOr,
    BitXor,
    BitNor,
    And,
    Or,
    Shl,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::BitNor => "~|",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Shl => "<<",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Lt | BinaryOp::Le
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    /// 比較の否定
    pub fn inverse_comparison(self) -> Option<BinaryOp> {
        match self {
            BinaryOp::Eq => Some(BinaryOp::Ne),
            BinaryOp::Ne => Some(BinaryOp::Eq),
            BinaryOp::Gt => Some(BinaryOp::Le),
            BinaryOp::Le => Some(BinaryOp::Gt),
            BinaryOp::Lt => Some(BinaryOp::Ge),
            BinaryOp::Ge => Some(BinaryOp::Lt),
            _ => None,
        }
    }
}

/// 式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Literal),
    Identifier {
        name: String,
        ty: Option<Type>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Cast {
        ty: Type,
        expr: Box<Expr>,
    },
    Ternary {
        condition: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    /// `*(T*)pointer`
    Dereference {
        ty: Type,
        pointer: Box<Expr>,
    },
    Subscript {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    /// 表現できない断片
    Unrepresentable(String),
}

impl Expr {
    pub fn int(value: i64) -> Self {
        Expr::Literal(Literal::Int(value))
    }

    pub fn ident(name: impl Into<String>) -> Self {
        Expr::Identifier {
            name: name.into(),
            ty: None,
        }
    }

    pub fn typed_ident(name: impl Into<String>, ty: Type) -> Self {
        Expr::Identifier {
            name: name.into(),
            ty: Some(ty),
        }
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn call(callee: Expr, args: Vec<Expr>) -> Self {
        Expr::Call {
            callee: Box::new(callee),
            args,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Expr::Literal(_))
    }

    /// ノード数
    pub fn complexity(&self) -> usize {
        match self {
            Expr::Literal(_) | Expr::Identifier { .. } | Expr::Unrepresentable(_) => 1,
            Expr::Binary { lhs, rhs, .. } => 1 + lhs.complexity() + rhs.complexity(),
            Expr::Unary { operand, .. } => 1 + operand.complexity(),
            Expr::Call { callee, args } => {
                1 + callee.complexity() + args.iter().map(Expr::complexity).sum::<usize>()
            }
            Expr::Cast { expr, .. } => 1 + expr.complexity(),
            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
            } => 1 + condition.complexity() + then_expr.complexity() + else_expr.complexity(),
            Expr::Dereference { pointer, .. } => 1 + pointer.complexity(),
            Expr::Subscript { base, index } => 1 + base.complexity() + index.complexity(),
        }
    }

    /// 呼び出しを含まない
    pub fn is_pure(&self) -> bool {
        match self {
            Expr::Call { .. } => false,
            Expr::Literal(_) | Expr::Identifier { .. } | Expr::Unrepresentable(_) => true,
            Expr::Binary { lhs, rhs, .. } => lhs.is_pure() && rhs.is_pure(),
            Expr::Unary { operand, .. } => operand.is_pure(),
            Expr::Cast { expr, .. } => expr.is_pure(),
            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
            } => condition.is_pure() && then_expr.is_pure() && else_expr.is_pure(),
            Expr::Dereference { pointer, .. } => pointer.is_pure(),
            Expr::Subscript { base, index } => base.is_pure() && index.is_pure(),
        }
    }

    /// 直下の部分式
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Literal(_) | Expr::Identifier { .. } | Expr::Unrepresentable(_) => Vec::new(),
            Expr::Binary { lhs, rhs, .. } => vec![&**lhs, &**rhs],
            Expr::Unary { operand, .. } => vec![&**operand],
            Expr::Call { callee, args } => std::iter::once(&**callee).chain(args.iter()).collect(),
            Expr::Cast { expr, .. } => vec![&**expr],
            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
            } => vec![&**condition, &**then_expr, &**else_expr],
            Expr::Dereference { pointer, .. } => vec![&**pointer],
            Expr::Subscript { base, index } => vec![&**base, &**index],
        }
    }

    pub fn children_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Expr::Literal(_) | Expr::Identifier { .. } | Expr::Unrepresentable(_) => Vec::new(),
            Expr::Binary { lhs, rhs, .. } => vec![&mut **lhs, &mut **rhs],
            Expr::Unary { operand, .. } => vec![&mut **operand],
            Expr::Call { callee, args } => std::iter::once(&mut **callee).chain(args.iter_mut()).collect(),
            Expr::Cast { expr, .. } => vec![&mut **expr],
            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
            } => vec![&mut **condition, &mut **then_expr, &mut **else_expr],
            Expr::Dereference { pointer, .. } => vec![&mut **pointer],
            Expr::Subscript { base, index } => vec![&mut **base, &mut **index],
        }
    }

    /// 自身か部分式のどれかが条件を満たす
    pub fn any(&self, pred: &impl Fn(&Expr) -> bool) -> bool {
        pred(self) || self.children().into_iter().any(|child| child.any(pred))
    }

    /// 変数名の出現回数
    pub fn count_references(&self, name: &str) -> usize {
        let own = matches!(self, Expr::Identifier { name: n, .. } if n == name) as usize;
        own + self.children().into_iter().map(|c| c.count_references(name)).sum::<usize>()
    }

    pub fn references(&self, name: &str) -> bool {
        self.any(&|e| matches!(e, Expr::Identifier { name: n, .. } if n == name))
    }

    /// メモリを読む（デリファレンスか添字）
    pub fn reads_memory(&self) -> bool {
        self.any(&|e| matches!(e, Expr::Dereference { .. } | Expr::Subscript { .. }))
    }

    pub fn has_call(&self) -> bool {
        !self.is_pure()
    }

    /// 変数の出現を式で置き換える。置き換えた数を返す
    pub fn substitute(&mut self, name: &str, replacement: &Expr) -> usize {
        if matches!(self, Expr::Identifier { name: n, .. } if n == name) {
            *self = replacement.clone();
            return 1;
        }
        self.children_mut()
            .into_iter()
            .map(|child| child.substitute(name, replacement))
            .sum()
    }

    /// 論理否定。二重否定の除去、比較の反転、ド・モルガン
    pub fn negate(self) -> Expr {
        match self {
            Expr::Unary {
                op: UnaryOp::Not,
                operand,
            } => *operand,
            Expr::Literal(Literal::Bool(b)) => Expr::Literal(Literal::Bool(!b)),
            Expr::Binary { op, lhs, rhs } if op.is_logical() => {
                let flipped = if op == BinaryOp::And { BinaryOp::Or } else { BinaryOp::And };
                Expr::binary(flipped, lhs.negate(), rhs.negate())
            }
            Expr::Binary { op, lhs, rhs } => match op.inverse_comparison() {
                Some(inverse) => Expr::Binary { op: inverse, lhs, rhs },
                None => Expr::unary(UnaryOp::Not, Expr::Binary { op, lhs, rhs }),
            },
            other => Expr::unary(UnaryOp::Not, other),
        }
    }
}

/// 文の並び
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub statements: Vec<Stmt>,
}

impl Block {
    pub fn new(statements: Vec<Stmt>) -> Self {
        Self { statements }
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }
}

/// 文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Block(Block),
    If {
        condition: Expr,
        then_block: Block,
        /// `Block` か、else if の場合は `If`
        else_branch: Option<Box<Stmt>>,
    },
    While {
        condition: Expr,
        body: Block,
    },
    Return(Option<Expr>),
    VarDecl {
        ty: Type,
        name: String,
        init: Option<Expr>,
    },
    Assign {
        target: Expr,
        value: Expr,
    },
    Expression(Expr),
    Break,
    Continue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negate_simplifies() {
        let x = Expr::ident("x");
        assert_eq!(Expr::unary(UnaryOp::Not, x.clone()).negate(), x);

        let cmp = Expr::binary(BinaryOp::Gt, x.clone(), Expr::int(0));
        assert_eq!(cmp.negate(), Expr::binary(BinaryOp::Le, x.clone(), Expr::int(0)));

        // !(a && !b) → !a || b
        let y = Expr::ident("y");
        let and = Expr::binary(BinaryOp::And, x.clone(), Expr::unary(UnaryOp::Not, y.clone()));
        assert_eq!(
            and.negate(),
            Expr::binary(BinaryOp::Or, Expr::unary(UnaryOp::Not, x), y)
        );
    }

    #[test]
    fn test_references_and_substitute() {
        let x = Expr::ident("x");
        let load = Expr::Dereference {
            ty: Type::I32,
            pointer: Box::new(x.clone()),
        };
        let mut sum = Expr::binary(BinaryOp::Add, load.clone(), x.clone());
        assert!(sum.references("x"));
        assert!(!sum.references("y"));
        assert_eq!(sum.count_references("x"), 2);
        assert!(sum.reads_memory());
        assert!(!x.reads_memory());

        assert_eq!(sum.substitute("x", &Expr::int(4)), 2);
        let load = Expr::Dereference {
            ty: Type::I32,
            pointer: Box::new(Expr::int(4)),
        };
        assert_eq!(sum, Expr::binary(BinaryOp::Add, load, Expr::int(4)));
    }

    #[test]
    fn test_complexity_and_purity() {
        let sum = Expr::binary(BinaryOp::Add, Expr::int(1), Expr::int(1285));
        assert_eq!(sum.complexity(), 3);
        assert!(sum.is_pure());
        let call = Expr::call(Expr::Literal(Literal::Sid("f".to_string())), vec![sum]);
        assert_eq!(call.complexity(), 5);
        assert!(!call.is_pure());
    }
}
