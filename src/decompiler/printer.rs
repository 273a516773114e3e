/// 疑似コード出力
///
/// 構文木を再帰的に文字列化する。構文（C / Racket）の違いはここだけで扱い、構造は変えない。

use super::ast::{BinaryOp, Block, Expr, Literal, Stmt, UnaryOp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 出力構文
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Syntax {
    #[default]
    C,
    Racket,
}

impl FromStr for Syntax {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "c" => Ok(Syntax::C),
            "racket" | "rkt" => Ok(Syntax::Racket),
            other => Err(format!("unknown syntax '{}' (expected c or racket)", other)),
        }
    }
}

impl fmt::Display for Syntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Syntax::C => f.write_str("c"),
            Syntax::Racket => f.write_str("racket"),
        }
    }
}

/// 出力設定。呼び出しごとに明示的に渡す
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    pub syntax: Syntax,
    pub indent_width: usize,
    /// 本体の前にシンボルテーブルを出す
    pub emit_symbol_table: bool,
    /// 本体の前に逆アセンブルリストを出す
    pub emit_disassembly: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            syntax: Syntax::C,
            indent_width: 4,
            emit_symbol_table: true,
            emit_disassembly: false,
        }
    }
}

/// 疑似コード生成器
pub struct PseudocodePrinter {
    options: RenderOptions,
    output: Vec<String>,
    indent_level: usize,
}

impl PseudocodePrinter {
    pub fn new(options: RenderOptions) -> Self {
        Self {
            options,
            output: Vec::new(),
            indent_level: 0,
        }
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    fn indent(&mut self) {
        self.indent_level += 1;
    }

    fn dedent(&mut self) {
        self.indent_level = self.indent_level.saturating_sub(1);
    }

    fn current_indent(&self) -> String {
        " ".repeat(self.indent_level * self.options.indent_width)
    }

    fn emit_line(&mut self, line: impl AsRef<str>) {
        let indent = self.current_indent();
        for (i, part) in line.as_ref().split('\n').enumerate() {
            // 複数行の式は2行目以降をそのまま続ける
            if i == 0 {
                self.output.push(format!("{}{}", indent, part));
            } else {
                self.output.push(part.to_string());
            }
        }
    }

    /// 直前の行の末尾に追記（Racketの閉じ括弧）
    fn close(&mut self, suffix: &str) {
        match self.output.last_mut() {
            Some(line) => line.push_str(suffix),
            None => self.output.push(suffix.to_string()),
        }
    }

    fn take(&mut self) -> String {
        let text = self.output.join("\n");
        self.output.clear();
        self.indent_level = 0;
        text
    }

    /// 関数全体
    pub fn render_function(&mut self, signature: &str, name: &str, params: &[String], body: &Block) -> String {
        match self.options.syntax {
            Syntax::C => {
                self.emit_line(format!("{} {{", signature));
                self.indent();
                self.c_block(body);
                self.dedent();
                self.emit_line("}");
            }
            Syntax::Racket => {
                self.emit_line(format!(";; {}", signature));
                let head = std::iter::once(name.to_string())
                    .chain(params.iter().cloned())
                    .collect::<Vec<_>>()
                    .join(" ");
                self.emit_line(format!("(define ({})", head));
                self.indent();
                self.racket_block(body);
                self.dedent();
                self.close(")");
            }
        }
        self.take()
    }

    /// 文の並びだけ
    pub fn render_block(&mut self, block: &Block) -> String {
        match self.options.syntax {
            Syntax::C => self.c_block(block),
            Syntax::Racket => self.racket_block(block),
        }
        self.take()
    }

    pub fn render_expr(&self, expr: &Expr) -> String {
        match self.options.syntax {
            Syntax::C => self.c_expr(expr),
            Syntax::Racket => self.racket_expr(expr),
        }
    }

    // ---- C ----

    fn c_block(&mut self, block: &Block) {
        for stmt in &block.statements {
            self.c_stmt(stmt);
        }
    }

    fn c_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Block(block) => {
                self.emit_line("{");
                self.indent();
                self.c_block(block);
                self.dedent();
                self.emit_line("}");
            }
            Stmt::If { .. } => {
                self.c_if(stmt, "");
                self.emit_line("}");
            }
            Stmt::While { condition, body } => {
                let line = format!("while ({}) {{", self.c_expr(condition));
                self.emit_line(line);
                self.indent();
                self.c_block(body);
                self.dedent();
                self.emit_line("}");
            }
            Stmt::Return(None) => self.emit_line("return;"),
            Stmt::Return(Some(value)) => {
                let line = format!("return {};", self.c_expr(value));
                self.emit_line(line);
            }
            Stmt::VarDecl { ty, name, init } => {
                let line = match init {
                    Some(value) => format!("{} {} = {};", ty, name, self.c_expr(value)),
                    None => format!("{} {};", ty, name),
                };
                self.emit_line(line);
            }
            Stmt::Assign { target, value } => {
                let line = format!("{} = {};", self.c_expr(target), self.c_expr(value));
                self.emit_line(line);
            }
            Stmt::Expression(expr) => {
                let line = format!("{};", self.c_expr(expr));
                self.emit_line(line);
            }
            Stmt::Break => self.emit_line("break;"),
            Stmt::Continue => self.emit_line("continue;"),
        }
    }

    /// `if` と else 連鎖。最後の `}` は呼び出し側
    fn c_if(&mut self, stmt: &Stmt, prefix: &str) {
        let Stmt::If {
            condition,
            then_block,
            else_branch,
        } = stmt
        else {
            return;
        };
        let line = format!("{}if ({}) {{", prefix, self.c_expr(condition));
        self.emit_line(line);
        self.indent();
        self.c_block(then_block);
        self.dedent();

        match else_branch.as_deref() {
            None => {}
            Some(nested @ Stmt::If { .. }) => self.c_if(nested, "} else "),
            Some(Stmt::Block(block)) => {
                self.emit_line("} else {");
                self.indent();
                self.c_block(block);
                self.dedent();
            }
            Some(other) => {
                self.emit_line("} else {");
                self.indent();
                self.c_stmt(other);
                self.dedent();
            }
        }
    }

    fn c_operand(&self, expr: &Expr) -> String {
        match expr {
            Expr::Binary { .. } | Expr::Ternary { .. } => format!("({})", self.c_expr(expr)),
            _ => self.c_expr(expr),
        }
    }

    fn c_expr(&self, expr: &Expr) -> String {
        match expr {
            Expr::Literal(literal) => c_literal(literal),
            Expr::Identifier { name, .. } => name.clone(),
            Expr::Binary {
                op: BinaryOp::BitNor,
                lhs,
                rhs,
            } => format!("~({} | {})", self.c_operand(lhs), self.c_operand(rhs)),
            Expr::Binary { op, lhs, rhs } => {
                format!("{} {} {}", self.c_operand(lhs), op.symbol(), self.c_operand(rhs))
            }
            Expr::Unary {
                op: UnaryOp::Abs,
                operand,
            } => format!("abs({})", self.c_expr(operand)),
            Expr::Unary { op, operand } => format!("{}{}", op.symbol(), self.c_operand(operand)),
            Expr::Call { callee, args } => {
                let callee = match callee.as_ref() {
                    Expr::Literal(_) | Expr::Identifier { .. } => self.c_expr(callee),
                    other => format!("({})", self.c_expr(other)),
                };
                let args: Vec<String> = args.iter().map(|a| self.c_expr(a)).collect();
                format!("{}({})", callee, args.join(", "))
            }
            Expr::Cast { ty, expr } => format!("({}){}", ty, self.c_operand(expr)),
            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
            } => format!(
                "{} ? {} : {}",
                self.c_operand(condition),
                self.c_operand(then_expr),
                self.c_operand(else_expr)
            ),
            Expr::Dereference { ty, pointer } => format!("*({}*){}", ty, self.c_operand(pointer)),
            Expr::Subscript { base, index } => format!("{}[{}]", self.c_operand(base), self.c_expr(index)),
            Expr::Unrepresentable(_) => "/* unrepresentable */".to_string(),
        }
    }

    // ---- Racket ----

    fn racket_block(&mut self, block: &Block) {
        for stmt in &block.statements {
            self.racket_stmt(stmt);
        }
    }

    /// 分岐の片側。複数文は `begin` で包む
    fn racket_branch(&mut self, stmts: &[Stmt]) {
        match stmts {
            [single] => self.racket_stmt(single),
            _ => {
                self.emit_line("(begin");
                self.indent();
                for stmt in stmts {
                    self.racket_stmt(stmt);
                }
                self.dedent();
                self.close(")");
            }
        }
    }

    fn racket_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Block(block) => self.racket_branch(&block.statements),
            Stmt::If {
                condition,
                then_block,
                else_branch,
            } => {
                let keyword = if else_branch.is_some() { "if" } else { "when" };
                let line = format!("({} {}", keyword, self.racket_expr(condition));
                self.emit_line(line);
                self.indent();
                if else_branch.is_some() {
                    self.racket_branch(&then_block.statements);
                } else {
                    self.racket_block(then_block);
                }
                match else_branch.as_deref() {
                    Some(Stmt::Block(block)) => self.racket_branch(&block.statements),
                    Some(other) => self.racket_stmt(other),
                    None => {}
                }
                self.dedent();
                self.close(")");
            }
            Stmt::While { condition, body } => {
                let line = format!("(while {}", self.racket_expr(condition));
                self.emit_line(line);
                self.indent();
                self.racket_block(body);
                self.dedent();
                self.close(")");
            }
            Stmt::Return(None) => self.emit_line("(return)"),
            Stmt::Return(Some(value)) => {
                let line = format!("(return {})", self.racket_expr(value));
                self.emit_line(line);
            }
            Stmt::VarDecl { name, init, .. } => {
                let line = match init {
                    Some(value) => format!("(define {} {})", name, self.racket_expr(value)),
                    None => format!("(define {} #f)", name),
                };
                self.emit_line(line);
            }
            Stmt::Assign { target, value } => {
                let line = format!("(set! {} {})", self.racket_expr(target), self.racket_expr(value));
                self.emit_line(line);
            }
            Stmt::Expression(expr) => {
                let line = self.racket_expr(expr);
                self.emit_line(line);
            }
            Stmt::Break => self.emit_line("(break)"),
            Stmt::Continue => self.emit_line("(continue)"),
        }
    }

    fn racket_expr(&self, expr: &Expr) -> String {
        match expr {
            Expr::Literal(literal) => racket_literal(literal),
            Expr::Identifier { name, .. } => name.clone(),
            Expr::Binary { op, .. } if op.is_logical() => {
                let mut operands = Vec::new();
                flatten_logical(expr, *op, &mut operands);
                let keyword = if *op == BinaryOp::And { "and" } else { "or" };
                // 2行目以降は最初のオペランドの位置に揃える
                let continuation = format!(
                    "\n{}{}",
                    " ".repeat((self.indent_level + 1) * self.options.indent_width),
                    " ".repeat(keyword.len() + 2)
                );
                let parts: Vec<String> = operands.iter().map(|e| self.racket_expr(e)).collect();
                format!("({} {})", keyword, parts.join(&continuation))
            }
            Expr::Binary {
                op: BinaryOp::BitNor,
                lhs,
                rhs,
            } => format!(
                "(bitwise-not (bitwise-ior {} {}))",
                self.racket_expr(lhs),
                self.racket_expr(rhs)
            ),
            Expr::Binary { op, lhs, rhs } => format!(
                "({} {} {})",
                racket_operator(*op),
                self.racket_expr(lhs),
                self.racket_expr(rhs)
            ),
            Expr::Unary { op, operand } => {
                let name = match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::Not => "not",
                    UnaryOp::BitNot => "bitwise-not",
                    UnaryOp::Abs => "abs",
                };
                format!("({} {})", name, self.racket_expr(operand))
            }
            Expr::Call { callee, args } => {
                let parts: Vec<String> = std::iter::once(callee.as_ref())
                    .chain(args.iter())
                    .map(|e| self.racket_expr(e))
                    .collect();
                format!("({})", parts.join(" "))
            }
            Expr::Cast { ty, expr } => format!("(cast {} {})", ty, self.racket_expr(expr)),
            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
            } => format!(
                "(if {} {} {})",
                self.racket_expr(condition),
                self.racket_expr(then_expr),
                self.racket_expr(else_expr)
            ),
            Expr::Dereference { ty, pointer } => format!("(deref {} {})", ty, self.racket_expr(pointer)),
            Expr::Subscript { base, index } => {
                format!("(index {} {})", self.racket_expr(base), self.racket_expr(index))
            }
            Expr::Unrepresentable(_) => "#<unrepresentable>".to_string(),
        }
    }
}

fn flatten_logical<'e>(expr: &'e Expr, op: BinaryOp, out: &mut Vec<&'e Expr>) {
    match expr {
        Expr::Binary { op: inner, lhs, rhs } if *inner == op => {
            flatten_logical(lhs, op, out);
            flatten_logical(rhs, op, out);
        }
        other => out.push(other),
    }
}

fn racket_operator(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Eq => "=",
        BinaryOp::Ne => "!=",
        BinaryOp::Mod => "modulo",
        BinaryOp::BitAnd => "bitwise-and",
        BinaryOp::BitOr => "bitwise-ior",
        BinaryOp::BitXor => "bitwise-xor",
        BinaryOp::Shl => "arithmetic-shift",
        BinaryOp::And => "and",
        BinaryOp::Or => "or",
        other => other.symbol(),
    }
}

/// 小数点以下2桁（切り捨て）
pub fn format_float(value: f32) -> String {
    let truncated = (value as f64 * 100.0).trunc() / 100.0;
    format!("{:.2}", truncated)
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn c_literal(literal: &Literal) -> String {
    match literal {
        Literal::Int(v) => v.to_string(),
        Literal::UInt(v) => v.to_string(),
        Literal::Float(v) => format_float(*v),
        Literal::Bool(v) => v.to_string(),
        Literal::String(s) => format!("\"{}\"", escape(s)),
        Literal::Sid(name) => name.clone(),
    }
}

fn racket_literal(literal: &Literal) -> String {
    match literal {
        Literal::Bool(true) => "#t".to_string(),
        Literal::Bool(false) => "#f".to_string(),
        Literal::Sid(name) => format!("'{}", name),
        other => c_literal(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::types::Type;

    fn c() -> PseudocodePrinter {
        PseudocodePrinter::new(RenderOptions::default())
    }

    fn racket() -> PseudocodePrinter {
        PseudocodePrinter::new(RenderOptions {
            syntax: Syntax::Racket,
            ..RenderOptions::default()
        })
    }

    fn counter_loop() -> Block {
        let v = Expr::typed_ident("var_0", Type::U16);
        Block::new(vec![
            Stmt::VarDecl {
                ty: Type::U16,
                name: "var_0".to_string(),
                init: Some(Expr::int(3)),
            },
            Stmt::While {
                condition: Expr::binary(BinaryOp::Gt, v.clone(), Expr::int(0)),
                body: Block::new(vec![Stmt::Assign {
                    target: v.clone(),
                    value: Expr::binary(BinaryOp::Sub, v.clone(), Expr::int(1)),
                }]),
            },
            Stmt::Return(Some(v)),
        ])
    }

    #[test]
    fn test_c_function() {
        let body = Block::new(vec![Stmt::Return(Some(Expr::binary(
            BinaryOp::Eq,
            Expr::ident("arg_0"),
            Expr::int(5),
        )))]);
        let text = c().render_function(
            "bool DetermineArgumentType(u16 arg_0)",
            "DetermineArgumentType",
            &["arg_0".to_string()],
            &body,
        );
        assert_eq!(text, "bool DetermineArgumentType(u16 arg_0) {\n    return arg_0 == 5;\n}");
    }

    #[test]
    fn test_c_nested_binary_is_parenthesised() {
        let sum = Expr::binary(BinaryOp::Add, Expr::int(1), Expr::int(1285));
        let expr = Expr::binary(BinaryOp::Add, sum.clone(), sum);
        assert_eq!(c().render_expr(&expr), "(1 + 1285) + (1 + 1285)");
    }

    #[test]
    fn test_c_loop() {
        let text = c().render_block(&counter_loop());
        assert_eq!(
            text,
            "u16 var_0 = 3;\nwhile (var_0 > 0) {\n    var_0 = var_0 - 1;\n}\nreturn var_0;"
        );
    }

    #[test]
    fn test_c_else_if_chain() {
        let x = Expr::ident("x");
        let stmt = Stmt::If {
            condition: Expr::binary(BinaryOp::Eq, x.clone(), Expr::int(1)),
            then_block: Block::new(vec![Stmt::Return(Some(Expr::int(10)))]),
            else_branch: Some(Box::new(Stmt::If {
                condition: Expr::binary(BinaryOp::Eq, x, Expr::int(2)),
                then_block: Block::new(vec![Stmt::Return(Some(Expr::int(20)))]),
                else_branch: Some(Box::new(Stmt::Block(Block::new(vec![Stmt::Return(Some(
                    Expr::int(30),
                ))])))),
            })),
        };
        let text = c().render_block(&Block::new(vec![stmt]));
        assert_eq!(
            text,
            "if (x == 1) {\n    return 10;\n} else if (x == 2) {\n    return 20;\n} else {\n    return 30;\n}"
        );
    }

    #[test]
    fn test_c_literals_and_placeholders() {
        let printer = c();
        assert_eq!(printer.render_expr(&Expr::Literal(Literal::Float(5.0))), "5.00");
        assert_eq!(printer.render_expr(&Expr::Literal(Literal::Float(-1.0))), "-1.00");
        assert_eq!(printer.render_expr(&Expr::Literal(Literal::Float(2.349))), "2.34");
        assert_eq!(
            printer.render_expr(&Expr::Unrepresentable("LoadStaticPointerImm".to_string())),
            "/* unrepresentable */"
        );
        let deref = Expr::Dereference {
            ty: Type::I32,
            pointer: Box::new(Expr::binary(BinaryOp::Add, Expr::ident("p"), Expr::int(3))),
        };
        assert_eq!(printer.render_expr(&deref), "*(i32*)(p + 3)");
    }

    #[test]
    fn test_racket_forms() {
        let text = racket().render_function(
            "u16 countdown()",
            "countdown",
            &[],
            &counter_loop(),
        );
        assert_eq!(
            text,
            ";; u16 countdown()\n(define (countdown)\n    (define var_0 3)\n    (while (> var_0 0)\n        (set! var_0 (- var_0 1)))\n    (return var_0))"
        );
    }

    #[test]
    fn test_racket_logical_flattening() {
        let a = Expr::ident("a");
        let b = Expr::ident("b");
        let c = Expr::ident("c");
        let expr = Expr::binary(
            BinaryOp::And,
            Expr::binary(BinaryOp::And, a, b),
            Expr::unary(UnaryOp::Not, c),
        );
        assert_eq!(racket().render_expr(&expr), "(and a\n         b\n         (not c))");
        assert_eq!(
            racket().render_expr(&Expr::Unrepresentable(String::new())),
            "#<unrepresentable>"
        );
    }

    #[test]
    fn test_syntax_from_str() {
        assert_eq!("C".parse::<Syntax>(), Ok(Syntax::C));
        assert_eq!("racket".parse::<Syntax>(), Ok(Syntax::Racket));
        assert!("lisp".parse::<Syntax>().is_err());
    }
}
