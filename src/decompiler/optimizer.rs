/// 構文木の最適化
///
/// 構造化復元の後に一度だけ走らせる。
/// 一度も代入されず、ちょうど1回だけ読まれる `var_N` を読み込み位置に埋め込み、宣言を消す。
/// 埋め込み先は同じブロックの後続の文の先頭の式に限る（ループ条件や入れ子のブロックには入れない）。
/// 間の文が初期化式の参照する変数に代入するとき、
/// または初期化式がメモリを読み、間でメモリの書き込みか呼び出しがあるときは畳まない。

use super::ast::{Block, Expr, Stmt};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Usage {
    reads: usize,
    assigns: usize,
}

/// 一度しか読まれない変数を畳み込む
pub fn fold_single_use_variables(body: Block, max_complexity: usize) -> Block {
    let mut usage = HashMap::new();
    for stmt in &body.statements {
        collect_usage(stmt, &mut usage);
    }
    let mut statements = body.statements;
    let folded = fold_statements(&mut statements, &usage, max_complexity);
    if folded > 0 {
        debug!("folded {} single-use variables", folded);
    }
    Block::new(statements)
}

fn collect_usage(stmt: &Stmt, usage: &mut HashMap<String, Usage>) {
    match stmt {
        Stmt::Assign {
            target: Expr::Identifier { name, .. },
            value,
        } => {
            usage.entry(name.clone()).or_default().assigns += 1;
            count_reads(value, usage);
        }
        _ => {
            for expr in expressions(stmt) {
                count_reads(expr, usage);
            }
        }
    }
    for nested in nested_statements(stmt) {
        collect_usage(nested, usage);
    }
}

fn count_reads(expr: &Expr, usage: &mut HashMap<String, Usage>) {
    if let Expr::Identifier { name, .. } = expr {
        usage.entry(name.clone()).or_default().reads += 1;
    }
    for child in expr.children() {
        count_reads(child, usage);
    }
}

fn fold_statements(statements: &mut Vec<Stmt>, usage: &HashMap<String, Usage>, max_complexity: usize) -> usize {
    let mut folded = 0;
    for stmt in statements.iter_mut() {
        folded += fold_nested(stmt, usage, max_complexity);
    }

    let mut index = 0;
    while index < statements.len() {
        let Some((name, init)) = candidate(&statements[index], usage, max_complexity) else {
            index += 1;
            continue;
        };
        let Some(target) = fold_position(statements, index, &name, &init) else {
            index += 1;
            continue;
        };
        let replaced: usize = heads_mut(&mut statements[target])
            .into_iter()
            .map(|expr| expr.substitute(&name, &init))
            .sum();
        if replaced == 1 {
            statements.remove(index);
            folded += 1;
        } else {
            index += 1;
        }
    }
    folded
}

fn fold_nested(stmt: &mut Stmt, usage: &HashMap<String, Usage>, max_complexity: usize) -> usize {
    match stmt {
        Stmt::Block(block) | Stmt::While { body: block, .. } => {
            fold_statements(&mut block.statements, usage, max_complexity)
        }
        Stmt::If {
            then_block,
            else_branch,
            ..
        } => {
            let mut folded = fold_statements(&mut then_block.statements, usage, max_complexity);
            if let Some(else_branch) = else_branch {
                folded += fold_nested(else_branch, usage, max_complexity);
            }
            folded
        }
        _ => 0,
    }
}

/// 畳み込める宣言なら (名前, 初期化式)
fn candidate(stmt: &Stmt, usage: &HashMap<String, Usage>, max_complexity: usize) -> Option<(String, Expr)> {
    let Stmt::VarDecl {
        name,
        init: Some(init),
        ..
    } = stmt
    else {
        return None;
    };
    let used = usage.get(name).copied().unwrap_or_default();
    let foldable = name.starts_with("var_")
        && used.reads == 1
        && used.assigns == 0
        && init.is_pure()
        && init.complexity() <= max_complexity;
    foldable.then(|| (name.clone(), init.clone()))
}

/// 読み込みを含む文の位置。途中で値が変わりうるなら `None`
fn fold_position(statements: &[Stmt], declared: usize, name: &str, init: &Expr) -> Option<usize> {
    let reads_memory = init.reads_memory();
    for (index, stmt) in statements.iter().enumerate().skip(declared + 1) {
        if any_statement(stmt, &|s| expressions(s).iter().any(|e| e.references(name))) {
            let heads = heads(stmt);
            let in_head = heads.iter().any(|e| e.references(name));
            let ordered = !reads_memory || !heads.iter().any(|e| e.has_call());
            return (in_head && ordered).then_some(index);
        }
        let clobbers = any_statement(stmt, &|s| match s {
            Stmt::Assign {
                target: Expr::Identifier { name: assigned, .. },
                ..
            } => init.references(assigned),
            _ => false,
        });
        if clobbers || (reads_memory && has_side_effects(stmt)) {
            return None;
        }
    }
    None
}

fn has_side_effects(stmt: &Stmt) -> bool {
    any_statement(stmt, &|s| {
        let stores = matches!(s, Stmt::Assign { target, .. } if !matches!(target, Expr::Identifier { .. }));
        stores || expressions(s).iter().any(|e| e.has_call())
    })
}

/// 文自身か入れ子の文のどれかが条件を満たす
fn any_statement(stmt: &Stmt, pred: &impl Fn(&Stmt) -> bool) -> bool {
    pred(stmt) || nested_statements(stmt).into_iter().any(|nested| any_statement(nested, pred))
}

fn nested_statements(stmt: &Stmt) -> Vec<&Stmt> {
    match stmt {
        Stmt::Block(block) | Stmt::While { body: block, .. } => block.statements.iter().collect(),
        Stmt::If {
            then_block,
            else_branch,
            ..
        } => then_block.statements.iter().chain(else_branch.as_deref()).collect(),
        _ => Vec::new(),
    }
}

/// 文が直接持つ式（入れ子の文は含まない）
fn expressions(stmt: &Stmt) -> Vec<&Expr> {
    match stmt {
        Stmt::While { condition, .. } => vec![condition],
        _ => heads(stmt),
    }
}

/// 文の実行時に一度だけ評価される式
fn heads(stmt: &Stmt) -> Vec<&Expr> {
    match stmt {
        Stmt::If { condition, .. } => vec![condition],
        Stmt::Return(Some(expr)) | Stmt::Expression(expr) => vec![expr],
        Stmt::VarDecl { init: Some(init), .. } => vec![init],
        Stmt::Assign { target, value } => vec![target, value],
        _ => Vec::new(),
    }
}

fn heads_mut(stmt: &mut Stmt) -> Vec<&mut Expr> {
    match stmt {
        Stmt::If { condition, .. } => vec![condition],
        Stmt::Return(Some(expr)) | Stmt::Expression(expr) => vec![expr],
        Stmt::VarDecl { init: Some(init), .. } => vec![init],
        Stmt::Assign { target, value } => vec![target, value],
        _ => Vec::new(),
    }
}
