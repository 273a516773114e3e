/// 構造化復元
///
/// ノード0から後支配木とループ情報に従ってCFGを辿り、if / while を含む構文木を作る。
/// 各レジスタは「現在保持している式」を1つだけ持つ。
/// 十分に単純な式はその場に埋め込み、それ以外は変数に退避する。
/// 合流点で値が経路によって変わるレジスタは宣言済み変数に束縛し、代入文で更新する。
/// 埋め込み待ちの式が参照する変数やメモリが書き換わる前には、その式を変数に退避する。

use super::ast::{BinaryOp, Block, Expr, Literal, Stmt, UnaryOp};
use super::cfg::{ControlFlowGraph, NodeId};
use super::disassembler::{FunctionDisassembly, SID_THRESHOLD};
use super::instruction::{OpClass, Opcode, ARGUMENT_REGISTER_START, REGISTER_COUNT};
use super::loops::{Loop, LoopSet};
use super::phi::PhiAnalyzer;
use super::postdom::PostDominatorTree;
use super::stack_frame::ConstantKind;
use super::types::Type;
use crate::error::AnalysisInconsistency;
use crate::sid::SidResolver;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use tracing::{debug, warn};

/// 復元時の最適化設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructOptions {
    /// リテラル同士の演算を畳み込む
    pub fold_constants: bool,
    /// `*(T*)(p + n)` を `p[n / sizeof(T)]` にする
    pub fold_pointer_arithmetic: bool,
    /// その場に埋め込める式の最大ノード数
    pub max_inline_complexity: usize,
    /// 復元後、一度しか読まれない変数を畳み込む
    pub fold_variables: bool,
}

impl Default for ReconstructOptions {
    fn default() -> Self {
        Self {
            fold_constants: true,
            fold_pointer_arithmetic: true,
            max_inline_complexity: 5,
            fold_variables: true,
        }
    }
}

/// 復元結果
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    pub body: Block,
    pub warnings: Vec<AnalysisInconsistency>,
}

#[derive(Debug, Clone)]
struct RegisterState {
    exprs: Vec<Option<Expr>>,
    types: Vec<Type>,
    /// 束縛済みの変数名
    variables: Vec<Option<String>>,
}

#[derive(Debug, Clone, Copy)]
struct LoopContext {
    head: NodeId,
    latch: NodeId,
    exit: Option<NodeId>,
}

type Step = Result<Option<NodeId>, AnalysisInconsistency>;

/// 構造化復元器（1関数ぶん）
pub struct Structurer<'a> {
    function: &'a FunctionDisassembly,
    cfg: &'a ControlFlowGraph,
    postdom: &'a PostDominatorTree,
    loops: &'a LoopSet,
    phi: PhiAnalyzer<'a>,
    resolver: &'a SidResolver,
    options: ReconstructOptions,
    state: RegisterState,
    var_count: usize,
    loop_stack: Vec<LoopContext>,
    warnings: Vec<AnalysisInconsistency>,
}

impl<'a> Structurer<'a> {
    pub fn new(
        function: &'a FunctionDisassembly,
        cfg: &'a ControlFlowGraph,
        postdom: &'a PostDominatorTree,
        loops: &'a LoopSet,
        resolver: &'a SidResolver,
        options: ReconstructOptions,
    ) -> Self {
        let mut state = RegisterState {
            exprs: vec![None; REGISTER_COUNT],
            types: vec![Type::Unknown; REGISTER_COUNT],
            variables: vec![None; REGISTER_COUNT],
        };
        for arg in 0..function.frame.argument_count {
            let reg = ARGUMENT_REGISTER_START as usize + arg;
            let ty = function.frame.argument_types[arg].clone();
            state.exprs[reg] = Some(Expr::typed_ident(format!("arg_{}", arg), ty.clone()));
            state.types[reg] = ty;
        }
        Self {
            function,
            cfg,
            postdom,
            loops,
            phi: PhiAnalyzer::new(cfg),
            resolver,
            options,
            state,
            var_count: 0,
            loop_stack: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// 構造化した本体。合流点が解決できなければ `Err`
    pub fn reconstruct(mut self) -> Result<Reconstruction, AnalysisInconsistency> {
        let mut out = Vec::new();
        if !self.cfg.is_empty() {
            self.emit_range(0, None, &mut out)?;
        }
        debug!(
            "reconstructed {}: {} statements, {} variables",
            self.function.id,
            out.len(),
            self.var_count
        );
        Ok(Reconstruction {
            body: Block::new(out),
            warnings: self.warnings,
        })
    }

    /// 分岐を無視して全ノードを順に並べる
    pub fn flatten(mut self) -> Reconstruction {
        let mut out = Vec::new();
        for id in 0..self.cfg.len() {
            self.emit_body(id, &mut out);
            let end = self.cfg.node(id).end_line;
            if self.function.lines[end].instruction.opcode == Opcode::Return {
                let stmt = self.return_stmt(end);
                out.push(stmt);
            }
        }
        Reconstruction {
            body: Block::new(out),
            warnings: self.warnings,
        }
    }

    fn fresh_var(&mut self) -> String {
        let name = format!("var_{}", self.var_count);
        self.var_count += 1;
        name
    }

    /// レジスタの現在の式。未設定なら `rN`
    fn read(&self, reg: u8) -> Expr {
        match self.state.exprs.get(reg as usize).cloned().flatten() {
            Some(expr) => expr,
            None => Expr::ident(format!("r{}", reg)),
        }
    }

    /// この行より後で、次に書き込まれるまでに読まれる回数（ちょうど書き込む行の読み込みを含む）
    fn uses_after(&self, line: usize, reg: u8) -> usize {
        self.uses_from(line + 1, reg)
    }

    fn uses_from(&self, from: usize, reg: u8) -> usize {
        let mut count = 0;
        for later in self.function.lines.iter().skip(from) {
            let istr = later.instruction;
            count += istr.read_registers().into_iter().filter(|&r| r == reg).count();
            if istr.written_register() == Some(reg) {
                break;
            }
        }
        count
    }

    /// 埋め込み待ちで、`from` 行以降も読まれる式のうち条件に合うものを変数に退避する
    fn spill_where(
        &mut self,
        from: usize,
        overwritten: Option<u8>,
        keep: Option<u8>,
        out: &mut Vec<Stmt>,
        needs_spill: impl Fn(&Expr) -> bool,
    ) {
        for index in 0..REGISTER_COUNT {
            let reg = index as u8;
            if self.state.variables[index].is_some() || Some(reg) == overwritten {
                continue;
            }
            let Some(expr) = self.state.exprs[index].clone() else {
                continue;
            };
            if !needs_spill(&expr) || (Some(reg) != keep && self.uses_from(from, reg) == 0) {
                continue;
            }
            let ty = self.state.types[index].clone();
            let name = self.fresh_var();
            debug!("{}: spilling r{} into {}", self.function.id, reg, name);
            out.push(Stmt::VarDecl {
                ty: ty.clone(),
                name: name.clone(),
                init: Some(expr),
            });
            self.state.exprs[index] = Some(Expr::typed_ident(name, ty));
        }
    }

    /// この行の命令より前に退避する。`keep` はこの行の後で読まれなくても退避する
    fn spill_before(&mut self, line: usize, keep: Option<u8>, out: &mut Vec<Stmt>, needs_spill: impl Fn(&Expr) -> bool) {
        let overwritten = self.function.lines[line].instruction.written_register();
        self.spill_where(line + 1, overwritten, keep, out, needs_spill);
    }

    /// 範囲内で代入される変数か、範囲内の書き込み・呼び出しで変わりうるメモリを読む式を退避する
    fn spill_for_region(&mut self, from: usize, nodes: RangeInclusive<NodeId>, out: &mut Vec<Stmt>) {
        let mut assigned = Vec::new();
        let mut side_effects = false;
        for id in nodes.filter(|&id| id < self.cfg.len()) {
            let node = self.cfg.node(id);
            for reg in node.written.iter() {
                if let Some(name) = &self.state.variables[reg as usize] {
                    assigned.push(name.clone());
                }
            }
            side_effects |= node.lines().any(|line| {
                matches!(
                    self.function.lines[line].instruction.class(),
                    OpClass::Store | OpClass::LegacyStore | OpClass::Call
                )
            });
        }
        if assigned.is_empty() && !side_effects {
            return;
        }
        self.spill_where(from, None, None, out, |expr| {
            assigned.iter().any(|name| expr.references(name)) || (side_effects && expr.reads_memory())
        });
    }

    fn first_written_type(&self, reg: u8, from_line: usize) -> Type {
        self.function.lines[from_line.min(self.function.lines.len())..]
            .iter()
            .find(|l| l.instruction.written_register() == Some(reg))
            .and_then(|l| l.written_type.clone())
            .unwrap_or_default()
    }

    fn emit_range(&mut self, start: NodeId, stop: Option<NodeId>, out: &mut Vec<Stmt>) -> Result<(), AnalysisInconsistency> {
        let mut visited = vec![false; self.cfg.len()];
        let mut current = Some(start);

        while let Some(node) = current {
            if Some(node) == stop {
                break;
            }
            let escapes_stop = stop.map_or(false, |s| node > s);
            let escapes_loop = self
                .loop_stack
                .last()
                .map_or(false, |ctx| node < ctx.head || node > ctx.latch);
            if escapes_stop || escapes_loop || visited[node] {
                return Err(AnalysisInconsistency::UnresolvedMerge { node });
            }
            visited[node] = true;

            if let Some(lp) = self.loops.at_head(node) {
                if !self.loop_stack.iter().any(|ctx| ctx.head == node) {
                    current = self.emit_loop(lp, out)?;
                    continue;
                }
            }

            self.emit_body(node, out);
            let end = self.cfg.node(node).end_line;
            current = match self.function.lines[end].instruction.opcode {
                Opcode::Return => {
                    let stmt = self.return_stmt(end);
                    out.push(stmt);
                    None
                }
                Opcode::Branch => {
                    let target = self.cfg.node(node).branch_target;
                    match self.loop_jump(node, target) {
                        Some(stmt) => {
                            out.extend(stmt);
                            None
                        }
                        None => target,
                    }
                }
                Opcode::BranchIf | Opcode::BranchIfNot => self.emit_conditional(node, stop, out)?,
                _ => self.cfg.node(node).fallthrough,
            };
        }
        Ok(())
    }

    /// ループのヘッド・出口への分岐。`Some(None)` はラッチからの自然な戻り
    fn loop_jump(&self, node: NodeId, target: Option<NodeId>) -> Option<Option<Stmt>> {
        let ctx = self.loop_stack.last()?;
        let target = target?;
        if target == ctx.head {
            Some((node != ctx.latch).then_some(Stmt::Continue))
        } else if Some(target) == ctx.exit {
            Some(Some(Stmt::Break))
        } else {
            None
        }
    }

    /// 分岐が成立する条件
    fn taken_condition(&self, line: usize) -> Expr {
        let line = &self.function.lines[line];
        let (reg, negated) = line
            .condition
            .unwrap_or((line.instruction.op1, line.instruction.opcode == Opcode::BranchIfNot));
        let expr = self.read(reg);
        if negated {
            expr.negate()
        } else {
            expr
        }
    }

    fn emit_conditional(&mut self, node: NodeId, stop: Option<NodeId>, out: &mut Vec<Stmt>) -> Step {
        let (end, target, fallthrough) = {
            let n = self.cfg.node(node);
            (n.end_line, n.branch_target, n.fallthrough)
        };

        // ループからの脱出
        if let Some(ctx) = self.loop_stack.last().copied() {
            let exit_when = if ctx.exit.is_some() && target == ctx.exit {
                Some((self.taken_condition(end), fallthrough))
            } else if ctx.exit.is_some() && fallthrough == ctx.exit {
                Some((self.taken_condition(end).negate(), target))
            } else {
                None
            };
            if let Some((condition, next)) = exit_when {
                out.push(Stmt::If {
                    condition: self.fold(condition),
                    then_block: Block::new(vec![Stmt::Break]),
                    else_branch: None,
                });
                return Ok(match self.loop_jump(node, next) {
                    Some(stmt) => {
                        out.extend(stmt);
                        None
                    }
                    None => next,
                });
            }
        }

        let (condition, then_start, else_start) = self.condition_chain(node);
        let merge = self.postdom.ipdom(node).filter(|&m| m != node).or(stop);
        if let (Some(m), Some(s)) = (merge, stop) {
            if m > s {
                return Err(AnalysisInconsistency::UnresolvedMerge { node });
            }
        }
        if let (Some(ctx), Some(m)) = (self.loop_stack.last(), merge) {
            if m > ctx.latch {
                return Err(AnalysisInconsistency::UnresolvedMerge { node });
            }
        }

        // 両経路がループのヘッドに戻る: 各経路は continue かラッチで終わる
        let innermost = self.loop_stack.last().copied();
        let merges_at_head = matches!((innermost, merge), (Some(ctx), Some(m)) if m == ctx.head);
        let arm_stop = if merges_at_head { None } else { merge };

        let phis = self.phi.branch_phis(node, merge);
        let search_from = end + 1;
        for reg in phis.iter() {
            self.declare_variable(reg, search_from, out);
        }
        let region_last = match (merge, innermost) {
            (Some(m), _) if m > node => m - 1,
            (_, Some(ctx)) => ctx.latch,
            (_, None) => self.cfg.len().saturating_sub(1),
        };
        self.spill_for_region(search_from, node + 1..=region_last, out);

        let saved = self.state.clone();
        let mut then_stmts = Vec::new();
        if let Some(start) = then_start.filter(|&s| Some(s) != merge) {
            self.emit_range(start, arm_stop, &mut then_stmts)?;
        }
        self.state = saved.clone();
        let mut else_stmts = Vec::new();
        if let Some(start) = else_start.filter(|&s| Some(s) != merge) {
            self.emit_range(start, arm_stop, &mut else_stmts)?;
        }
        self.state = saved;

        let condition = self.fold(condition);
        out.extend(make_if(condition, then_stmts, else_stmts));
        Ok(arm_stop)
    }

    /// 短絡評価の連鎖をまとめる。戻り値は (then側の条件, then開始, else開始)
    fn condition_chain(&mut self, node: NodeId) -> (Expr, Option<NodeId>, Option<NodeId>) {
        let first = self.cfg.node(node);
        let mut condition = self.taken_condition(first.end_line).negate();
        let mut then_start = first.fallthrough;
        let mut else_start = first.branch_target;
        let mut last = node;

        while let Some(next) = self.cfg.node(last).fallthrough {
            let candidate = self.cfg.node(next);
            let end = candidate.end_line;
            if candidate.predecessors != [last]
                || !self.function.lines[end].instruction.opcode.is_conditional_branch()
                || self.loops.at_head(next).is_some()
            {
                break;
            }
            let (x, y) = (candidate.branch_target, candidate.fallthrough);

            // 条件の計算だけで文を生まないノードに限る
            let saved = self.state.clone();
            let mut scratch = Vec::new();
            self.emit_body(next, &mut scratch);
            if !scratch.is_empty() {
                self.state = saved;
                break;
            }
            let taken = self.taken_condition(end);
            let step = if Some(next) == then_start {
                if x == else_start {
                    Some((BinaryOp::And, taken.negate(), y, else_start))
                } else if y == else_start {
                    Some((BinaryOp::And, taken, x, else_start))
                } else {
                    None
                }
            } else if Some(next) == else_start {
                if x == then_start {
                    Some((BinaryOp::Or, taken, then_start, y))
                } else if y == then_start {
                    Some((BinaryOp::Or, taken.negate(), then_start, x))
                } else {
                    None
                }
            } else {
                None
            };
            match step {
                Some((op, rhs, then_next, else_next)) => {
                    condition = Expr::binary(op, condition, rhs);
                    then_start = then_next;
                    else_start = else_next;
                    last = next;
                }
                None => {
                    self.state = saved;
                    break;
                }
            }
        }
        (condition, then_start, else_start)
    }

    /// レジスタを変数に束縛して宣言する
    fn declare_variable(&mut self, reg: u8, search_from: usize, out: &mut Vec<Stmt>) {
        let index = reg as usize;
        if self.state.variables[index].is_some() {
            return;
        }
        let name = self.fresh_var();
        let (ty, init) = match self.state.exprs[index].take() {
            Some(expr) => (self.state.types[index].clone(), Some(expr)),
            None => (self.first_written_type(reg, search_from), None),
        };
        out.push(Stmt::VarDecl {
            ty: ty.clone(),
            name: name.clone(),
            init,
        });
        self.state.types[index] = ty.clone();
        self.state.exprs[index] = Some(Expr::typed_ident(name.clone(), ty));
        self.state.variables[index] = Some(name);
    }

    fn emit_loop(&mut self, lp: &Loop, out: &mut Vec<Stmt>) -> Step {
        let exit = lp.exit(self.cfg);
        let head_start = self.cfg.node(lp.head).start_line;
        for reg in self.phi.loop_phis(lp).iter() {
            self.declare_variable(reg, head_start, out);
        }
        self.spill_for_region(head_start, lp.range(), out);

        let saved = self.state.clone();
        self.loop_stack.push(LoopContext {
            head: lp.head,
            latch: lp.latch,
            exit,
        });
        let result = self.emit_loop_body(lp, exit);
        self.loop_stack.pop();
        self.state = saved;

        let (condition, body) = result?;
        out.push(Stmt::While {
            condition,
            body: Block::new(body),
        });
        Ok(exit)
    }

    fn emit_loop_body(&mut self, lp: &Loop, exit: Option<NodeId>) -> Result<(Expr, Vec<Stmt>), AnalysisInconsistency> {
        let (end, target, fallthrough) = {
            let head = self.cfg.node(lp.head);
            (head.end_line, head.branch_target, head.fallthrough)
        };
        let mut body = Vec::new();

        let conditional = self.function.lines[end].instruction.opcode.is_conditional_branch();
        let inside = match (exit.is_some(), conditional && lp.head != lp.latch) {
            (true, true) if target == exit => fallthrough,
            (true, true) if fallthrough == exit => target,
            _ => None,
        };

        if let Some(inside) = inside {
            let saved = self.state.clone();
            let mut scratch = Vec::new();
            self.emit_body(lp.head, &mut scratch);
            if scratch.is_empty() {
                let taken = self.taken_condition(end);
                let stay = if target == exit { taken.negate() } else { taken };
                let condition = self.fold(stay);
                self.emit_range(inside, None, &mut body)?;
                return Ok((condition, body));
            }
            self.state = saved;
            warn!("{}: loop head {} has side effects, emitting while (true)", self.function.id, lp.head);
            self.warnings.push(AnalysisInconsistency::ImpureLoopCondition { head: lp.head });
        }

        self.emit_range(lp.head, None, &mut body)?;
        Ok((Expr::Literal(Literal::Bool(true)), body))
    }

    /// 分岐・Return以外の命令を式と文に変換
    fn emit_body(&mut self, node: NodeId, out: &mut Vec<Stmt>) {
        let lines = self.cfg.node(node).lines();
        for line in lines {
            let istr = self.function.lines[line].instruction;
            if istr.opcode.is_branch() || istr.opcode == Opcode::Return {
                continue;
            }
            self.translate(line, out);
        }
    }

    fn translate(&mut self, line: usize, out: &mut Vec<Stmt>) {
        let istr = self.function.lines[line].instruction;
        match istr.class() {
            OpClass::Binary => {
                let expr = match binary_op(istr.opcode) {
                    Some(op) => make_binary(op, self.read(istr.op1), self.read(istr.op2)),
                    None => Expr::Unrepresentable(istr.opcode.mnemonic().to_string()),
                };
                self.assign(line, istr.dest, expr, out);
            }
            OpClass::Immediate => {
                let op = binary_op(istr.opcode).unwrap_or(BinaryOp::Add);
                let expr = make_binary(op, self.read(istr.op1), Expr::int(istr.op2 as i64));
                self.assign(line, istr.dest, expr, out);
            }
            OpClass::Unary => {
                let src = self.read(istr.op1);
                let expr = match istr.opcode {
                    Opcode::MoveInt | Opcode::MoveFloat | Opcode::MovePointer | Opcode::Move => src,
                    Opcode::CastInteger => Expr::Cast {
                        ty: Type::I32,
                        expr: Box::new(src),
                    },
                    Opcode::CastFloat => Expr::Cast {
                        ty: Type::F32,
                        expr: Box::new(src),
                    },
                    Opcode::IAbs | Opcode::FAbs => Expr::unary(UnaryOp::Abs, src),
                    Opcode::INeg | Opcode::FNeg => Expr::unary(UnaryOp::Neg, src),
                    Opcode::OpLogNot => Expr::unary(UnaryOp::Not, src),
                    _ => Expr::unary(UnaryOp::BitNot, src),
                };
                self.assign(line, istr.dest, expr, out);
            }
            OpClass::MemoryLoad => {
                let ty = self.function.lines[line].written_type.clone().unwrap_or_default();
                let pointer = self.fold(self.read(istr.op1));
                let expr = self.dereference(ty, pointer);
                self.assign(line, istr.dest, expr, out);
            }
            OpClass::SymbolLoad => {
                let expr = self.symbol_literal(istr.opcode, istr.op1);
                self.assign(line, istr.dest, expr, out);
            }
            OpClass::LoadImmediate => {
                let expr = match istr.opcode {
                    Opcode::LoadU16Imm => Expr::int(istr.u16_immediate() as i64),
                    _ => Expr::ident("param_count"),
                };
                self.assign(line, istr.dest, expr, out);
            }
            OpClass::Store => {
                // 書き込み後にも使われるコピーは書き込み前の値を保つ
                let copied_later = istr.dest != istr.op2 && self.uses_after(line, istr.dest) > 0;
                self.spill_before(line, copied_later.then_some(istr.op2), out, Expr::reads_memory);
                let width = store_width(istr.opcode);
                let pointer = self.fold(self.read(istr.op1));
                let target = self.dereference(width, pointer);
                let value = self.fold(self.read(istr.op2));
                out.push(Stmt::Assign { target, value });
                if istr.dest != istr.op2 {
                    let copied = self.read(istr.op2);
                    self.assign(line, istr.dest, copied, out);
                }
            }
            OpClass::LegacyStore => {
                let width = match istr.opcode {
                    Opcode::StoreFloat => Type::F32,
                    Opcode::StorePointer => Type::pointer_to(Type::Unknown),
                    _ => Type::I64,
                };
                self.spill_before(line, None, out, Expr::reads_memory);
                let pointer = self.fold(self.read(istr.dest));
                let target = self.dereference(width, pointer);
                let value = self.fold(self.read(istr.op1));
                out.push(Stmt::Assign { target, value });
            }
            OpClass::Call => self.call(line, out),
            OpClass::ReadDest
            | OpClass::ConditionalBranch
            | OpClass::Branch
            | OpClass::NoOperands => {}
        }
    }

    /// レジスタへの書き込み
    fn assign(&mut self, line: usize, reg: u8, expr: Expr, out: &mut Vec<Stmt>) {
        let index = reg as usize;
        let expr = self.fold(expr);
        if let Some(name) = self.state.variables[index].clone() {
            // 変数の型は宣言時のまま
            let ty = self.state.types[index].clone();
            self.spill_before(line, None, out, |e| e.references(&name));
            out.push(Stmt::Assign {
                target: Expr::typed_ident(name.clone(), ty.clone()),
                value: expr,
            });
            self.state.exprs[index] = Some(Expr::typed_ident(name, ty));
            return;
        }
        let ty = self.function.lines[line].written_type.clone().unwrap_or_default();
        self.state.types[index] = ty.clone();

        let uses = self.uses_after(line, reg);
        if uses == 0 || expr.complexity() <= self.options.max_inline_complexity {
            self.state.exprs[index] = Some(expr);
        } else {
            let name = self.fresh_var();
            out.push(Stmt::VarDecl {
                ty: ty.clone(),
                name: name.clone(),
                init: Some(expr),
            });
            self.state.exprs[index] = Some(Expr::typed_ident(name, ty));
        }
    }

    /// 呼び出し。後で読まれる戻り値は必ず変数に受ける
    ///
    /// 呼び出しはメモリを書き換えうるので、メモリを読む式は呼び出しの前に退避する。
    fn call(&mut self, line: usize, out: &mut Vec<Stmt>) {
        let istr = self.function.lines[line].instruction;
        let index = istr.dest as usize;
        let bound = self.state.variables[index].clone();
        self.spill_before(line, None, out, |e| {
            e.reads_memory() || bound.as_deref().is_some_and(|name| e.references(name))
        });
        let callee = self.read(istr.op1);
        let args: Vec<Expr> = istr.call_arguments().map(|r| self.fold(self.read(r))).collect();
        let call = Expr::call(callee, args);

        if let Some(name) = bound {
            let ty = self.state.types[index].clone();
            out.push(Stmt::Assign {
                target: Expr::typed_ident(name.clone(), ty.clone()),
                value: call,
            });
            self.state.exprs[index] = Some(Expr::typed_ident(name, ty));
            return;
        }
        let ty = self.function.lines[line].written_type.clone().unwrap_or_default();
        self.state.types[index] = ty.clone();

        if self.uses_after(line, istr.dest) > 0 {
            let name = self.fresh_var();
            out.push(Stmt::VarDecl {
                ty: ty.clone(),
                name: name.clone(),
                init: Some(call),
            });
            self.state.exprs[index] = Some(Expr::typed_ident(name, ty));
        } else {
            out.push(Stmt::Expression(call));
            self.state.exprs[index] = None;
        }
    }

    fn return_stmt(&self, line: usize) -> Stmt {
        if self.function.frame.return_type == Type::Void {
            return Stmt::Return(None);
        }
        let reg = self.function.lines[line].instruction.dest;
        Stmt::Return(Some(self.fold(self.read(reg))))
    }

    fn symbol_literal(&self, opcode: Opcode, slot: u8) -> Expr {
        let Some(constant) = self.function.pool.get(slot as usize) else {
            return Expr::Unrepresentable(format!("ST[{}]", slot));
        };
        let raw = constant.raw;
        let literal = match opcode {
            Opcode::LoadStaticInt | Opcode::LoadStaticI64Imm => Literal::Int(raw as i64),
            Opcode::LoadStaticI32Imm => Literal::Int(raw as i32 as i64),
            Opcode::LoadStaticU32Imm => Literal::Int(raw as u32 as i64),
            Opcode::LoadStaticI16Imm => Literal::Int(raw as i16 as i64),
            Opcode::LoadStaticU16Imm => Literal::Int(raw as u16 as i64),
            Opcode::LoadStaticI8Imm => Literal::Int(raw as i8 as i64),
            Opcode::LoadStaticU8Imm => Literal::Int(raw as u8 as i64),
            Opcode::LoadStaticFloat | Opcode::LoadStaticFloatImm => Literal::Float(constant.as_f32()),
            Opcode::LoadStaticU64Imm if raw < SID_THRESHOLD => Literal::UInt(raw),
            Opcode::LoadStaticU64Imm | Opcode::LookupInt | Opcode::LookupFloat => {
                Literal::Sid(self.resolver.resolve(raw).to_string())
            }
            _ => match &constant.kind {
                ConstantKind::String(s) => Literal::String(s.clone()),
                ConstantKind::Pointer { target } => return Expr::ident(format!("0x{:06X}", target)),
                ConstantKind::Value => Literal::Sid(self.resolver.resolve(raw).to_string()),
            },
        };
        Expr::Literal(literal)
    }

    fn dereference(&self, ty: Type, pointer: Expr) -> Expr {
        let size = ty.size().unwrap_or(1).max(1) as i64;
        if !self.options.fold_pointer_arithmetic {
            return Expr::Dereference {
                ty,
                pointer: Box::new(pointer),
            };
        }
        match pointer {
            Expr::Binary {
                op: BinaryOp::Add,
                lhs,
                rhs,
            } => match *rhs {
                Expr::Literal(Literal::Int(offset)) if offset % size == 0 => Expr::Subscript {
                    base: lhs,
                    index: Box::new(Expr::int(offset / size)),
                },
                rhs => Expr::Dereference {
                    ty,
                    pointer: Box::new(Expr::binary(BinaryOp::Add, *lhs, rhs)),
                },
            },
            pointer => Expr::Dereference {
                ty,
                pointer: Box::new(pointer),
            },
        }
    }

    fn fold(&self, expr: Expr) -> Expr {
        if self.options.fold_constants {
            fold_constants(expr)
        } else {
            expr
        }
    }
}

fn binary_op(opcode: Opcode) -> Option<BinaryOp> {
    Some(match opcode {
        Opcode::IAdd | Opcode::FAdd | Opcode::IAddImm => BinaryOp::Add,
        Opcode::ISub | Opcode::FSub | Opcode::ISubImm => BinaryOp::Sub,
        Opcode::IMul | Opcode::FMul | Opcode::IMulImm => BinaryOp::Mul,
        Opcode::IDiv | Opcode::FDiv | Opcode::IDivImm => BinaryOp::Div,
        Opcode::IMod | Opcode::FMod => BinaryOp::Mod,
        Opcode::IEqual | Opcode::FEqual => BinaryOp::Eq,
        Opcode::INotEqual | Opcode::FNotEqual => BinaryOp::Ne,
        Opcode::IGreaterThan | Opcode::FGreaterThan => BinaryOp::Gt,
        Opcode::IGreaterThanEqual | Opcode::FGreaterThanEqual => BinaryOp::Ge,
        Opcode::ILessThan | Opcode::FLessThan => BinaryOp::Lt,
        Opcode::ILessThanEqual | Opcode::FLessThanEqual => BinaryOp::Le,
        Opcode::OpBitAnd => BinaryOp::BitAnd,
        Opcode::OpBitOr => BinaryOp::BitOr,
        Opcode::OpBitXor => BinaryOp::BitXor,
        Opcode::OpBitNor => BinaryOp::BitNor,
        Opcode::OpLogAnd => BinaryOp::And,
        Opcode::OpLogOr => BinaryOp::Or,
        Opcode::IntAsh => BinaryOp::Shl,
        _ => return None,
    })
}

fn store_width(opcode: Opcode) -> Type {
    match opcode {
        Opcode::StoreI8 => Type::I8,
        Opcode::StoreU8 => Type::U8,
        Opcode::StoreI16 => Type::I16,
        Opcode::StoreU16 => Type::U16,
        Opcode::StoreI32 => Type::I32,
        Opcode::StoreU32 => Type::U32,
        Opcode::StoreI64 => Type::I64,
        _ => Type::U64,
    }
}

/// `==` / `!=` の左辺がリテラルなら右に回す
fn make_binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    if matches!(op, BinaryOp::Eq | BinaryOp::Ne) && lhs.is_literal() && !rhs.is_literal() {
        Expr::binary(op, rhs, lhs)
    } else {
        Expr::binary(op, lhs, rhs)
    }
}

/// then側が空なら条件を反転して入れ替え、else内の単独ifはelse ifにする
fn make_if(condition: Expr, then_stmts: Vec<Stmt>, else_stmts: Vec<Stmt>) -> Option<Stmt> {
    if then_stmts.is_empty() && else_stmts.is_empty() {
        return (!condition.is_pure()).then_some(Stmt::Expression(condition));
    }
    let (condition, then_stmts, mut else_stmts) = if then_stmts.is_empty() {
        (condition.negate(), else_stmts, then_stmts)
    } else {
        (condition, then_stmts, else_stmts)
    };
    let else_branch = match else_stmts.len() {
        0 => None,
        1 if matches!(else_stmts[0], Stmt::If { .. }) => else_stmts.pop().map(Box::new),
        _ => Some(Box::new(Stmt::Block(Block::new(else_stmts)))),
    };
    Some(Stmt::If {
        condition,
        then_block: Block::new(then_stmts),
        else_branch,
    })
}

/// リテラル同士の演算とキャストを畳み込む
pub fn fold_constants(expr: Expr) -> Expr {
    match expr {
        Expr::Binary { op, lhs, rhs } => {
            let lhs = fold_constants(*lhs);
            let rhs = fold_constants(*rhs);
            if let (Expr::Literal(a), Expr::Literal(b)) = (&lhs, &rhs) {
                if let Some(value) = eval_binary(op, a, b) {
                    return Expr::Literal(value);
                }
            }
            Expr::binary(op, lhs, rhs)
        }
        Expr::Unary { op, operand } => {
            let operand = fold_constants(*operand);
            let folded = match (&operand, op) {
                (Expr::Literal(Literal::Int(v)), UnaryOp::Neg) => Some(Literal::Int(v.wrapping_neg())),
                (Expr::Literal(Literal::Int(v)), UnaryOp::BitNot) => Some(Literal::Int(!v)),
                (Expr::Literal(Literal::Int(v)), UnaryOp::Abs) => Some(Literal::Int(v.wrapping_abs())),
                (Expr::Literal(Literal::Int(v)), UnaryOp::Not) => Some(Literal::Bool(*v == 0)),
                (Expr::Literal(Literal::Float(v)), UnaryOp::Neg) => Some(Literal::Float(-v)),
                (Expr::Literal(Literal::Float(v)), UnaryOp::Abs) => Some(Literal::Float(v.abs())),
                (Expr::Literal(Literal::Bool(v)), UnaryOp::Not) => Some(Literal::Bool(!v)),
                _ => None,
            };
            match folded {
                Some(literal) => Expr::Literal(literal),
                None => Expr::unary(op, operand),
            }
        }
        Expr::Cast { ty, expr } => {
            let expr = fold_constants(*expr);
            match (&expr, &ty) {
                (Expr::Literal(Literal::Float(v)), t) if t.is_integer() => Expr::int(*v as i64),
                (Expr::Literal(Literal::Int(v)), t) if t.is_float() => Expr::Literal(Literal::Float(*v as f32)),
                (Expr::Literal(Literal::Int(_)), t) if t.is_integer() => expr,
                _ => Expr::Cast {
                    ty,
                    expr: Box::new(expr),
                },
            }
        }
        Expr::Call { callee, args } => Expr::Call {
            callee,
            args: args.into_iter().map(fold_constants).collect(),
        },
        Expr::Dereference { ty, pointer } => Expr::Dereference {
            ty,
            pointer: Box::new(fold_constants(*pointer)),
        },
        other => other,
    }
}

fn eval_binary(op: BinaryOp, a: &Literal, b: &Literal) -> Option<Literal> {
    use BinaryOp::*;
    match (a, b) {
        (Literal::Int(x), Literal::Int(y)) => {
            let (x, y) = (*x, *y);
            Some(match op {
                Add => Literal::Int(x.wrapping_add(y)),
                Sub => Literal::Int(x.wrapping_sub(y)),
                Mul => Literal::Int(x.wrapping_mul(y)),
                Div if y != 0 => Literal::Int(x.wrapping_div(y)),
                Mod if y != 0 => Literal::Int(x.wrapping_rem(y)),
                Eq => Literal::Bool(x == y),
                Ne => Literal::Bool(x != y),
                Gt => Literal::Bool(x > y),
                Ge => Literal::Bool(x >= y),
                Lt => Literal::Bool(x < y),
                Le => Literal::Bool(x <= y),
                BitAnd => Literal::Int(x & y),
                BitOr => Literal::Int(x | y),
                BitXor => Literal::Int(x ^ y),
                BitNor => Literal::Int(!(x | y)),
                Shl if (0..64).contains(&y) => Literal::Int(x.wrapping_shl(y as u32)),
                _ => return None,
            })
        }
        (Literal::Float(x), Literal::Float(y)) => {
            let (x, y) = (*x, *y);
            Some(match op {
                Add => Literal::Float(x + y),
                Sub => Literal::Float(x - y),
                Mul => Literal::Float(x * y),
                Div if y != 0.0 => Literal::Float(x / y),
                Eq => Literal::Bool(x == y),
                Ne => Literal::Bool(x != y),
                Gt => Literal::Bool(x > y),
                Ge => Literal::Bool(x >= y),
                Lt => Literal::Bool(x < y),
                Le => Literal::Bool(x <= y),
                _ => return None,
            })
        }
        (Literal::Bool(x), Literal::Bool(y)) => match op {
            And => Some(Literal::Bool(*x && *y)),
            Or => Some(Literal::Bool(*x || *y)),
            Eq => Some(Literal::Bool(x == y)),
            Ne => Some(Literal::Bool(x != y)),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::cfg::tests::{continue_loop, countdown_loop, if_without_else, ins};
    use crate::decompiler::disassembler::Disassembler;
    use crate::decompiler::instruction::{Instruction, Opcode::*};
    use crate::decompiler::printer::{PseudocodePrinter, RenderOptions};
    use crate::decompiler::stack_frame::ConstantPool;
    use crate::sid::{sid64, SidTable};

    fn run(instructions: &[Instruction], pool: ConstantPool, options: ReconstructOptions) -> anyhow::Result<Reconstruction> {
        let table: SidTable = ["ddict-key-count"].into_iter().collect();
        let resolver = SidResolver::with_backend(Box::new(table));
        let function = Disassembler::new(&resolver).disassemble("test", instructions, pool, 0)?;
        let mut cfg = ControlFlowGraph::build(&function);
        let postdom = PostDominatorTree::compute(&cfg)?;
        postdom.apply(&mut cfg);
        let loops = LoopSet::detect(&cfg, &function.frame.backward_jumps);
        let result = Structurer::new(&function, &cfg, &postdom, &loops, &resolver, options).reconstruct()?;
        Ok(result)
    }

    fn run_default(instructions: &[Instruction]) -> anyhow::Result<Reconstruction> {
        run(instructions, ConstantPool::default(), ReconstructOptions::default())
    }

    /// C疑似コードの行
    fn c_lines(result: &Reconstruction) -> Vec<String> {
        PseudocodePrinter::new(RenderOptions::default())
            .render_block(&result.body)
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn var(name: &str, ty: Type) -> Expr {
        Expr::typed_ident(name, ty)
    }

    #[test]
    fn test_move_chain_returns_source() -> anyhow::Result<()> {
        let result = run(
            &[ins(Move, 0, 1, 0), ins(Move, 1, 0, 0), ins(Return, 0, 0, 0)],
            ConstantPool::default(),
            ReconstructOptions::default(),
        )?;
        assert_eq!(result.body.statements, vec![Stmt::Return(Some(Expr::ident("r1")))]);
        Ok(())
    }

    #[test]
    fn test_literal_moves_right_of_equality() -> anyhow::Result<()> {
        let result = run(
            &[
                ins(LoadU16Imm, 1, 5, 0),
                ins(IEqual, 2, 1, 49),
                ins(Return, 2, 0, 0),
            ],
            ConstantPool::default(),
            ReconstructOptions::default(),
        )?;
        let expected = Expr::binary(BinaryOp::Eq, var("arg_0", Type::U16), Expr::int(5));
        assert_eq!(result.body.statements, vec![Stmt::Return(Some(expected))]);
        Ok(())
    }

    #[test]
    fn test_duplicated_cheap_expression_is_inlined() -> anyhow::Result<()> {
        let program = [
            ins(LoadU16Imm, 0, 1, 0),
            ins(LoadU16Imm, 1, 5, 5),
            ins(IAdd, 2, 0, 1),
            ins(IAdd, 2, 2, 2),
            ins(Return, 2, 0, 0),
        ];
        let unfolded = run(
            &program,
            ConstantPool::default(),
            ReconstructOptions {
                fold_constants: false,
                ..ReconstructOptions::default()
            },
        )?;
        let sum = Expr::binary(BinaryOp::Add, Expr::int(1), Expr::int(1285));
        assert_eq!(
            unfolded.body.statements,
            vec![Stmt::Return(Some(Expr::binary(BinaryOp::Add, sum.clone(), sum)))]
        );

        let folded = run(&program, ConstantPool::default(), ReconstructOptions::default())?;
        assert_eq!(folded.body.statements, vec![Stmt::Return(Some(Expr::int(2572)))]);
        Ok(())
    }

    #[test]
    fn test_call_result_is_spilled() -> anyhow::Result<()> {
        let result = run(
            &[
                ins(LookupPointer, 0, 0, 0),
                ins(LoadU16Imm, 49, 5, 0),
                ins(Call, 0, 0, 1),
                ins(Return, 0, 0, 0),
            ],
            ConstantPool::from_values(&[sid64("ddict-key-count")]),
            ReconstructOptions::default(),
        )?;
        let call = Expr::call(
            Expr::Literal(Literal::Sid("ddict-key-count".to_string())),
            vec![Expr::int(5)],
        );
        assert_eq!(
            result.body.statements,
            vec![
                Stmt::VarDecl {
                    ty: Type::Unknown,
                    name: "var_0".to_string(),
                    init: Some(call),
                },
                Stmt::Return(Some(var("var_0", Type::Unknown))),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_if_without_else() -> anyhow::Result<()> {
        let result = run(
            &if_without_else(),
            ConstantPool::from_values(&[sid64("ddict-key-count")]),
            ReconstructOptions::default(),
        )?;
        let statements = &result.body.statements;
        assert_eq!(statements.len(), 2);
        match &statements[0] {
            Stmt::If {
                then_block,
                else_branch,
                ..
            } => {
                assert!(else_branch.is_none());
                assert!(matches!(then_block.statements[..], [Stmt::Expression(Expr::Call { .. })]));
            }
            other => panic!("expected if, got {:?}", other),
        }
        assert!(matches!(statements[1], Stmt::Return(_)));
        Ok(())
    }

    #[test]
    fn test_countdown_becomes_while() -> anyhow::Result<()> {
        let result = run(&countdown_loop(), ConstantPool::default(), ReconstructOptions::default())?;
        let counter = var("var_0", Type::U16);
        assert_eq!(
            result.body.statements,
            vec![
                Stmt::VarDecl {
                    ty: Type::U16,
                    name: "var_0".to_string(),
                    init: Some(Expr::int(3)),
                },
                Stmt::While {
                    condition: Expr::binary(BinaryOp::Gt, counter.clone(), Expr::int(0)),
                    body: Block::new(vec![Stmt::Assign {
                        target: counter.clone(),
                        value: Expr::binary(BinaryOp::Sub, counter.clone(), Expr::int(1)),
                    }]),
                },
                Stmt::Return(Some(counter)),
            ]
        );
        assert!(result.warnings.is_empty());
        Ok(())
    }

    #[test]
    fn test_if_else_assigns_phi_variable() -> anyhow::Result<()> {
        // r0 = r3 == 0 ? 1 : 2
        let result = run(
            &[
                ins(LoadU16Imm, 1, 0, 0),
                ins(IEqual, 2, 3, 1),
                ins(BranchIfNot, 5, 2, 0),
                ins(LoadU16Imm, 0, 1, 0),
                ins(Branch, 6, 0, 0),
                ins(LoadU16Imm, 0, 2, 0),
                ins(Return, 0, 0, 0),
            ],
            ConstantPool::default(),
            ReconstructOptions::default(),
        )?;
        let v = var("var_0", Type::U16);
        let assign = |value| Stmt::Assign {
            target: v.clone(),
            value: Expr::int(value),
        };
        assert_eq!(
            result.body.statements,
            vec![
                Stmt::VarDecl {
                    ty: Type::U16,
                    name: "var_0".to_string(),
                    init: None,
                },
                Stmt::If {
                    condition: Expr::binary(BinaryOp::Eq, Expr::ident("r3"), Expr::int(0)),
                    then_block: Block::new(vec![assign(1)]),
                    else_branch: Some(Box::new(Stmt::Block(Block::new(vec![assign(2)])))),
                },
                Stmt::Return(Some(v.clone())),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_short_circuit_or() -> anyhow::Result<()> {
        // if (r0 || r1) { foo(); }
        let result = run(
            &[
                ins(BranchIf, 2, 0, 0),
                ins(BranchIfNot, 4, 1, 0),
                ins(LookupPointer, 3, 0, 0),
                ins(Call, 3, 3, 0),
                ins(Return, 0, 0, 0),
            ],
            ConstantPool::from_values(&[sid64("ddict-key-count")]),
            ReconstructOptions::default(),
        )?;
        match &result.body.statements[0] {
            Stmt::If {
                condition,
                else_branch: None,
                ..
            } => assert_eq!(
                condition,
                &Expr::binary(BinaryOp::Or, Expr::ident("r0"), Expr::ident("r1"))
            ),
            other => panic!("expected if, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_fold_constants() {
        let expr = Expr::Cast {
            ty: Type::I32,
            expr: Box::new(Expr::Literal(Literal::Float(3.75))),
        };
        assert_eq!(fold_constants(expr), Expr::int(3));
        let cmp = Expr::binary(BinaryOp::Lt, Expr::int(1), Expr::int(2));
        assert_eq!(fold_constants(cmp), Expr::Literal(Literal::Bool(true)));
        let div = Expr::binary(BinaryOp::Div, Expr::int(1), Expr::int(0));
        assert_eq!(fold_constants(div.clone()), div);
    }

    #[test]
    fn test_pointer_offset_becomes_subscript() -> anyhow::Result<()> {
        let result = run(
            &[ins(IAddImm, 0, 49, 8), ins(LoadI32, 1, 0, 0), ins(Return, 1, 0, 0)],
            ConstantPool::default(),
            ReconstructOptions::default(),
        )?;
        match &result.body.statements[..] {
            [Stmt::Return(Some(Expr::Subscript { index, .. }))] => assert_eq!(**index, Expr::int(2)),
            other => panic!("unexpected {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_copy_keeps_value_from_before_reassignment() -> anyhow::Result<()> {
        // r3 = r0; r0 -= 1; *arg_0 = r3
        let result = run_default(&[
            ins(LoadU16Imm, 0, 3, 0),
            ins(LoadU16Imm, 1, 0, 0),
            ins(IGreaterThan, 2, 0, 1),
            ins(BranchIfNot, 8, 2, 0),
            ins(Move, 3, 0, 0),
            ins(ISubImm, 0, 0, 1),
            ins(StoreI32, 4, 49, 3),
            ins(Branch, 1, 0, 0),
            ins(Return, 0, 0, 0),
        ])?;
        let lines = c_lines(&result);
        assert_eq!(lines.len(), 7, "{:#?}", lines);
        assert_eq!(lines[0], "u16 var_0 = 3;");
        assert_eq!(lines[1], "while (var_0 > 0) {");
        assert!(lines[2].ends_with(" var_1 = var_0;"), "{:#?}", lines);
        assert_eq!(lines[3], "    var_0 = var_0 - 1;");
        assert_eq!(lines[4], "    *(i32*)arg_0 = var_1;");
        assert_eq!(lines[6], "return var_0;");
        Ok(())
    }

    #[test]
    fn test_load_is_read_before_store() -> anyhow::Result<()> {
        let result = run_default(&[
            ins(LoadI32, 1, 49, 0),
            ins(LoadU16Imm, 2, 5, 0),
            ins(StoreI32, 3, 49, 2),
            ins(Return, 1, 0, 0),
        ])?;
        let lines = c_lines(&result);
        assert_eq!(lines.len(), 3, "{:#?}", lines);
        assert!(lines[0].ends_with(" var_0 = *(i32*)arg_0;"), "{:#?}", lines);
        assert_eq!(lines[1], "*(i32*)arg_0 = 5;");
        assert_eq!(lines[2], "return var_0;");
        Ok(())
    }

    #[test]
    fn test_load_is_read_before_call() -> anyhow::Result<()> {
        // 呼び出し後に読まれるロードは呼び出し前に受ける
        let result = run(
            &[
                ins(LoadI32, 1, 49, 0),
                ins(LookupPointer, 0, 0, 0),
                ins(Call, 0, 0, 0),
                ins(Return, 1, 0, 0),
            ],
            ConstantPool::from_values(&[sid64("ddict-key-count")]),
            ReconstructOptions::default(),
        )?;
        let lines = c_lines(&result);
        assert_eq!(lines.len(), 3, "{:#?}", lines);
        assert!(lines[0].ends_with(" var_0 = *(i32*)arg_0;"), "{:#?}", lines);
        assert_eq!(lines[1], "ddict-key-count();");
        assert_eq!(lines[2], "return var_0;");
        Ok(())
    }

    #[test]
    fn test_complex_expression_is_spilled_even_when_read_once() -> anyhow::Result<()> {
        let result = run_default(&[
            ins(IAdd, 0, 49, 50),
            ins(IAdd, 0, 0, 51),
            ins(IAdd, 0, 0, 52),
            ins(IAdd, 0, 0, 53),
            ins(IAdd, 0, 0, 54),
            ins(Return, 0, 0, 0),
        ])?;
        let lines = c_lines(&result);
        assert_eq!(lines.len(), 2, "{:#?}", lines);
        assert!(
            lines[0].ends_with(" var_0 = ((arg_0 + arg_1) + arg_2) + arg_3;"),
            "{:#?}",
            lines
        );
        assert_eq!(lines[1], "return (var_0 + arg_4) + arg_5;");
        Ok(())
    }

    #[test]
    fn test_else_if_chain_is_collapsed() -> anyhow::Result<()> {
        let result = run_default(&[
            ins(LoadU16Imm, 1, 1, 0),
            ins(IEqual, 2, 49, 1),
            ins(BranchIfNot, 5, 2, 0),
            ins(LoadU16Imm, 0, 10, 0),
            ins(Branch, 11, 0, 0),
            ins(LoadU16Imm, 1, 2, 0),
            ins(IEqual, 2, 49, 1),
            ins(BranchIfNot, 10, 2, 0),
            ins(LoadU16Imm, 0, 20, 0),
            ins(Branch, 11, 0, 0),
            ins(LoadU16Imm, 0, 30, 0),
            ins(Return, 0, 0, 0),
        ])?;
        assert_eq!(
            c_lines(&result),
            vec![
                "u16 var_0;",
                "if (arg_0 == 1) {",
                "    var_0 = 10;",
                "} else if (arg_0 == 2) {",
                "    var_0 = 20;",
                "} else {",
                "    var_0 = 30;",
                "}",
                "return var_0;",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_nested_loops() -> anyhow::Result<()> {
        let result = run_default(&[
            ins(LoadU16Imm, 0, 2, 0),
            ins(LoadU16Imm, 1, 0, 0),
            ins(IGreaterThan, 2, 0, 1),
            ins(BranchIfNot, 12, 2, 0),
            ins(LoadU16Imm, 3, 2, 0),
            ins(LoadU16Imm, 1, 0, 0),
            ins(IGreaterThan, 2, 3, 1),
            ins(BranchIfNot, 10, 2, 0),
            ins(ISubImm, 3, 3, 1),
            ins(Branch, 5, 0, 0),
            ins(ISubImm, 0, 0, 1),
            ins(Branch, 1, 0, 0),
            ins(Return, 0, 0, 0),
        ])?;
        assert_eq!(
            c_lines(&result),
            vec![
                "u16 var_0 = 2;",
                "while (var_0 > 0) {",
                "    u16 var_1 = 2;",
                "    while (var_1 > 0) {",
                "        var_1 = var_1 - 1;",
                "    }",
                "    var_0 = var_0 - 1;",
                "}",
                "return var_0;",
            ]
        );
        assert!(result.warnings.is_empty());
        Ok(())
    }

    #[test]
    fn test_register_read_only_after_loop_is_hoisted() -> anyhow::Result<()> {
        // r1 はヘッドで毎回書き込まれ、ループの後でだけ読まれる
        let result = run_default(&[
            ins(LoadU16Imm, 0, 3, 0),
            ins(LoadU16Imm, 1, 0, 0),
            ins(IGreaterThan, 2, 0, 1),
            ins(BranchIfNot, 6, 2, 0),
            ins(ISubImm, 0, 0, 1),
            ins(Branch, 1, 0, 0),
            ins(Return, 1, 0, 0),
        ])?;
        let lines = c_lines(&result);
        assert_eq!(lines[0], "u16 var_0 = 3;");
        assert_eq!(lines[1], "u16 var_1;");
        assert!(lines[2].starts_with("while ("), "{:#?}", lines);
        assert!(lines.contains(&"    var_1 = 0;".to_string()), "{:#?}", lines);
        assert_eq!(lines.last().map(String::as_str), Some("return var_1;"));
        assert_eq!(result.warnings, vec![AnalysisInconsistency::ImpureLoopCondition { head: 1 }]);
        Ok(())
    }

    #[test]
    fn test_second_backward_jump_becomes_continue() -> anyhow::Result<()> {
        let result = run_default(&continue_loop())?;
        assert_eq!(
            c_lines(&result),
            vec![
                "u16 var_0 = 3;",
                "while (var_0 > 0) {",
                "    var_0 = var_0 - 1;",
                "    if (var_0) {",
                "        continue;",
                "    } else {",
                "        var_0 = var_0 - 1;",
                "    }",
                "}",
                "return var_0;",
            ]
        );
        assert!(result.warnings.is_empty());
        Ok(())
    }
}
