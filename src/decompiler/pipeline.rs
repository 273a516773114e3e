/// 1関数ぶんの処理
///
/// 逆アセンブル → CFG → 後支配木 → ループ → 構造化復元 → 変数の畳み込み。
/// 構造化に失敗した関数は警告を残して平坦な本体にする。

use super::ast::Block;
use super::cfg::ControlFlowGraph;
use super::disassembler::{Disassembler, FunctionDisassembly};
use super::instruction::Instruction;
use super::loops::LoopSet;
use super::optimizer::fold_single_use_variables;
use super::postdom::PostDominatorTree;
use super::printer::{PseudocodePrinter, RenderOptions, Syntax};
use super::stack_frame::ConstantPool;
use super::structurer::{ReconstructOptions, Structurer};
use crate::container::{DcContainer, ScriptFunction};
use crate::error::{AnalysisInconsistency, DecodeError};
use crate::sid::SidResolver;
use std::fmt::Write as _;
use tracing::{debug, warn};

/// 復元済みの関数
#[derive(Debug, Clone)]
pub struct DecompiledFunction {
    pub disassembly: FunctionDisassembly,
    pub cfg: ControlFlowGraph,
    pub body: Block,
    /// 構造化できずに平坦化した
    pub flattened: bool,
    pub warnings: Vec<AnalysisInconsistency>,
}

impl DecompiledFunction {
    pub fn id(&self) -> &str {
        &self.disassembly.id
    }

    pub fn signature(&self) -> String {
        self.disassembly.signature()
    }

    pub fn params(&self) -> Vec<String> {
        (0..self.disassembly.frame.argument_count)
            .map(|i| format!("arg_{}", i))
            .collect()
    }

    /// 本体のみ
    pub fn render_body(&self, options: &RenderOptions) -> String {
        PseudocodePrinter::new(options.clone()).render_function(
            &self.signature(),
            self.id(),
            &self.params(),
            &self.body,
        )
    }

    /// シンボルテーブル・逆アセンブルをコメントとして前置した全体
    pub fn render(&self, resolver: &SidResolver, options: &RenderOptions) -> String {
        let comment = match options.syntax {
            Syntax::C => "// ",
            Syntax::Racket => ";; ",
        };
        let mut out = String::new();
        if options.emit_symbol_table {
            let dump = self.disassembly.symbol_table_dump(resolver);
            for line in dump.lines() {
                let _ = writeln!(out, "{}{}", comment, line);
            }
        }
        if options.emit_disassembly {
            for line in self.disassembly.listing().lines() {
                let _ = writeln!(out, "{}{}", comment, line);
            }
        }
        out.push_str(&self.render_body(options));
        out.push('\n');
        out
    }

    pub fn to_dot(&self) -> String {
        self.cfg.to_dot()
    }
}

/// コンテナ内の関数
pub fn decompile_function(
    container: &DcContainer,
    function: &ScriptFunction,
    resolver: &SidResolver,
    options: &ReconstructOptions,
) -> Result<DecompiledFunction, DecodeError> {
    let disassembly = Disassembler::new(resolver).disassemble_function(container, function)?;
    Ok(reconstruct(disassembly, resolver, options))
}

/// 命令列と定数プールから
pub fn decompile_instructions(
    id: impl Into<String>,
    instructions: &[Instruction],
    pool: ConstantPool,
    resolver: &SidResolver,
    options: &ReconstructOptions,
) -> Result<DecompiledFunction, DecodeError> {
    let disassembly = Disassembler::new(resolver).disassemble(id, instructions, pool, 0)?;
    Ok(reconstruct(disassembly, resolver, options))
}

/// 逆アセンブル結果から構造化まで。失敗しない
pub fn reconstruct(
    disassembly: FunctionDisassembly,
    resolver: &SidResolver,
    options: &ReconstructOptions,
) -> DecompiledFunction {
    let mut cfg = ControlFlowGraph::build(&disassembly);
    let mut warnings = disassembly.warnings.clone();

    let (postdom, problem) = match PostDominatorTree::compute(&cfg) {
        Ok(tree) => {
            tree.apply(&mut cfg);
            (tree, None)
        }
        Err(e) => (PostDominatorTree::empty(cfg.len()), Some(e)),
    };
    let loops = LoopSet::detect(&cfg, &disassembly.frame.backward_jumps);
    let structurer = || Structurer::new(&disassembly, &cfg, &postdom, &loops, resolver, options.clone());

    let outcome = match problem {
        Some(e) => Err(e),
        None => structurer().reconstruct(),
    };
    let (body, flattened) = match outcome {
        Ok(result) => {
            warnings.extend(result.warnings);
            let body = if options.fold_variables {
                fold_single_use_variables(result.body, options.max_inline_complexity)
            } else {
                result.body
            };
            (body, false)
        }
        Err(e) => {
            warn!("{}: {}; emitting flat body", disassembly.id, e);
            warnings.push(e);
            let result = structurer().flatten();
            warnings.extend(result.warnings);
            (result.body, true)
        }
    };

    debug!(
        "{}: {} nodes, {} loops, {} statements{}",
        disassembly.id,
        cfg.len(),
        loops.len(),
        body.len(),
        if flattened { " (flat)" } else { "" }
    );

    DecompiledFunction {
        disassembly,
        cfg,
        body,
        flattened,
        warnings,
    }
}
