/// DCスクリプトのデコンパイラ本体
///
/// 段階1: 命令デコードとレジスタ状態シミュレーション
/// 段階2: CFG・後支配木・ループ・phiレジスタ解析
/// 段階3: 構造化復元、構文木の最適化、疑似コード出力

pub mod instruction;
pub mod types;
pub mod stack_frame;
pub mod disassembler;
pub mod cfg;
pub mod postdom;
pub mod loops;
pub mod phi;
pub mod ast;
pub mod structurer;
pub mod optimizer;
pub mod printer;
pub mod pipeline;

pub use instruction::{Instruction, OpClass, Opcode, RegisterSet};
pub use types::{FloatType, FunctionType, IntType, Type};
pub use stack_frame::{Constant, ConstantKind, ConstantPool, StackFrame};
pub use disassembler::{Disassembler, DisassemblyLine, FunctionDisassembly};
pub use cfg::{CfgNode, ControlFlowGraph, NodeId};
pub use postdom::PostDominatorTree;
pub use loops::{Loop, LoopSet};
pub use phi::{PhiAnalyzer, RegisterLiveness};
pub use ast::{BinaryOp, Block, Expr, Literal, Stmt, UnaryOp};
pub use structurer::{ReconstructOptions, Reconstruction, Structurer};
pub use optimizer::fold_single_use_variables;
pub use printer::{PseudocodePrinter, RenderOptions, Syntax};
pub use pipeline::{decompile_function, decompile_instructions, DecompiledFunction};
