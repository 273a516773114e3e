/// ループ検出
///
/// ヘッドは後方ジャンプの分岐先から始まるノード、ラッチは後方ジャンプを含むノード、
/// 本体は `[head, latch]` の連続したノード範囲。
/// 同じヘッドへの後方ジャンプが複数あれば1つのループにまとめ、最後のものをラッチとする。
/// それ以外の後方ジャンプは `continue` になる。
/// 元のコンパイラは無関係なコードをループの途中に挟まないので連続性を仮定できる。

use super::cfg::{ControlFlowGraph, NodeId};
use super::instruction::Instruction;
use super::stack_frame::BackwardJump;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use tracing::debug;

/// 自然ループ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loop {
    pub head: NodeId,
    pub latch: NodeId,
    /// ヘッドからラッチまで（昇順）
    pub body: Vec<NodeId>,
    /// このヘッドへの後方ジャンプの行（昇順）
    pub jump_lines: Vec<usize>,
}

impl Loop {
    pub fn contains(&self, node: NodeId) -> bool {
        self.range().contains(&node)
    }

    pub fn range(&self) -> RangeInclusive<NodeId> {
        self.head..=self.latch
    }

    /// ループを抜けた先のノード
    pub fn exit(&self, cfg: &ControlFlowGraph) -> Option<NodeId> {
        (self.latch + 1 < cfg.len()).then_some(self.latch + 1)
    }
}

/// 関数内のループ一覧
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopSet {
    loops: Vec<Loop>,
}

impl LoopSet {
    pub fn detect(cfg: &ControlFlowGraph, jumps: &[BackwardJump]) -> Self {
        let mut loops: Vec<Loop> = Vec::with_capacity(jumps.len());
        for jump in jumps {
            let (Some(head), Some(latch)) = (cfg.node_starting_at(jump.target), cfg.node_at_line(jump.location))
            else {
                continue;
            };
            if head > latch {
                continue;
            }
            match loops.iter_mut().find(|l| l.head == head) {
                Some(existing) => {
                    existing.latch = existing.latch.max(latch);
                    existing.body = (head..=existing.latch).collect();
                    existing.jump_lines.push(jump.location);
                    existing.jump_lines.sort_unstable();
                }
                None => loops.push(Loop {
                    head,
                    latch,
                    body: (head..=latch).collect(),
                    jump_lines: vec![jump.location],
                }),
            }
        }
        debug!("detected {} loops from {} backward jumps", loops.len(), jumps.len());
        Self { loops }
    }

    /// 命令列から後方ジャンプを拾って検出
    pub fn from_instructions(cfg: &ControlFlowGraph, instructions: &[Instruction]) -> Self {
        let jumps: Vec<BackwardJump> = instructions
            .iter()
            .enumerate()
            .filter_map(|(location, istr)| {
                let target = istr.branch_target()? as usize;
                (target < location).then_some(BackwardJump { location, target })
            })
            .collect();
        Self::detect(cfg, &jumps)
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Loop> {
        self.loops.iter()
    }

    /// ヘッドで引く
    pub fn at_head(&self, head: NodeId) -> Option<&Loop> {
        self.loops.iter().find(|l| l.head == head)
    }

    /// ノードを含む最も内側のループ
    pub fn innermost_containing(&self, node: NodeId) -> Option<&Loop> {
        self.loops
            .iter()
            .filter(|l| l.contains(node))
            .min_by_key(|l| l.latch - l.head)
    }
}
