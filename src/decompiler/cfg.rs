/// 制御フローグラフ
///
/// ノードは開始行の昇順に振った連番IDで参照する（ポインタは使わない）。
/// 後続は最大2つ: フォールスルーと分岐先。

use super::disassembler::FunctionDisassembly;
use super::instruction::{Instruction, Opcode, RegisterSet};
use petgraph::dot::Dot;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::RangeInclusive;

/// ノードID
pub type NodeId = usize;

/// 基本ブロック
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfgNode {
    pub id: NodeId,
    pub start_line: usize,
    /// 最終行（この行を含む）
    pub end_line: usize,
    pub fallthrough: Option<NodeId>,
    pub branch_target: Option<NodeId>,
    pub predecessors: Vec<NodeId>,
    /// 直接後支配ノード
    pub ipdom: Option<NodeId>,
    /// 逆CFG上の後順序番号
    pub postorder: Option<usize>,
    /// このノード内で書き込まれる前に読まれるレジスタ
    pub read_first: RegisterSet,
    /// このノード内で書き込まれるレジスタ
    pub written: RegisterSet,
}

impl CfgNode {
    fn new(id: NodeId, start_line: usize, end_line: usize) -> Self {
        Self {
            id,
            start_line,
            end_line,
            fallthrough: None,
            branch_target: None,
            predecessors: Vec::new(),
            ipdom: None,
            postorder: None,
            read_first: RegisterSet::new(),
            written: RegisterSet::new(),
        }
    }

    pub fn lines(&self) -> RangeInclusive<usize> {
        self.start_line..=self.end_line
    }

    /// 後続ノード（重複なし）
    pub fn successors(&self) -> Vec<NodeId> {
        let mut successors = Vec::with_capacity(2);
        for successor in [self.fallthrough, self.branch_target].into_iter().flatten() {
            if !successors.contains(&successor) {
                successors.push(successor);
            }
        }
        successors
    }
}

/// 制御フローグラフ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlFlowGraph {
    pub nodes: Vec<CfgNode>,
    /// Returnで終わる最後のノード
    pub terminal: Option<NodeId>,
    line_to_node: Vec<NodeId>,
}

impl ControlFlowGraph {
    pub fn build(function: &FunctionDisassembly) -> Self {
        let instructions: Vec<Instruction> = function.lines.iter().map(|l| l.instruction).collect();
        Self::from_instructions(&instructions)
    }

    /// 命令列から構築
    pub fn from_instructions(instructions: &[Instruction]) -> Self {
        let len = instructions.len();
        let leaders = leaders(instructions);

        let starts: Vec<usize> = leaders.iter().copied().collect();
        let mut nodes = Vec::with_capacity(starts.len());
        let mut line_to_node = vec![0; len];
        for (id, &start) in starts.iter().enumerate() {
            let end = starts.get(id + 1).map(|&next| next - 1).unwrap_or(len.saturating_sub(1));
            for slot in &mut line_to_node[start..=end] {
                *slot = id;
            }
            nodes.push(CfgNode::new(id, start, end));
        }

        for id in 0..nodes.len() {
            let end = nodes[id].end_line;
            let last = instructions[end];
            let next = (end + 1 < len).then(|| line_to_node[end + 1]);
            let target = last
                .branch_target()
                .map(|t| t as usize)
                .filter(|&t| t < len)
                .map(|t| line_to_node[t]);

            let (fallthrough, branch_target) = match last.opcode {
                Opcode::Return => (None, None),
                Opcode::Branch => (None, target),
                Opcode::BranchIf | Opcode::BranchIfNot => (next, target),
                _ => (next, None),
            };
            nodes[id].fallthrough = fallthrough;
            nodes[id].branch_target = branch_target;

            // 書き込み前の読み込み（同一命令内では読み込みが先）
            let mut read_first = RegisterSet::new();
            let mut written = RegisterSet::new();
            for instruction in &instructions[nodes[id].start_line..=end] {
                read_first = read_first.union(instruction.reads().difference(written));
                written = written.union(instruction.writes());
            }
            nodes[id].read_first = read_first;
            nodes[id].written = written;
        }

        for id in 0..nodes.len() {
            for successor in nodes[id].successors() {
                if !nodes[successor].predecessors.contains(&id) {
                    nodes[successor].predecessors.push(id);
                }
            }
        }

        let terminal = nodes
            .iter()
            .rev()
            .find(|n| instructions[n.end_line].opcode == Opcode::Return)
            .map(|n| n.id);

        Self {
            nodes,
            terminal,
            line_to_node,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &CfgNode {
        &self.nodes[id]
    }

    /// 行を含むノード
    pub fn node_at_line(&self, line: usize) -> Option<NodeId> {
        self.line_to_node.get(line).copied()
    }

    /// その行から始まるノード
    pub fn node_starting_at(&self, line: usize) -> Option<NodeId> {
        self.node_at_line(line).filter(|&id| self.nodes[id].start_line == line)
    }

    /// Returnで終わるノード
    pub fn return_nodes<'a>(&'a self, instructions: &'a [Instruction]) -> impl Iterator<Item = NodeId> + 'a {
        self.nodes
            .iter()
            .filter(move |n| instructions.get(n.end_line).map(|i| i.opcode) == Some(Opcode::Return))
            .map(|n| n.id)
    }

    /// Graphviz DOT形式
    pub fn to_dot(&self) -> String {
        let mut graph: DiGraph<String, &'static str> = DiGraph::new();
        let indices: Vec<NodeIndex> = self
            .nodes
            .iter()
            .map(|n| graph.add_node(format!("N{} [{}..{}]", n.id, n.start_line, n.end_line)))
            .collect();
        for node in &self.nodes {
            if let Some(next) = node.fallthrough {
                graph.add_edge(indices[node.id], indices[next], "fallthrough");
            }
            if let Some(target) = node.branch_target {
                graph.add_edge(indices[node.id], indices[target], "branch");
            }
        }
        format!("{}", Dot::new(&graph))
    }
}

/// ノードの開始行: 0、分岐先、分岐・Returnの次の行
pub fn leaders(instructions: &[Instruction]) -> BTreeSet<usize> {
    let len = instructions.len();
    let mut leaders = BTreeSet::new();
    if len == 0 {
        return leaders;
    }
    leaders.insert(0);
    for (line, instruction) in instructions.iter().enumerate() {
        if let Some(target) = instruction.branch_target() {
            if (target as usize) < len {
                leaders.insert(target as usize);
            }
        }
        let closes = instruction.opcode.is_branch() || instruction.opcode == Opcode::Return;
        if closes && line + 1 < len {
            leaders.insert(line + 1);
        }
    }
    leaders
}

impl std::fmt::Display for ControlFlowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Control Flow Graph:")?;
        writeln!(f, "  Node Count: {}", self.len())?;
        match self.terminal {
            Some(terminal) => writeln!(f, "  Terminal: {}", terminal)?,
            None => writeln!(f, "  Terminal: none")?,
        }
        writeln!(f)?;

        for node in &self.nodes {
            writeln!(f, "Node {} (lines {} - {}):", node.id, node.start_line, node.end_line)?;
            if let Some(next) = node.fallthrough {
                writeln!(f, "  Fallthrough: {}", next)?;
            }
            if let Some(target) = node.branch_target {
                writeln!(f, "  Branch: {}", target)?;
            }
            if !node.predecessors.is_empty() {
                writeln!(f, "  Predecessors: {:?}", node.predecessors)?;
            }
            if let Some(ipdom) = node.ipdom {
                writeln!(f, "  Ipdom: {}", ipdom)?;
            }
            writeln!(f, "  Read first: {}", node.read_first)?;
            writeln!(f, "  Written: {}", node.written)?;
        }

        Ok(())
    }
}
