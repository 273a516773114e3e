/// 合流点の変数（phiレジスタ）解析
///
/// 分岐の両経路または ループ本体で書き込まれ、合流後に書き込み前に読まれるレジスタは
/// 経路ごとに代入される変数として宣言する必要がある。
/// 合流後に読まれないものは変数にしない。

use super::cfg::{ControlFlowGraph, NodeId};
use super::instruction::RegisterSet;
use super::loops::Loop;

/// ノード単位の生存レジスタ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterLiveness {
    pub live_in: Vec<RegisterSet>,
    pub live_out: Vec<RegisterSet>,
}

impl RegisterLiveness {
    /// 後ろ向きの不動点計算
    pub fn compute(cfg: &ControlFlowGraph) -> Self {
        let len = cfg.len();
        let mut live_in = vec![RegisterSet::new(); len];
        let mut live_out = vec![RegisterSet::new(); len];

        let mut changed = true;
        while changed {
            changed = false;
            for node in cfg.nodes.iter().rev() {
                let out = node
                    .successors()
                    .into_iter()
                    .fold(RegisterSet::new(), |acc, s| acc.union(live_in[s]));
                let inn = node.read_first.union(out.difference(node.written));
                if out != live_out[node.id] || inn != live_in[node.id] {
                    live_out[node.id] = out;
                    live_in[node.id] = inn;
                    changed = true;
                }
            }
        }

        Self { live_in, live_out }
    }
}

/// phiレジスタ解析器
pub struct PhiAnalyzer<'a> {
    cfg: &'a ControlFlowGraph,
    liveness: RegisterLiveness,
}

impl<'a> PhiAnalyzer<'a> {
    pub fn new(cfg: &'a ControlFlowGraph) -> Self {
        Self {
            cfg,
            liveness: RegisterLiveness::compute(cfg),
        }
    }

    pub fn liveness(&self) -> &RegisterLiveness {
        &self.liveness
    }

    pub fn live_in(&self, node: NodeId) -> RegisterSet {
        self.liveness.live_in.get(node).copied().unwrap_or_default()
    }

    /// `start` から `(lower, upper)` の範囲内だけを辿って到達するノード
    fn region(&self, start: NodeId, lower: NodeId, upper: NodeId) -> Vec<NodeId> {
        let mut visited = vec![false; self.cfg.len()];
        let mut stack = vec![start];
        let mut region = Vec::new();
        while let Some(node) = stack.pop() {
            if node <= lower || node >= upper || visited[node] {
                continue;
            }
            visited[node] = true;
            region.push(node);
            stack.extend(self.cfg.node(node).successors());
        }
        region.sort_unstable();
        region
    }

    /// `start` から合流点までの経路で書き込まれるレジスタ
    pub fn written_on_path(&self, branch: NodeId, start: NodeId, merge: Option<NodeId>) -> RegisterSet {
        let upper = merge.unwrap_or(self.cfg.len());
        self.region(start, branch, upper)
            .into_iter()
            .fold(RegisterSet::new(), |acc, n| acc.union(self.cfg.node(n).written))
    }

    /// 分岐ノードとその合流点に対するphiレジスタ
    pub fn branch_phis(&self, branch: NodeId, merge: Option<NodeId>) -> RegisterSet {
        let node = self.cfg.node(branch);
        let written = node
            .successors()
            .into_iter()
            .fold(RegisterSet::new(), |acc, s| acc.union(self.written_on_path(branch, s, merge)));
        match merge {
            Some(merge) => written.intersection(self.live_in(merge)),
            // 合流点なし: 関数末尾で合流する
            None => RegisterSet::new(),
        }
    }

    /// ループで運ばれるレジスタ
    pub fn loop_phis(&self, lp: &Loop) -> RegisterSet {
        let written = lp
            .body
            .iter()
            .fold(RegisterSet::new(), |acc, &n| acc.union(self.cfg.node(n).written));
        let mut live = self.live_in(lp.head);
        if let Some(exit) = lp.exit(self.cfg) {
            live = live.union(self.live_in(exit));
        }
        written.intersection(live)
    }
}
