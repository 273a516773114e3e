/// 後支配木
///
/// Cooper–Harvey–Kennedy の反復アルゴリズムを逆CFGに適用する。
/// 根は終端ノード。終端以外のReturnノードは終端への仮想辺を持つものとして扱う。

use super::cfg::{ControlFlowGraph, NodeId};
use crate::error::AnalysisInconsistency;
use serde::{Deserialize, Serialize};

/// 直接後支配ノードの表
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostDominatorTree {
    root: NodeId,
    ipdom: Vec<Option<NodeId>>,
    postorder: Vec<Option<usize>>,
}

impl PostDominatorTree {
    pub fn compute(cfg: &ControlFlowGraph) -> Result<Self, AnalysisInconsistency> {
        let root = cfg.terminal.ok_or(AnalysisInconsistency::MissingTerminal)?;
        let len = cfg.len();

        // 逆CFGでの後順序
        let order = reverse_postorder_walk(cfg, root);
        let mut postorder = vec![None; len];
        for (index, &node) in order.iter().enumerate() {
            postorder[node] = Some(index);
        }

        let mut doms: Vec<Option<NodeId>> = vec![None; len];
        doms[root] = Some(root);

        let mut changed = true;
        while changed {
            changed = false;
            // 逆後順序（根は最後に積まれている）
            for &node in order.iter().rev() {
                if node == root {
                    continue;
                }
                let mut candidate: Option<NodeId> = None;
                for successor in reverse_predecessors(cfg, root, node) {
                    if doms[successor].is_none() {
                        continue;
                    }
                    candidate = Some(match candidate {
                        None => successor,
                        Some(current) => intersect(&doms, &postorder, successor, current),
                    });
                }
                if candidate.is_some() && doms[node] != candidate {
                    doms[node] = candidate;
                    changed = true;
                }
            }
        }

        Ok(Self {
            root,
            ipdom: doms,
            postorder,
        })
    }

    /// 終端がない関数用。どのノードも後支配ノードを持たない
    pub fn empty(len: usize) -> Self {
        Self {
            root: 0,
            ipdom: vec![None; len],
            postorder: vec![None; len],
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// 直接後支配ノード。終端に到達できないノードは `None`
    pub fn ipdom(&self, node: NodeId) -> Option<NodeId> {
        self.ipdom.get(node).copied().flatten()
    }

    pub fn postorder_index(&self, node: NodeId) -> Option<usize> {
        self.postorder.get(node).copied().flatten()
    }

    /// `a` が `b` を後支配するか
    pub fn postdominates(&self, a: NodeId, b: NodeId) -> bool {
        let mut current = b;
        loop {
            if current == a {
                return true;
            }
            match self.ipdom(current) {
                Some(next) if next != current => current = next,
                _ => return false,
            }
        }
    }

    /// 結果をCFGのノードに書き戻す
    pub fn apply(&self, cfg: &mut ControlFlowGraph) {
        for node in &mut cfg.nodes {
            node.ipdom = self.ipdom(node.id);
            node.postorder = self.postorder_index(node.id);
        }
    }
}

/// 逆CFGでの前任 = CFGでの後続（仮想辺を含む）
fn reverse_predecessors(cfg: &ControlFlowGraph, root: NodeId, node: NodeId) -> Vec<NodeId> {
    let successors = cfg.node(node).successors();
    if successors.is_empty() && node != root {
        vec![root]
    } else {
        successors
    }
}

/// 逆CFGでの後続 = CFGでの前任（根には仮想辺の始点を足す）
fn reverse_successors(cfg: &ControlFlowGraph, root: NodeId, node: NodeId) -> Vec<NodeId> {
    let mut successors = cfg.node(node).predecessors.clone();
    if node == root {
        successors.extend(
            cfg.nodes
                .iter()
                .filter(|n| n.id != root && n.successors().is_empty())
                .map(|n| n.id),
        );
    }
    successors
}

/// 明示的なスタックによる深さ優先探索
fn reverse_postorder_walk(cfg: &ControlFlowGraph, root: NodeId) -> Vec<NodeId> {
    let mut visited = vec![false; cfg.len()];
    let mut order = Vec::with_capacity(cfg.len());
    let mut stack: Vec<(NodeId, Vec<NodeId>)> = vec![(root, reverse_successors(cfg, root, root))];
    visited[root] = true;

    while let Some((node, pending)) = stack.last_mut() {
        match pending.pop() {
            Some(next) if !visited[next] => {
                visited[next] = true;
                let children = reverse_successors(cfg, root, next);
                stack.push((next, children));
            }
            Some(_) => {}
            None => {
                order.push(*node);
                stack.pop();
            }
        }
    }
    order
}

fn intersect(doms: &[Option<NodeId>], postorder: &[Option<usize>], a: NodeId, b: NodeId) -> NodeId {
    let rank = |n: NodeId| postorder[n].unwrap_or(0);
    let (mut x, mut y) = (a, b);
    while x != y {
        while rank(x) < rank(y) {
            match doms[x] {
                Some(next) if next != x => x = next,
                _ => return y,
            }
        }
        while rank(y) < rank(x) {
            match doms[y] {
                Some(next) if next != y => y = next,
                _ => return x,
            }
        }
    }
    x
}
