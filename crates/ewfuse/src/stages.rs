//! Splits an expression tree into the ordered stages of one fused kernel.
//!
//! Reductions and the purely scalar arithmetic stacked on top of them are
//! pulled out into their own stages (deepest first). Whatever stays in the
//! tree becomes the terminal stage. Structurally identical subtrees are staged
//! once and referenced through [`NodeItem::Staged`] afterwards.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ops::Op;
use crate::signature::SigItem;
use crate::tree::{ExprTree, NodeId, NodeItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageKind {
    /// Loop over the axis accumulating into a register, then a cross-thread reduction.
    Reduction,
    /// Straight-line math over reduced values, run convergently by every thread.
    Scalar,
    /// Store of a per-block scalar, done by thread 0.
    RedOut,
    /// Loop over the axis storing one element per iteration.
    EwOut,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub kind: StageKind,
    /// Postfix items; the last item produces the stage's value.
    pub items: Vec<NodeItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyItem {
    Op(Op),
    /// Ops whose value depends on more than their operands (`rand`, `onehot`).
    Distinct(Op, u32),
    Tensor(usize),
    Const(usize),
    Staged(u32),
}

fn key_item(item: &NodeItem) -> KeyItem {
    match *item {
        NodeItem::Sig(SigItem::Tensor { slot, .. }) => KeyItem::Tensor(slot),
        NodeItem::Sig(SigItem::Const { slot }) => KeyItem::Const(slot),
        NodeItem::Sig(SigItem::OneHot { id, .. }) => KeyItem::Distinct(Op::OneHot, id),
        NodeItem::Sig(SigItem::Op { op: Op::Rand, id }) => KeyItem::Distinct(Op::Rand, id),
        NodeItem::Sig(SigItem::Op { op, .. }) => KeyItem::Op(op),
        NodeItem::Sig(SigItem::Assign { .. }) => KeyItem::Op(Op::Assign),
        NodeItem::Staged { origin, .. } => KeyItem::Staged(origin),
    }
}

struct Splitter<'t> {
    tree: &'t mut ExprTree,
    staged: HashMap<Vec<KeyItem>, (u32, Op)>,
    parents: Vec<NodeId>,
    stages: Vec<Stage>,
}

impl Splitter<'_> {
    fn visit(&mut self, id: NodeId) {
        let children = self.tree.node(id).children.clone();
        if children.is_empty() {
            return;
        }
        let op = self.tree.node(id).item.op();
        let is_assign = op == Some(Op::Assign);

        // assign always stays in the terminal stage
        if !is_assign {
            self.parents.push(id);
        }
        for child in children {
            self.visit(child);
        }
        if !is_assign {
            self.parents.pop();
        }

        if !op.is_some_and(Op::is_reduction) {
            return;
        }

        if let Some(items) = self.extract(id) {
            self.stages.push(Stage {
                kind: StageKind::Reduction,
                items,
            });
        }

        for &parent in &self.parents {
            let node = self.tree.node_mut(parent);
            node.reductions = node.reductions.saturating_sub(1);
        }

        let mut scalar_parent = None;
        for &parent in self.parents.iter().rev() {
            let node = self.tree.node(parent);
            if node.scalar && node.reductions == 0 {
                scalar_parent = Some(parent);
            } else {
                break;
            }
        }
        if let Some(parent) = scalar_parent {
            if let Some(items) = self.extract(parent) {
                self.stages.push(Stage {
                    kind: StageKind::Scalar,
                    items,
                });
            }
        }
    }

    /// Serializes and truncates `id`. Returns `None` when an identical
    /// subtree was already staged and `id` now aliases it.
    fn extract(&mut self, id: NodeId) -> Option<Vec<NodeItem>> {
        let items = self.tree.post_order(id);
        let key: Vec<KeyItem> = items.iter().map(key_item).collect();
        let (own_id, own_op) = match self.tree.node(id).item {
            NodeItem::Sig(sig) => (sig.op_id()?, sig.op()?),
            NodeItem::Staged { .. } => return None,
        };

        if let Some(&(origin, op)) = self.staged.get(&key) {
            self.tree.truncate(id, origin, op);
            return None;
        }
        self.staged.insert(key, (own_id, own_op));
        self.tree.truncate(id, own_id, own_op);
        Some(items)
    }
}

/// Splits `tree` into stages in emission order; the terminal stage is last.
pub fn split_stages(tree: &mut ExprTree) -> Vec<Stage> {
    let root = tree.root();
    let had_reductions = tree.node(root).reductions > 0;

    let mut splitter = Splitter {
        tree,
        staged: HashMap::new(),
        parents: Vec::new(),
        stages: Vec::new(),
    };
    splitter.visit(root);
    let mut stages = splitter.stages;

    let kind = if tree.node(root).scalar && had_reductions {
        StageKind::RedOut
    } else {
        StageKind::EwOut
    };
    stages.push(Stage {
        kind,
        items: tree.post_order(root),
    });
    stages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::signature::{Signature, TakeMode};

    fn tensor(slot: usize) -> SigItem {
        SigItem::Tensor {
            slot,
            dtype: DType::F32,
            take: TakeMode::None,
        }
    }

    fn op(op: Op, id: u32) -> SigItem {
        SigItem::Op { op, id }
    }

    fn assign(id: u32) -> SigItem {
        SigItem::Assign {
            id,
            stochastic: false,
            threads: 32,
        }
    }

    fn split(items: Vec<SigItem>) -> Vec<Stage> {
        let mut tree = ExprTree::build(&Signature::new(items)).unwrap();
        split_stages(&mut tree)
    }

    fn kinds(stages: &[Stage]) -> Vec<StageKind> {
        stages.iter().map(|s| s.kind).collect()
    }

    #[test]
    fn plain_elementwise_is_a_single_stage() {
        let stages = split(vec![tensor(0), tensor(1), tensor(2), op(Op::Add, 0), assign(1)]);
        assert_eq!(kinds(&stages), vec![StageKind::EwOut]);
        assert_eq!(stages[0].items.len(), 5);
    }

    #[test]
    fn duplicate_reductions_share_one_stage() {
        // C = sum(A) + sum(A)
        let stages = split(vec![
            tensor(0),
            tensor(1),
            op(Op::Sum, 0),
            tensor(1),
            op(Op::Sum, 1),
            op(Op::Add, 2),
            assign(3),
        ]);
        assert_eq!(
            kinds(&stages),
            vec![StageKind::Reduction, StageKind::Scalar, StageKind::RedOut]
        );
        assert_eq!(
            stages[1].items,
            vec![
                NodeItem::Staged {
                    origin: 0,
                    op: Op::Sum
                },
                NodeItem::Staged {
                    origin: 0,
                    op: Op::Sum
                },
                NodeItem::Sig(op(Op::Add, 2)),
            ]
        );
        assert_eq!(
            stages[2].items[1],
            NodeItem::Staged {
                origin: 2,
                op: Op::Add
            }
        );
    }

    #[test]
    fn scalar_epilogue_is_extracted_above_the_reduction() {
        // C = sum(A) * 2
        let stages = split(vec![
            tensor(0),
            tensor(1),
            op(Op::Sum, 0),
            SigItem::Const { slot: 2 },
            op(Op::Mul, 1),
            assign(2),
        ]);
        assert_eq!(
            kinds(&stages),
            vec![StageKind::Reduction, StageKind::Scalar, StageKind::RedOut]
        );
        assert_eq!(stages[0].items.len(), 2);
    }

    #[test]
    fn reduction_feeding_elementwise_output() {
        // C = A - max(A)
        let stages = split(vec![
            tensor(0),
            tensor(1),
            tensor(1),
            op(Op::Max, 0),
            op(Op::Sub, 1),
            assign(2),
        ]);
        assert_eq!(kinds(&stages), vec![StageKind::Reduction, StageKind::EwOut]);
        assert_eq!(
            stages[1].items,
            vec![
                NodeItem::Sig(tensor(0)),
                NodeItem::Sig(tensor(1)),
                NodeItem::Staged {
                    origin: 0,
                    op: Op::Max
                },
                NodeItem::Sig(op(Op::Sub, 1)),
                NodeItem::Sig(assign(2)),
            ]
        );
    }

    #[test]
    fn nested_reductions_are_staged_deepest_first() {
        // C = sum(A - max(A))
        let stages = split(vec![
            tensor(0),
            tensor(1),
            tensor(1),
            op(Op::Max, 0),
            op(Op::Sub, 1),
            op(Op::Sum, 2),
            assign(3),
        ]);
        assert_eq!(
            kinds(&stages),
            vec![
                StageKind::Reduction,
                StageKind::Reduction,
                StageKind::RedOut
            ]
        );
        assert_eq!(stages[0].items.last(), Some(&NodeItem::Sig(op(Op::Max, 0))));
        assert_eq!(stages[1].items.last(), Some(&NodeItem::Sig(op(Op::Sum, 2))));
    }

    #[test]
    fn random_reductions_are_never_merged() {
        // C = sum(rand) + sum(rand)
        let stages = split(vec![
            tensor(0),
            op(Op::Rand, 0),
            op(Op::Sum, 1),
            op(Op::Rand, 2),
            op(Op::Sum, 3),
            op(Op::Add, 4),
            assign(5),
        ]);
        let reductions = stages
            .iter()
            .filter(|s| s.kind == StageKind::Reduction)
            .count();
        assert_eq!(reductions, 2);
    }

    #[test]
    fn constant_fill_stays_elementwise() {
        let stages = split(vec![tensor(0), SigItem::Const { slot: 1 }, assign(0)]);
        assert_eq!(kinds(&stages), vec![StageKind::EwOut]);
    }
}
