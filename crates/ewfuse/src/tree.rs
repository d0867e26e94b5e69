//! Arena expression tree rebuilt from a kernel signature.

use crate::error::{FuseError, FuseResult};
use crate::ops::Op;
use crate::signature::{SigItem, Signature};

pub type NodeId = usize;

/// What a node stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeItem {
    Sig(SigItem),
    /// Value produced by an earlier stage, named by the op that produced it.
    Staged { origin: u32, op: Op },
}

impl NodeItem {
    pub fn op(&self) -> Option<Op> {
        match self {
            NodeItem::Sig(item) => item.op(),
            NodeItem::Staged { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub item: NodeItem,
    /// All operands are scalar per block (no per-element data beneath).
    pub scalar: bool,
    /// Reductions still present in this subtree, including the node itself.
    pub reductions: u32,
    /// Operands in left-to-right order.
    pub children: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct ExprTree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl ExprTree {
    /// Rebuilds the tree with an operand stack.
    ///
    /// The root must be the single `assign`, and its first operand must be
    /// the output tensor in slot 0.
    pub fn build(signature: &Signature) -> FuseResult<Self> {
        let mut nodes: Vec<Node> = Vec::with_capacity(signature.items().len());
        let mut stack: Vec<NodeId> = Vec::new();
        let mut assigns = 0usize;

        for item in signature.items() {
            let node = match *item {
                SigItem::Tensor { slot, .. } => Node {
                    item: NodeItem::Sig(*item),
                    scalar: slot == 0,
                    reductions: 0,
                    children: Vec::new(),
                },
                SigItem::Const { .. } => Node {
                    item: NodeItem::Sig(*item),
                    scalar: true,
                    reductions: 0,
                    children: Vec::new(),
                },
                SigItem::Op { .. } | SigItem::OneHot { .. } | SigItem::Assign { .. } => {
                    let op = item
                        .op()
                        .ok_or_else(|| FuseError::construction("operation without op kind"))?;
                    if op == Op::Assign {
                        assigns += 1;
                    }
                    let arity = op.arity();
                    if stack.len() < arity {
                        return Err(FuseError::construction(format!(
                            "{op} needs {arity} operand(s) but only {} are available",
                            stack.len()
                        )));
                    }
                    let children = stack.split_off(stack.len() - arity);
                    let reductions = children
                        .iter()
                        .map(|&child| nodes[child].reductions)
                        .sum::<u32>();
                    if op.is_reduction() {
                        Node {
                            item: NodeItem::Sig(*item),
                            scalar: true,
                            reductions: reductions + 1,
                            children,
                        }
                    } else {
                        Node {
                            item: NodeItem::Sig(*item),
                            scalar: arity > 0 && children.iter().all(|&child| nodes[child].scalar),
                            reductions,
                            children,
                        }
                    }
                }
            };
            nodes.push(node);
            stack.push(nodes.len() - 1);
        }

        if stack.len() != 1 {
            return Err(FuseError::construction(format!(
                "expression leaves {} operands on the stack",
                stack.len()
            )));
        }
        let root = stack[0];
        if assigns != 1 || nodes[root].item.op() != Some(Op::Assign) {
            return Err(FuseError::construction(
                "expression must end with exactly one assign",
            ));
        }
        let target = nodes[root].children[0];
        if !matches!(
            nodes[target].item,
            NodeItem::Sig(SigItem::Tensor { slot: 0, .. })
        ) {
            return Err(FuseError::construction(
                "the output tensor must be the target of assign",
            ));
        }

        Ok(Self { nodes, root })
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    /// Postfix serialization of the subtree under `id`.
    pub fn post_order(&self, id: NodeId) -> Vec<NodeItem> {
        let mut out = Vec::new();
        self.post_order_into(id, &mut out);
        out
    }

    fn post_order_into(&self, id: NodeId, out: &mut Vec<NodeItem>) {
        let node = &self.nodes[id];
        for &child in &node.children {
            self.post_order_into(child, out);
        }
        out.push(node.item);
    }

    /// Replaces the subtree under `id` with a reference to a staged value.
    pub(crate) fn truncate(&mut self, id: NodeId, origin: u32, op: Op) {
        let node = &mut self.nodes[id];
        node.item = NodeItem::Staged { origin, op };
        node.children.clear();
        node.reductions = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::signature::TakeMode;

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

    #[test]
    fn operands_keep_left_to_right_order() {
        // C = A - B
        let sig = Signature::new(vec![tensor(0), tensor(1), tensor(2), op(Op::Sub, 0), assign(1)]);
        let tree = ExprTree::build(&sig).unwrap();
        let sub = tree.node(tree.root()).children[1];
        let operands: Vec<_> = tree
            .node(sub)
            .children
            .iter()
            .map(|&c| tree.node(c).item)
            .collect();
        assert_eq!(
            operands,
            vec![NodeItem::Sig(tensor(1)), NodeItem::Sig(tensor(2))]
        );
        assert!(!tree.node(sub).scalar);
    }

    #[test]
    fn reductions_are_scalar_and_counted() {
        // C = sum(A) * 2 + max(A)
        let sig = Signature::new(vec![
            tensor(0),
            tensor(1),
            op(Op::Sum, 0),
            SigItem::Const { slot: 2 },
            op(Op::Mul, 1),
            tensor(1),
            op(Op::Max, 2),
            op(Op::Add, 3),
            assign(4),
        ]);
        let tree = ExprTree::build(&sig).unwrap();
        let root = tree.node(tree.root());
        assert!(root.scalar);
        assert_eq!(root.reductions, 2);
        let add = tree.node(root.children[1]);
        assert!(add.scalar);
        assert_eq!(add.reductions, 2);
    }

    #[test]
    fn nullary_ops_are_not_scalar() {
        let sig = Signature::new(vec![tensor(0), op(Op::Rand, 0), assign(1)]);
        let tree = ExprTree::build(&sig).unwrap();
        assert!(!tree.node(tree.root()).scalar);
    }

    #[test]
    fn stack_underflow_is_rejected() {
        let sig = Signature::new(vec![tensor(0), op(Op::Add, 0), assign(1)]);
        assert!(matches!(
            ExprTree::build(&sig),
            Err(FuseError::Construction { .. })
        ));
    }

    #[test]
    fn leftover_operands_are_rejected() {
        let sig = Signature::new(vec![tensor(0), tensor(1), tensor(2), assign(0)]);
        assert!(matches!(
            ExprTree::build(&sig),
            Err(FuseError::Construction { .. })
        ));
    }

    #[test]
    fn missing_assign_is_rejected() {
        let sig = Signature::new(vec![tensor(0), tensor(1), op(Op::Add, 0)]);
        assert!(matches!(
            ExprTree::build(&sig),
            Err(FuseError::Construction { .. })
        ));
    }
}
