use crate::ir::{BranchId, CanvasNode, NodeKind};

/// Whether a node should carry preview lines on its open branches.
pub fn should_create_preview_line(node: &CanvasNode) -> bool {
    match node.kind {
        NodeKind::DragHint | NodeKind::Terminal => false,
        NodeKind::Start => true,
        NodeKind::Split | NodeKind::Normal => node.configured,
    }
}

/// Same as [`should_create_preview_line`] without the `configured` requirement.
/// Used by bulk refreshes so unfinished nodes still get visual stubs.
pub fn should_create_preview_line_forced(node: &CanvasNode) -> bool {
    !matches!(node.kind, NodeKind::DragHint | NodeKind::Terminal)
}

pub fn is_branch_node(node: &CanvasNode) -> bool {
    node.kind == NodeKind::Split || node.effective_branch_count() > 1
}

pub fn node_branches(node: &CanvasNode) -> Vec<BranchId> {
    node.effective_branches()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_nodes_always_qualify() {
        let node = CanvasNode::new("start", NodeKind::Start);
        assert!(should_create_preview_line(&node));
    }

    #[test]
    fn unconfigured_nodes_need_force() {
        let node = CanvasNode::new("A", NodeKind::Normal);
        assert!(!should_create_preview_line(&node));
        assert!(should_create_preview_line_forced(&node));
        assert!(should_create_preview_line(&node.clone().configured()));
    }

    #[test]
    fn terminals_and_drag_hints_never_qualify() {
        for kind in [NodeKind::Terminal, NodeKind::DragHint] {
            let node = CanvasNode::new("x", kind).configured();
            assert!(!should_create_preview_line(&node));
            assert!(!should_create_preview_line_forced(&node));
        }
    }

    #[test]
    fn branch_node_detection() {
        assert!(is_branch_node(&CanvasNode::new("S", NodeKind::Split)));
        assert!(is_branch_node(
            &CanvasNode::new("N", NodeKind::Normal).with_branch_count(2)
        ));
        assert!(!is_branch_node(&CanvasNode::new("N", NodeKind::Normal)));
    }
}
