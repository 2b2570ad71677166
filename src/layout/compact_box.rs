use std::collections::{BTreeMap, HashMap};

use crate::ir::{Point, Size};

use super::types::{FlatTree, TreeNode};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxGaps {
    /// Between a parent's right edge and its children's left edge.
    pub horizontal: f32,
    /// Between two sibling subtrees.
    pub vertical: f32,
}

/// Left-to-right compact box placement.
///
/// Depth grows along x; siblings stack along y, each subtree taking the
/// band its descendants need and the parent centred on that band. Returned
/// points are top-left corners relative to the layout origin. The virtual
/// root has no size and no entry in the result.
pub fn compact_box(
    tree: &FlatTree,
    sizes: &HashMap<String, Size>,
    gaps: BoxGaps,
) -> BTreeMap<String, Point> {
    let heights = subtree_heights(tree, sizes, gaps.vertical);
    let mut positions = BTreeMap::new();

    // Pre-order: a parent fixes its children's band before they are visited.
    let mut stack = vec![(FlatTree::ROOT, 0.0_f32, heights[FlatTree::ROOT] / 2.0)];
    while let Some((index, left, center_y)) = stack.pop() {
        let node = tree.node(index);
        let size = node_size(node, sizes);
        let child_left = if node.is_virtual() {
            left
        } else {
            positions.insert(
                node.id.clone(),
                Point::new(left, center_y - size.height / 2.0),
            );
            left + size.width + gaps.horizontal
        };
        if node.children.is_empty() {
            continue;
        }

        let total = band_height(&node.children, &heights, gaps.vertical);
        let mut cursor = center_y - total / 2.0;
        for child in &node.children {
            let child_height = heights[*child];
            stack.push((*child, child_left, cursor + child_height / 2.0));
            cursor += child_height + gaps.vertical;
        }
    }
    positions
}

fn node_size(node: &TreeNode, sizes: &HashMap<String, Size>) -> Size {
    if node.is_virtual() {
        return Size::new(0.0, 0.0);
    }
    sizes.get(&node.id).copied().unwrap_or(Size::new(0.0, 0.0))
}

fn band_height(children: &[usize], heights: &[f32], spacing: f32) -> f32 {
    let total: f32 = children.iter().map(|child| heights[*child]).sum();
    total + spacing * (children.len() as f32 - 1.0)
}

/// Height each subtree reserves, indexed like the tree. Post-order with an
/// explicit stack so children are measured before their parent.
fn subtree_heights(tree: &FlatTree, sizes: &HashMap<String, Size>, spacing: f32) -> Vec<f32> {
    let mut heights = vec![0.0_f32; tree.len()];
    let mut stack = vec![(FlatTree::ROOT, false)];
    while let Some((index, expanded)) = stack.pop() {
        let node = tree.node(index);
        if !expanded {
            stack.push((index, true));
            stack.extend(node.children.iter().map(|child| (*child, false)));
            continue;
        }
        let mut height = node_size(node, sizes).height;
        if !node.children.is_empty() {
            height = height.max(band_height(&node.children, &heights, spacing));
        }
        heights[index] = height;
    }
    heights
}
