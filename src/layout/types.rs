use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ir::Point;

/// Node ids sharing one topological depth.
pub type Layer = Vec<String>;
pub type LayerSet = Vec<Layer>;

pub const VIRTUAL_ROOT_ID: &str = "__virtual_root__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub id: String,
    /// Indices into the owning [`FlatTree`].
    pub children: Vec<usize>,
}

impl TreeNode {
    pub fn is_virtual(&self) -> bool {
        self.id == VIRTUAL_ROOT_ID
    }
}

/// Spanning tree stored as an arena; index 0 is the root and every child
/// sits at a higher index than its parent. Arbitrarily deep chains are
/// walked without recursion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlatTree {
    nodes: Vec<TreeNode>,
}

impl FlatTree {
    pub const ROOT: usize = 0;

    pub fn new(root: impl Into<String>) -> Self {
        Self {
            nodes: vec![TreeNode {
                id: root.into(),
                children: Vec::new(),
            }],
        }
    }

    /// Appends `id` under `parent` and returns its index.
    pub fn add_child(&mut self, parent: usize, id: impl Into<String>) -> usize {
        let index = self.nodes.len();
        self.nodes.push(TreeNode {
            id: id.into(),
            children: Vec::new(),
        });
        if let Some(node) = self.nodes.get_mut(parent) {
            node.children.push(index);
        }
        index
    }

    pub fn root(&self) -> &TreeNode {
        &self.nodes[Self::ROOT]
    }

    pub fn node(&self, index: usize) -> &TreeNode {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Visible node count, excluding a synthetic root.
    pub fn count(&self) -> usize {
        self.nodes.iter().filter(|node| !node.is_virtual()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bounds {
    pub min_x: f32,
    pub max_x: f32,
    pub min_y: f32,
    pub max_y: f32,
}

impl Bounds {
    pub fn of<'a>(points: impl IntoIterator<Item = &'a Point>) -> Self {
        let mut min_x = f32::MAX;
        let mut min_y = f32::MAX;
        let mut max_x = f32::MIN;
        let mut max_y = f32::MIN;
        for point in points {
            min_x = min_x.min(point.x);
            min_y = min_y.min(point.y);
            max_x = max_x.max(point.x);
            max_y = max_y.max(point.y);
        }
        if min_x == f32::MAX {
            return Self::default();
        }
        Self {
            min_x,
            max_x,
            min_y,
            max_y,
        }
    }

    pub fn width(&self) -> f32 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f32 {
        self.max_y - self.min_y
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutResult {
    pub positions: BTreeMap<String, Point>,
    pub bounds: Bounds,
    pub roots: Vec<String>,
    pub virtual_root: bool,
}

impl LayoutResult {
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Per-call overrides; unset fields fall back to [`crate::config::LayoutConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutOptions {
    pub start_x: Option<f32>,
    pub start_y: Option<f32>,
    pub col_spacing: Option<f32>,
    pub lane_gap: Option<f32>,
    pub col_scale: Option<f32>,
    pub lane_scale: Option<f32>,
    pub spread_x: Option<f32>,
    pub spread_y: Option<f32>,
    pub expand_x: Option<f32>,
    pub canvas_height: Option<f32>,
}
