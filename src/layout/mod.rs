mod compact_box;
mod layers;
mod tree;
pub(crate) mod types;

pub use compact_box::{BoxGaps, compact_box};
pub use layers::{build_layers, validate_layers};
pub(crate) use layers::valid_node_ids;
pub use tree::{LayoutTree, natural_cmp, parse_port_index};
pub use types::*;

use crate::config::LayoutConfig;
use crate::ir::{CanvasNode, Edge, NodeKind, Point, Size};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{BuildHasher, Hash, Hasher};

/// Resolved knobs for one layout pass: per-call options over config defaults.
#[derive(Debug, Clone, Copy)]
struct Settings {
    start_x: f32,
    start_y: f32,
    col_spacing: f32,
    lane_gap: f32,
    col_scale: f32,
    lane_scale: f32,
    spread_x: f32,
    spread_y: f32,
    expand_x: f32,
    canvas_height: f32,
}

impl Settings {
    fn resolve(options: &LayoutOptions, config: &LayoutConfig) -> Self {
        let canvas_height = options.canvas_height.unwrap_or(config.canvas_height);
        Self {
            start_x: options.start_x.unwrap_or(config.start_x),
            start_y: options
                .start_y
                .unwrap_or_else(|| config.derived_start_y(canvas_height)),
            col_spacing: options.col_spacing.unwrap_or(config.col_spacing),
            lane_gap: options.lane_gap.unwrap_or(config.lane_gap),
            col_scale: options.col_scale.unwrap_or(config.col_scale),
            lane_scale: options.lane_scale.unwrap_or(config.lane_scale),
            spread_x: options.spread_x.unwrap_or(config.spread_x),
            spread_y: options.spread_y.unwrap_or(config.spread_y),
            expand_x: options.expand_x.unwrap_or(config.expand_x),
            canvas_height,
        }
    }
}

fn measured_size(node: &CanvasNode, config: &LayoutConfig) -> Size {
    let pick = |value: Option<f32>, fallback: f32| match value {
        Some(v) if v.is_finite() && v > 0.0 => v,
        _ => fallback,
    };
    let width = pick(node.size.map(|s| s.width), config.default_node_width);
    let height = pick(node.size.map(|s| s.height), config.default_node_height);
    Size::new(
        width.max(config.min_node_width),
        height.max(config.min_node_height),
    )
}

/// Hierarchical tree layout of a flow graph.
///
/// Returns top-left positions for every well-formed node. Malformed nodes
/// and edges are skipped; an empty graph yields an empty result.
pub fn compute_layout(
    nodes: &[CanvasNode],
    edges: &[Edge],
    options: &LayoutOptions,
    config: &LayoutConfig,
) -> LayoutResult {
    let ids = valid_node_ids(nodes);
    if ids.is_empty() {
        return LayoutResult::default();
    }
    let settings = Settings::resolve(options, config);

    let known: HashSet<&str> = ids.iter().copied().collect();
    let mut sizes: HashMap<String, Size> = HashMap::new();
    let mut max_w = 0.0_f32;
    let mut max_h = 0.0_f32;
    for node in nodes {
        if sizes.contains_key(&node.id) || !known.contains(node.id.as_str()) {
            continue;
        }
        let size = measured_size(node, config);
        max_w = max_w.max(size.width);
        max_h = max_h.max(size.height);
        sizes.insert(node.id.clone(), size);
    }
    let base_col = settings.col_spacing.max(max_w + config.column_pad);
    let base_lane = settings.lane_gap.max(max_h + config.lane_pad);
    let gaps = BoxGaps {
        horizontal: base_col * settings.col_scale,
        vertical: base_lane * settings.lane_scale,
    };

    let tree = LayoutTree::build(nodes, edges);
    let Some(flat) = tree.to_tree() else {
        return LayoutResult::default();
    };
    let mut positions: BTreeMap<String, Point> = compact_box(&flat, &sizes, gaps)
        .into_iter()
        .map(|(id, p)| {
            let shifted = Point::new(p.x + settings.start_x, p.y + settings.start_y);
            (id, shifted)
        })
        .collect();

    apply_spread(&mut positions, settings.spread_x, settings.spread_y);
    if settings.expand_x != 0.0 {
        let depths = tree.depths();
        for (id, point) in positions.iter_mut() {
            let depth = depths.get(id).copied().unwrap_or(0);
            point.x += depth as f32 * settings.expand_x;
        }
    }
    snap_start_to_head(&mut positions, nodes, &tree);
    recenter(&mut positions, &sizes, &settings, config);
    for point in positions.values_mut() {
        point.x = point.x.max(config.min_coordinate);
        point.y = point.y.max(config.min_coordinate);
    }

    let bounds = Bounds::of(positions.values());
    tracing::debug!(
        nodes = positions.len(),
        roots = tree.roots.len(),
        virtual_root = tree.has_virtual_root(),
        "tree layout computed"
    );
    LayoutResult {
        positions,
        bounds,
        virtual_root: tree.has_virtual_root(),
        roots: tree.roots,
    }
}

fn apply_spread(positions: &mut BTreeMap<String, Point>, spread_x: f32, spread_y: f32) {
    if spread_x == 1.0 && spread_y == 1.0 {
        return;
    }
    let bounds = Bounds::of(positions.values());
    for point in positions.values_mut() {
        point.x = bounds.min_x + (point.x - bounds.min_x) * spread_x;
        point.y = bounds.min_y + (point.y - bounds.min_y) * spread_y;
    }
}

/// Aligns the entry node with its single successor.
fn snap_start_to_head(positions: &mut BTreeMap<String, Point>, nodes: &[CanvasNode], tree: &LayoutTree) {
    let start = tree
        .roots
        .iter()
        .find(|root| {
            nodes
                .iter()
                .any(|node| &node.id == *root && node.kind == NodeKind::Start)
        })
        .or_else(|| tree.roots.first());
    let Some(start) = start else {
        return;
    };
    let heads = tree.heads.get(start).map(Vec::as_slice).unwrap_or(&[]);
    let [head] = heads else {
        return;
    };
    if let Some(head_y) = positions.get(head).map(|p| p.y)
        && let Some(start_point) = positions.get_mut(start)
    {
        start_point.y = head_y;
    }
}

fn recenter(
    positions: &mut BTreeMap<String, Point>,
    sizes: &HashMap<String, Size>,
    settings: &Settings,
    config: &LayoutConfig,
) {
    if positions.is_empty() {
        return;
    }
    let min_y = positions.values().map(|p| p.y).fold(f32::MAX, f32::min);
    let max_bottom = positions
        .iter()
        .map(|(id, p)| p.y + sizes.get(id).map(|s| s.height).unwrap_or(0.0))
        .fold(f32::MIN, f32::max);

    let mut offset = 0.0;
    if config.recenter {
        let layout_height = max_bottom - min_y;
        offset = (settings.canvas_height - layout_height) / 2.0 - min_y;
    }
    let top_margin = config.min_top_margin.max(settings.start_y);
    if min_y + offset < top_margin {
        offset = top_margin - min_y;
    }
    if offset != 0.0 {
        for point in positions.values_mut() {
            point.y += offset;
        }
    }
}

const FINGERPRINT_SEEDS: (u64, u64, u64, u64) = (
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);

/// Content hash of any serializable request, stable across calls and processes.
pub fn content_fingerprint<T: Serialize + ?Sized>(value: &T) -> u64 {
    let (k0, k1, k2, k3) = FINGERPRINT_SEEDS;
    let state = ahash::RandomState::with_seeds(k0, k1, k2, k3);
    let mut hasher = state.build_hasher();
    // Float fields have no Hash impl; their JSON text is canonical enough.
    match serde_json::to_vec(value) {
        Ok(bytes) => bytes.hash(&mut hasher),
        Err(err) => tracing::warn!(error = %err, "fingerprint input did not serialize"),
    }
    hasher.finish()
}

/// Content hash of a layout request.
pub fn layout_fingerprint(nodes: &[CanvasNode], edges: &[Edge], options: &LayoutOptions) -> u64 {
    content_fingerprint(&(nodes, edges, options))
}
