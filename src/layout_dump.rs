use crate::config::{EngineConfig, OptimizerConfig};
use crate::engine::FlowEditor;
use crate::ir::{FlowSnapshot, NodeKind, Point};
use crate::layout::{Bounds, LayerSet, LayoutOptions, LayoutResult};
use crate::preview::{FlowLine, LineState, PreviewStats, RefreshReport};
use crate::surface::{CanvasSurface, MemoryCanvas};
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDump {
    pub width: f32,
    pub height: f32,
    pub bounds: Bounds,
    pub roots: Vec<String>,
    pub virtual_root: bool,
    pub nodes: Vec<NodeDump>,
    pub lines: Vec<LineDump>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layers: Option<LayerSet>,
    pub refresh: RefreshReport,
    pub stats: PreviewStats,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDump {
    pub id: String,
    pub kind: NodeKind,
    pub x: f32,
    pub y: f32,
    pub width: Option<f32>,
    pub height: Option<f32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineDump {
    pub id: String,
    pub source: String,
    pub branch: String,
    pub preview: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub points: [[f32; 2]; 2],
}

impl LineDump {
    fn from_line(line: &FlowLine) -> Self {
        let end = line.end_point();
        let target = match &line.state {
            LineState::Connection { target, .. } => Some(target.clone()),
            LineState::Preview { .. } => None,
        };
        Self {
            id: line.id.clone(),
            source: line.key.node_id.clone(),
            branch: line.key.branch_id.to_string(),
            preview: line.is_preview(),
            target,
            points: [point(line.source_point), point(end)],
        }
    }
}

fn point(p: Point) -> [f32; 2] {
    [p.x, p.y]
}

impl FlowDump {
    pub fn from_editor<S: CanvasSurface>(
        editor: &FlowEditor<S>,
        result: &LayoutResult,
        refresh: RefreshReport,
        layers: Option<LayerSet>,
    ) -> Self {
        let nodes = editor
            .surface()
            .nodes()
            .into_iter()
            .filter_map(|node| {
                let position = result.positions.get(&node.id)?;
                Some(NodeDump {
                    x: position.x,
                    y: position.y,
                    width: node.size.map(|s| s.width),
                    height: node.size.map(|s| s.height),
                    kind: node.kind,
                    id: node.id,
                })
            })
            .collect();
        let lines = editor.manager().lines().map(LineDump::from_line).collect();

        FlowDump {
            width: result.bounds.width(),
            height: result.bounds.height(),
            bounds: result.bounds,
            roots: result.roots.clone(),
            virtual_root: result.virtual_root,
            nodes,
            lines,
            layers,
            refresh,
            stats: editor.stats(),
        }
    }
}

/// Reads a flow document (`{nodes, edges}`). Strict JSON first, then JSON5.
pub fn parse_flow(input: &str) -> anyhow::Result<FlowSnapshot> {
    match serde_json::from_str(input) {
        Ok(flow) => Ok(flow),
        Err(json_err) => json5::from_str(input)
            .map_err(|err| anyhow::anyhow!("invalid flow document ({json_err}; json5: {err})")),
    }
}

/// One-shot pass used by the CLI and the WASM wrapper: lay the flow out,
/// refresh its preview lines and collect everything into a dump.
pub fn dump_flow(
    flow: FlowSnapshot,
    options: &LayoutOptions,
    config: &EngineConfig,
    with_layers: bool,
) -> FlowDump {
    let config = EngineConfig {
        optimizer: OptimizerConfig::immediate(),
        ..config.clone()
    };
    let mut editor = FlowEditor::new(MemoryCanvas::from(flow), config);
    let result = editor.layout(options);
    let refresh = editor.refresh_preview_lines(Default::default());
    let layers = with_layers.then(|| editor.layers());
    FlowDump::from_editor(&editor, &result, refresh, layers)
}

pub fn write_flow_dump(path: &Path, dump: &FlowDump) -> anyhow::Result<()> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, dump)?;
    Ok(())
}
