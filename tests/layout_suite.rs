use std::path::Path;
use std::rc::Rc;

use flowline::config::OptimizerConfig;
use flowline::events::{EngineEvent, RecordingSink};
use flowline::layout::validate_layers;
use flowline::layout_dump::parse_flow;
use flowline::optimizer::ManualClock;
use flowline::{
    CanvasSurface, EngineConfig, FlowEditor, FlowSnapshot, LayoutOptions, LayoutResult, MemoryCanvas,
};

fn load_fixture(name: &str) -> FlowSnapshot {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name);
    assert!(path.exists(), "fixture missing: {name}");
    let input = std::fs::read_to_string(&path).expect("fixture read failed");
    parse_flow(&input).expect("fixture parse failed")
}

fn editor_for(name: &str) -> (FlowEditor<MemoryCanvas>, RecordingSink) {
    let sink = RecordingSink::new();
    let config = EngineConfig {
        optimizer: OptimizerConfig::immediate(),
        ..EngineConfig::default()
    };
    let editor = FlowEditor::with_runtime(
        MemoryCanvas::from(load_fixture(name)),
        config,
        Rc::new(ManualClock::new()),
        Rc::new(sink.clone()),
    );
    (editor, sink)
}

fn assert_sane_layout(result: &LayoutResult, fixture: &str) {
    for (id, p) in &result.positions {
        assert!(p.is_finite(), "{fixture}: {id} has non-finite position");
        assert!(p.x >= 20.0 && p.y >= 20.0, "{fixture}: {id} escaped the margin");
    }
}

#[test]
fn lay_out_all_fixtures() {
    // Keep this list explicit so new fixtures must be added intentionally.
    let candidates = [
        "linear.json",
        "branching.json",
        "cycle.json",
        "multi_root.json",
        "persisted_lines.json",
        "malformed.json",
    ];

    for name in candidates {
        let (mut editor, _) = editor_for(name);
        let result = editor.layout(&LayoutOptions::default());
        assert!(!result.is_empty(), "{name}: empty layout");
        assert_sane_layout(&result, name);

        let snapshot = editor.surface().snapshot();
        let layers = editor.layers();
        assert!(
            validate_layers(&layers, &snapshot.nodes).is_ok(),
            "{name}: invalid layers"
        );
        assert!(
            editor.manager().invariant_violations(&snapshot).is_empty(),
            "{name}: branch invariant broken"
        );
    }
}

#[test]
fn linear_flow_is_one_row() {
    let (mut editor, _) = editor_for("linear.json");
    let result = editor.layout(&LayoutOptions::default());
    let order = ["start", "wait", "send", "end"];
    let ys: Vec<f32> = order.iter().map(|id| result.positions[*id].y).collect();
    assert!(ys.windows(2).all(|w| w[0] == w[1]));
    let xs: Vec<f32> = order.iter().map(|id| result.positions[*id].x).collect();
    assert!(xs.windows(2).all(|w| w[0] < w[1]));

    assert_eq!(editor.layers().len(), 4);
    let stats = editor.stats();
    assert_eq!(stats.total_lines, 3);
    assert_eq!(stats.preview_lines, 0);
}

#[test]
fn branches_follow_port_order() {
    let (mut editor, _) = editor_for("branching.json");
    let result = editor.layout(&LayoutOptions::default());
    assert!(result.positions["A"].y < result.positions["B"].y);

    let stats = editor.stats();
    // start, yes, no, maybe, A, B
    assert_eq!(stats.total_lines, 6);
    assert_eq!(stats.preview_lines, 3);
    let maybe = editor
        .manager()
        .lines_for_node("split")
        .find(|l| l.key.branch_id.as_str() == "maybe")
        .expect("maybe branch line");
    assert!(maybe.is_preview());
}

#[test]
fn cycles_and_multiple_roots_still_lay_out() {
    let (mut editor, _) = editor_for("cycle.json");
    let result = editor.layout(&LayoutOptions::default());
    assert_eq!(result.positions.len(), 3);
    assert_eq!(editor.manager().preview_count("B"), 1);
    assert_eq!(editor.manager().connection_count("B"), 1);

    let (mut editor, _) = editor_for("multi_root.json");
    let result = editor.layout(&LayoutOptions::default());
    assert!(result.virtual_root);
    assert_eq!(result.roots, vec!["r1".to_string(), "r2".to_string()]);
}

#[test]
fn persisted_previews_are_adopted_or_dropped() {
    let (mut editor, _) = editor_for("persisted_lines.json");
    editor.layout(&LayoutOptions::default());
    let adopted = editor.manager().line("old_preview").expect("adopted preview");
    assert!(adopted.is_preview());
    assert_ne!(adopted.end_point(), flowline::Point::new(10.0, 10.0));

    let previews: Vec<String> = editor
        .surface()
        .preview_edges()
        .map(|e| e.id.clone())
        .collect();
    assert!(previews.contains(&"old_preview".to_string()));
    assert!(!previews.contains(&"ghost_preview".to_string()));
    assert_eq!(editor.manager().connection_count("S"), 1);
}

#[test]
fn malformed_items_are_skipped_and_reported() {
    let (mut editor, sink) = editor_for("malformed.json");
    let result = editor.layout(&LayoutOptions::default());
    assert_eq!(result.positions.len(), 2);
    assert!(sink.count(|e| matches!(e, EngineEvent::ValidationSkipped { .. })) >= 2);
    assert_eq!(editor.manager().preview_count("A"), 1);
}

#[test]
fn layout_is_deterministic() {
    let (mut first, _) = editor_for("branching.json");
    let (mut second, _) = editor_for("branching.json");
    let options = LayoutOptions {
        spread_x: Some(1.25),
        expand_x: Some(30.0),
        ..LayoutOptions::default()
    };
    assert_eq!(first.layout(&options), second.layout(&options));
}
