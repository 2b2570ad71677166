use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    pub default_node_width: f32,
    pub default_node_height: f32,
    pub min_node_width: f32,
    pub min_node_height: f32,
    pub col_spacing: f32,
    pub lane_gap: f32,
    pub column_pad: f32,
    pub lane_pad: f32,
    pub col_scale: f32,
    pub lane_scale: f32,
    pub spread_x: f32,
    pub spread_y: f32,
    pub expand_x: f32,
    pub start_x: f32,
    /// `None` derives the start from the canvas height.
    pub start_y: Option<f32>,
    pub start_y_min: f32,
    pub start_y_canvas_ratio: f32,
    pub canvas_width: f32,
    pub canvas_height: f32,
    pub min_top_margin: f32,
    pub min_coordinate: f32,
    pub recenter: bool,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            default_node_width: 120.0,
            default_node_height: 60.0,
            min_node_width: 40.0,
            min_node_height: 30.0,
            col_spacing: 280.0,
            lane_gap: 240.0,
            column_pad: 160.0,
            lane_pad: 120.0,
            col_scale: 6.0,
            lane_scale: 6.0,
            spread_x: 1.0,
            spread_y: 1.0,
            expand_x: 0.0,
            start_x: 120.0,
            start_y: None,
            start_y_min: 120.0,
            start_y_canvas_ratio: 0.3,
            canvas_width: 1200.0,
            canvas_height: 800.0,
            min_top_margin: 80.0,
            min_coordinate: 20.0,
            recenter: true,
        }
    }
}

impl LayoutConfig {
    /// Vertical start offset: the configured value, else a share of the
    /// canvas height no smaller than `start_y_min`.
    pub fn derived_start_y(&self, canvas_height: f32) -> f32 {
        self.start_y
            .unwrap_or_else(|| self.start_y_min.max(canvas_height * self.start_y_canvas_ratio))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    /// Distance below the out-port where a floating preview ends.
    pub preview_length: f32,
    pub branch_spacing_ratio: f32,
    pub branch_spacing_min: f32,
    pub branch_spacing_max: f32,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            preview_length: 100.0,
            branch_spacing_ratio: 0.8,
            branch_spacing_min: 60.0,
            branch_spacing_max: 120.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub drift_threshold: f32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            drift_threshold: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub enable_deferred: bool,
    pub initial_delay_ms: u64,
    pub enable_batching: bool,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub enable_cache: bool,
    pub cache_ttl_ms: u64,
    pub enable_throttling: bool,
    pub throttle_window_ms: u64,
    pub max_updates_per_window: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enable_deferred: true,
            initial_delay_ms: 300,
            enable_batching: true,
            batch_size: 20,
            batch_delay_ms: 50,
            enable_cache: true,
            cache_ttl_ms: 5000,
            enable_throttling: true,
            throttle_window_ms: 100,
            max_updates_per_window: 3,
        }
    }
}

impl OptimizerConfig {
    /// Runs every request inline: no warm-up, no batching, no cache, no throttle.
    pub fn immediate() -> Self {
        Self {
            enable_deferred: false,
            enable_batching: false,
            enable_cache: false,
            enable_throttling: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub layout: LayoutConfig,
    pub preview: PreviewConfig,
    pub sync: SyncConfig,
    pub optimizer: OptimizerConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    layout: Option<LayoutConfigFile>,
    preview: Option<PreviewConfigFile>,
    sync: Option<SyncConfigFile>,
    optimizer: Option<OptimizerConfigFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutConfigFile {
    default_node_width: Option<f32>,
    default_node_height: Option<f32>,
    col_spacing: Option<f32>,
    lane_gap: Option<f32>,
    col_scale: Option<f32>,
    lane_scale: Option<f32>,
    spread_x: Option<f32>,
    spread_y: Option<f32>,
    expand_x: Option<f32>,
    start_x: Option<f32>,
    start_y: Option<f32>,
    canvas_width: Option<f32>,
    canvas_height: Option<f32>,
    min_top_margin: Option<f32>,
    min_coordinate: Option<f32>,
    recenter: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviewConfigFile {
    preview_length: Option<f32>,
    branch_spacing_ratio: Option<f32>,
    branch_spacing_min: Option<f32>,
    branch_spacing_max: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncConfigFile {
    drift_threshold: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptimizerConfigFile {
    enable_deferred: Option<bool>,
    initial_delay_ms: Option<u64>,
    enable_batching: Option<bool>,
    batch_size: Option<usize>,
    batch_delay_ms: Option<u64>,
    enable_cache: Option<bool>,
    cache_ttl_ms: Option<u64>,
    enable_throttling: Option<bool>,
    throttle_window_ms: Option<u64>,
    max_updates_per_window: Option<usize>,
}

macro_rules! overlay {
    ($target:expr, $source:expr, [$($field:ident),* $(,)?]) => {
        $(
            if let Some(v) = $source.$field {
                $target.$field = v;
            }
        )*
    };
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parses strict JSON first and falls back to JSON5 (comments, trailing commas).
pub fn parse_config(contents: &str) -> anyhow::Result<EngineConfig> {
    let parsed: ConfigFile = match serde_json::from_str(contents) {
        Ok(parsed) => parsed,
        Err(json_err) => json5::from_str(contents)
            .map_err(|err| anyhow::anyhow!("invalid config ({json_err}; json5: {err})"))?,
    };

    let mut config = EngineConfig::default();
    if let Some(layout) = parsed.layout {
        overlay!(
            config.layout,
            layout,
            [
                default_node_width,
                default_node_height,
                col_spacing,
                lane_gap,
                col_scale,
                lane_scale,
                spread_x,
                spread_y,
                expand_x,
                start_x,
                canvas_width,
                canvas_height,
                min_top_margin,
                min_coordinate,
                recenter,
            ]
        );
        if layout.start_y.is_some() {
            config.layout.start_y = layout.start_y;
        }
    }
    if let Some(preview) = parsed.preview {
        overlay!(
            config.preview,
            preview,
            [
                preview_length,
                branch_spacing_ratio,
                branch_spacing_min,
                branch_spacing_max,
            ]
        );
    }
    if let Some(sync) = parsed.sync {
        overlay!(config.sync, sync, [drift_threshold]);
    }
    if let Some(optimizer) = parsed.optimizer {
        overlay!(
            config.optimizer,
            optimizer,
            [
                enable_deferred,
                initial_delay_ms,
                enable_batching,
                batch_size,
                batch_delay_ms,
                enable_cache,
                cache_ttl_ms,
                enable_throttling,
                throttle_window_ms,
                max_updates_per_window,
            ]
        );
    }
    Ok(config)
}
