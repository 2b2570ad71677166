use flowline::config::{EngineConfig, parse_config};
use flowline::layout::LayoutOptions;
use flowline::layout_dump::{dump_flow, parse_flow};
use serde::Deserialize;
use wasm_bindgen::prelude::*;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlowLayoutOptions {
    #[serde(default)]
    layout: LayoutOptions,
    /// Inline engine config, same shape as the CLI's config file.
    config: Option<serde_json::Value>,
    #[serde(default)]
    layers: bool,
}

fn build_config(options: &FlowLayoutOptions) -> Result<EngineConfig, String> {
    match &options.config {
        Some(raw) => parse_config(&raw.to_string()).map_err(|error| error.to_string()),
        None => Ok(EngineConfig::default()),
    }
}

fn layout_flow(input: &str, options_json: Option<&str>) -> Result<String, String> {
    let options = match options_json {
        Some(raw) => serde_json::from_str::<FlowLayoutOptions>(raw).map_err(|error| error.to_string())?,
        None => FlowLayoutOptions::default(),
    };
    let config = build_config(&options)?;
    let flow = parse_flow(input).map_err(|error| error.to_string())?;
    let dump = dump_flow(flow, &options.layout, &config, options.layers);
    serde_json::to_string(&dump).map_err(|error| error.to_string())
}

#[wasm_bindgen]
pub fn layout_flow_json(input: &str, options_json: Option<String>) -> Result<String, JsValue> {
    layout_flow(input, options_json.as_deref()).map_err(|error| JsValue::from_str(&error))
}
