use crate::config::load_config;
use crate::layout::LayoutOptions;
use crate::layout_dump::{dump_flow, parse_flow, write_flow_dump};
use anyhow::Result;
use clap::Parser;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "flowline",
    version,
    about = "Lay out a flow document and attach preview lines to its open branches"
)]
pub struct Args {
    /// Input flow (.json/.json5) or '-' for stdin
    #[arg(short = 'i', long = "input")]
    pub input: Option<PathBuf>,

    /// Output JSON file. Defaults to stdout if omitted.
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Config JSON file (layout, preview, sync, optimizer sections)
    #[arg(short = 'c', long = "configFile")]
    pub config: Option<PathBuf>,

    /// Include the topology layers in the output
    #[arg(long = "layers")]
    pub layers: bool,

    /// Canvas height used for vertical centering
    #[arg(short = 'H', long = "height")]
    pub height: Option<f32>,

    /// Horizontal spread factor
    #[arg(long = "spreadX")]
    pub spread_x: Option<f32>,

    /// Vertical spread factor
    #[arg(long = "spreadY")]
    pub spread_y: Option<f32>,
}

pub fn run() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    let input = read_input(args.input.as_deref())?;
    let flow = parse_flow(&input)?;
    if flow.nodes.is_empty() {
        tracing::warn!("flow document has no nodes");
    }

    let options = LayoutOptions {
        canvas_height: args.height,
        spread_x: args.spread_x,
        spread_y: args.spread_y,
        ..LayoutOptions::default()
    };
    let dump = dump_flow(flow, &options, &config, args.layers);

    match args.output.as_deref() {
        Some(path) => write_flow_dump(path, &dump)?,
        None => println!("{}", serde_json::to_string_pretty(&dump)?),
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // already installed when embedded
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn read_input(path: Option<&Path>) -> Result<String> {
    if let Some(path) = path
        && path != Path::new("-")
    {
        return Ok(std::fs::read_to_string(path)?);
    }
    let mut buf = String::new();
    io::stdin().read_to_string(&mut buf)?;
    Ok(buf)
}
