use std::io::Write;

use clap::Parser;
use formats::MetricSelection;
use tools::{BenchError, BenchScript, load_config, load_network, run_session};
use tracing_subscriber::EnvFilter;

/// Replay a scripted pan/zoom/metric session against an in-memory surface.
#[derive(Parser, Debug)]
#[command(name = "overlay-bench", version, about, long_about = None)]
struct Cli {
    /// Road-network GeoJSON FeatureCollection.
    #[arg(long)]
    input: String,
    /// Initial metric, optionally with a radius (`choice@r800`).
    #[arg(long, default_value = "choice")]
    metric: String,
    /// Further metrics cycled through on each switch.
    #[arg(long = "switch-to", value_delimiter = ',')]
    switch_to: Vec<String>,
    #[arg(long, default_value_t = 600)]
    frames: u32,
    #[arg(long, default_value_t = 16.0)]
    frame_ms: f64,
    #[arg(long, default_value_t = 90)]
    pan_every: u32,
    #[arg(long, default_value_t = 20)]
    drag_frames: u32,
    #[arg(long, default_value_t = 150)]
    switch_every: u32,
    /// Make every n-th surface handle fail.
    #[arg(long)]
    fail_every: Option<u32>,
    /// Surface without batch calls.
    #[arg(long)]
    single_only: bool,
    /// Overlay config JSON; defaults apply to missing fields.
    #[arg(long)]
    config: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = real_main() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn real_main() -> Result<(), BenchError> {
    let cli = Cli::parse();

    let mut metrics = vec![MetricSelection::parse(&cli.metric)?];
    for m in &cli.switch_to {
        metrics.push(MetricSelection::parse(m)?);
    }

    let network = load_network(&cli.input)?;
    let config = load_config(cli.config.as_deref())?;
    let script = BenchScript {
        frames: cli.frames,
        frame_ms: cli.frame_ms,
        pan_every: cli.pan_every,
        drag_frames: cli.drag_frames,
        switch_every: cli.switch_every,
        metrics,
        fail_every: cli.fail_every,
        single_only: cli.single_only,
    };

    let summary = run_session(&network, config, &script)?;
    let payload = serde_json::to_string_pretty(&summary)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{payload}").map_err(|source| BenchError::Io {
        path: "<stdout>".to_string(),
        source,
    })?;
    Ok(())
}
