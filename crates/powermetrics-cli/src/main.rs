use facet::Facet;
use figue as args;
use powermetrics::PowerMetricsConfig;
use std::num::NonZeroUsize;
use std::time::Duration;

#[cfg(target_os = "macos")]
mod live;
#[cfg(target_os = "macos")]
use live::sample_loop;

const BURN_THREAD_NAME: &str = "powermetrics-burn";

#[derive(Facet, Debug)]
pub(crate) struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    /// Number of sampling passes; power needs at least two.
    #[facet(args::named, default)]
    pub(crate) count: Option<usize>,
    /// Milliseconds between passes.
    #[facet(args::named, default)]
    interval_ms: Option<u64>,
    /// Walk every thread's stack.
    #[facet(args::named, default)]
    stacks: bool,
    #[facet(args::named, default)]
    no_queue_labels: bool,
    #[facet(args::named, default)]
    max_frames: Option<usize>,
    /// Include per-core CPU usage deltas.
    #[facet(args::named, default)]
    pub(crate) cpu: bool,
    /// Spin a busy worker thread so there is something to measure.
    #[facet(args::named, default)]
    burn: bool,
    /// Print the full per-thread report of each pass, not just power.
    #[facet(args::named, default)]
    pub(crate) report: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cli = parse_cli()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config_from_cli(&cli)?;
    if cli.burn {
        spawn_burner()?;
    }
    sample_loop(&cli, config)
}

fn parse_cli() -> Result<Cli, String> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("powermetrics")
                .description("per-thread CPU power of this process, split by core class")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();
    let cli = args::Driver::new(figue_config)
        .run()
        .into_result()
        .map_err(|e| e.to_string())?;
    Ok(cli.value)
}

/// Environment first, flags on top.
fn config_from_cli(cli: &Cli) -> Result<PowerMetricsConfig, String> {
    let mut config = PowerMetricsConfig::from_env().map_err(|e| e.to_string())?;
    if let Some(interval_ms) = cli.interval_ms {
        if interval_ms == 0 {
            return Err("--interval-ms must be positive".to_string());
        }
        config.sampling_interval = Duration::from_millis(interval_ms);
    }
    if let Some(max_frames) = cli.max_frames {
        config.max_frame_depth =
            NonZeroUsize::new(max_frames).ok_or("--max-frames must be positive")?;
    }
    if cli.stacks {
        config.capture_stacks = true;
    }
    if cli.no_queue_labels {
        config.capture_queue_labels = false;
    }
    Ok(config)
}

fn spawn_burner() -> Result<(), String> {
    std::thread::Builder::new()
        .name(BURN_THREAD_NAME.to_string())
        .spawn(|| {
            let mut x = 0u64;
            loop {
                x = std::hint::black_box(x.wrapping_mul(6364136223846793005).wrapping_add(1));
            }
        })
        .map(|_| ())
        .map_err(|e| format!("failed to spawn {BURN_THREAD_NAME}: {e}"))
}

#[cfg(not(target_os = "macos"))]
fn sample_loop(_cli: &Cli, _config: PowerMetricsConfig) -> Result<(), String> {
    Err(powermetrics::SampleError::UnsupportedPlatform {
        target_os: std::env::consts::OS,
    }
    .to_string())
}
