use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use gfs_stage::app::{
    App, BoundsOverride, FetchOptions, FetchResult, InitRequest, InitResult, ProgressSink,
    parse_start_date,
};
use gfs_stage::config::DEFAULT_CONFIG_NAME;
use gfs_stage::cycle::{DEFAULT_MAX_RETREATS, ResolverOptions};
use gfs_stage::domain::{Cycle, Resolution, ValidHours};
use gfs_stage::error::StageError;
use gfs_stage::gfs::GfsHttpClient;
use gfs_stage::grid::{Center, SquareMode, derive_grid, square_corners};
use gfs_stage::output::{JsonOutput, LogSink, OutputMode};
use gfs_stage::retriever::{DEFAULT_MAX_ATTEMPTS, RetryPolicy};
use gfs_stage::scheduler::{DEFAULT_MAX_PARALLEL, SchedulerOptions};
use gfs_stage::validator::{ValidatorStatus, Wgrib2Validator};

#[derive(Parser)]
#[command(name = "gfs-stage")]
#[command(about = "Resolve the latest published GFS cycle and stage its forecast files")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true, help = "Print results as JSON on stdout")]
    json: bool,

    #[arg(long, global = true, default_value = DEFAULT_CONFIG_NAME, help = "Run config file")]
    config: Utf8PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Write a run config for a new case")]
    Init(InitArgs),
    #[command(about = "Resolve the cycle and retrieve every lead time")]
    Fetch(FetchArgs),
    #[command(about = "Print the nested grid derived from a domain")]
    Grid(GridArgs),
    #[command(about = "Print the corners of a square around a point")]
    Corners(CornersArgs),
}

#[derive(Args, Clone)]
struct DomainArgs {
    #[arg(long, allow_negative_numbers = true)]
    lat: f64,

    #[arg(long, allow_negative_numbers = true)]
    lon: f64,

    #[arg(long, help = "Radius in km")]
    radius: f64,
}

#[derive(Args, Clone)]
struct InitArgs {
    #[command(flatten)]
    domain: DomainArgs,

    #[arg(long, help = "Forecast length in days; the full horizon when omitted")]
    days: Option<f64>,

    #[arg(long)]
    case_name: String,

    #[arg(long, help = "Staging root")]
    dest: Option<Utf8PathBuf>,

    #[arg(long, help = "Run start, YYYY-MM-DDTHH:MM (UTC)")]
    start_date: Option<String>,

    #[arg(long, default_value_t = 3)]
    interval_hours: u32,

    #[arg(long, value_enum, default_value = "fine")]
    resolution: Resolution,

    #[arg(long, default_value = "00|06|12|18")]
    valid_hours: ValidHours,

    #[arg(long)]
    geog_data: Option<String>,

    #[arg(long, default_value = "auto", help = "auto or YYYYMMDDHH")]
    cycle: String,

    #[arg(long, help = "Continue straight into fetch")]
    fetch: bool,
}

#[derive(Args, Clone)]
struct FetchArgs {
    #[arg(long, help = "Start the search from this cycle instead of the latest one")]
    cycle: Option<Cycle>,

    #[arg(long, help = "Resolve and plan, but do not persist or download")]
    dry_run: bool,

    #[arg(long, value_enum)]
    resolution: Option<Resolution>,

    #[arg(long, allow_negative_numbers = true)]
    top: Option<f64>,

    #[arg(long, allow_negative_numbers = true)]
    bottom: Option<f64>,

    #[arg(long, allow_negative_numbers = true)]
    left: Option<f64>,

    #[arg(long, allow_negative_numbers = true)]
    right: Option<f64>,

    #[arg(long, help = "Cycle hours treated as published, e.g. 00|12")]
    valid_hours: Option<ValidHours>,

    #[arg(long, short = 'j', default_value_t = DEFAULT_MAX_PARALLEL, help = "Concurrent downloads")]
    parallel: usize,

    #[arg(long, help = "Staging root; overrides WRF_DEST from the config")]
    dest: Option<Utf8PathBuf>,

    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    #[arg(long, default_value_t = 60, help = "Seconds between attempts")]
    retry_interval: u64,

    #[arg(long, help = "Wall-clock seconds a task may spend retrying")]
    retry_budget: Option<u64>,

    #[arg(long, default_value_t = DEFAULT_MAX_RETREATS)]
    max_retreats: u32,

    #[arg(long, help = "Run after a successful fetch as <cmd> <config> <manifest>")]
    handoff_command: Option<String>,
}

impl FetchArgs {
    fn into_options(self, config_path: Utf8PathBuf) -> FetchOptions {
        FetchOptions {
            cycle: self.cycle,
            dry_run: self.dry_run,
            resolution: self.resolution,
            bounds: BoundsOverride {
                top: self.top,
                bottom: self.bottom,
                left: self.left,
                right: self.right,
            },
            valid_hours: self.valid_hours,
            dest_root: self.dest,
            scheduler: SchedulerOptions {
                max_parallel: self.parallel.max(1),
                dry_run: self.dry_run,
            },
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                interval: Duration::from_secs(self.retry_interval),
                budget: self.retry_budget.map(Duration::from_secs),
            },
            resolver: ResolverOptions {
                max_retreats: self.max_retreats,
                ..ResolverOptions::default()
            },
            handoff_command: self.handoff_command,
            ..FetchOptions::new(config_path)
        }
    }
}

#[derive(Args, Clone)]
struct GridArgs {
    #[command(flatten)]
    domain: DomainArgs,

    #[arg(long, value_enum, default_value = "fine")]
    resolution: Resolution,
}

#[derive(Args, Clone)]
struct CornersArgs {
    #[command(flatten)]
    domain: DomainArgs,

    #[arg(long, value_enum, default_value = "halfside")]
    mode: SquareMode,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            match report.downcast_ref::<StageError>() {
                Some(error) => ExitCode::from(map_exit_code(error)),
                None => ExitCode::from(1),
            }
        }
    }
}

fn map_exit_code(error: &StageError) -> u8 {
    match error {
        StageError::CycleUnavailable { .. } => 2,
        error if error.is_config_error() => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    match cli.command {
        Commands::Init(args) => run_init(args, cli.config, output_mode),
        Commands::Fetch(args) => {
            let app = App::new(GfsHttpClient::new()?, Wgrib2Validator::new());
            run_fetch(&app, args.into_options(cli.config), output_mode)
        }
        Commands::Grid(args) => run_grid(args, output_mode),
        Commands::Corners(args) => run_corners(args, output_mode),
    }
}

fn sink(output_mode: OutputMode) -> &'static dyn ProgressSink {
    match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Human => &LogSink,
    }
}

fn run_init(args: InitArgs, config: Utf8PathBuf, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let cycle = match args.cycle.trim() {
        "" | "auto" => None,
        value => Some(value.parse::<Cycle>()?),
    };
    let start_date = args.start_date.as_deref().map(parse_start_date).transpose()?;
    let request = InitRequest {
        config_path: config.clone(),
        lat: args.domain.lat,
        lon: args.domain.lon,
        radius_km: args.domain.radius,
        forecast_days: args.days,
        case_name: args.case_name,
        dest_root: args.dest,
        start_date,
        interval_hours: args.interval_hours,
        resolution: args.resolution,
        valid_hours: args.valid_hours,
        geog_data_path: args.geog_data,
        cycle,
        now: None,
    };

    let app = App::new(GfsHttpClient::new()?, Wgrib2Validator::new());
    let result = app.init(request, sink(output_mode))?;
    match output_mode {
        OutputMode::Json if !args.fetch => JsonOutput::print_init(&result).into_diagnostic()?,
        OutputMode::Json => {}
        OutputMode::Human => print_init_summary(&result),
    }

    if args.fetch {
        let mut options = FetchOptions::new(config);
        options.cycle = Some(result.cycle);
        return run_fetch(&app, options, output_mode);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_fetch(
    app: &App<GfsHttpClient, Wgrib2Validator>,
    options: FetchOptions,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let result = app.fetch(options, sink(output_mode))?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_fetch(&result).into_diagnostic()?,
        OutputMode::Human => print_fetch_summary(&result),
    }
    if result.success {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}

fn run_grid(args: GridArgs, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let center = Center::new(args.domain.lat, args.domain.lon)?;
    let grid = derive_grid(center, args.domain.radius, args.resolution)?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_grid(&grid).into_diagnostic()?,
        OutputMode::Human => {
            println!(
                "resolution     {} ({} km/pixel)",
                args.resolution.product(),
                args.resolution.km_per_pixel()
            );
            for (name, level) in [("d01", grid.outer), ("d02", grid.inner)] {
                println!(
                    "{name}            {} km, dx {} m, {} x {} points",
                    level.size_km, level.spacing_m, level.points, level.points
                );
            }
            println!("parent start   i={0} j={0}", grid.parent_start);
            println!("truelat1/2     {} / {}", grid.truelat1, grid.truelat2);
            println!("stand_lon      {}", grid.stand_lon);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_corners(args: CornersArgs, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let center = Center::new(args.domain.lat, args.domain.lon)?;
    let square = square_corners(center, args.domain.radius, args.mode)?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_corners(&square).into_diagnostic()?,
        OutputMode::Human => {
            println!(
                "side {:.3} km, diagonal {:.3} km",
                square.side_km, square.diagonal_km
            );
            println!(
                "{:<4} {:>10} {:>10} {:>9} {:>10} {:>11} {:>12}",
                "", "east_km", "north_km", "bearing", "dist_km", "lat", "lon"
            );
            for corner in &square.corners {
                println!(
                    "{:<4} {:>10.3} {:>10.3} {:>9.3} {:>10.3} {:>11.6} {:>12.6}",
                    corner.name,
                    corner.east_km,
                    corner.north_km,
                    corner.bearing_deg,
                    corner.distance_km,
                    corner.lat,
                    corner.lon
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_init_summary(result: &InitResult) {
    let cyan = "\x1b[36m";
    let green = "\x1b[32m";
    let reset = "\x1b[0m";
    let bounds = result.domain.padded;

    println!("{cyan}gfs-stage init{reset}");
    println!("{green}config:   {}{reset}", result.config_path);
    println!("case:     {}", result.area);
    println!("cycle:    {}", result.cycle);
    println!(
        "box:      top {:.4} bottom {:.4} left {:.4} right {:.4}",
        bounds.top, bounds.bottom, bounds.left, bounds.right
    );
    println!(
        "grid:     d01 {} pts @ {} m, d02 {} pts @ {} m",
        result.grid.outer.points,
        result.grid.outer.spacing_m,
        result.grid.inner.points,
        result.grid.inner.spacing_m
    );
    println!("run:      {} -> {}", result.range.start, result.range.end);
}

fn print_fetch_summary(result: &FetchResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}gfs-stage summary{reset}");
    println!(
        "cycle {} (requested {}, {} retreats), area {}, {}",
        result.resolved.cycle,
        result.resolved.requested,
        result.resolved.retreats,
        result.area,
        result.resolution.product()
    );
    if let ValidatorStatus::Degraded { message } = &result.validator {
        println!("{yellow}validator degraded: {message}{reset}");
    }

    if result.dry_run {
        let hours: Vec<String> = result.planned.iter().map(|hour| format!("f{hour:03}")).collect();
        println!("{yellow}dry run: {} lead times planned{reset}", hours.len());
        println!("{}", hours.join(" "));
        return;
    }

    println!("total files: {}", result.total_files);
    println!("{green}cached: {}  downloaded: {}{reset}", result.counts.cached, result.counts.ok);
    if !result.failures.is_empty() {
        println!("{red}failed: {}{reset}", result.failures.len());
    }
    println!("total size: {}", result.total_size);
    println!("elapsed: {:.1} s", result.elapsed_secs);
    if let Some(log) = &result.audit_log {
        println!("audit log: {log}");
    }
    if let Some(manifest) = &result.manifest {
        println!("manifest: {manifest}");
    }
    if result.success {
        println!("{green}SUCCESS{reset}");
    } else {
        println!("{red}WITH ERRORS{reset}");
    }
}
