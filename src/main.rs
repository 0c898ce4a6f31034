use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::ThreadPoolBuilder;
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

use kmedoids_bandit::{
    generate_points, kmedoids_fit, DataLoader, DataMatrix, KMedoidsConfig, KMedoidsRun,
    Result as KMedoidsResult,
};

#[derive(Parser, Debug)]
#[command(name = "kmedoids-bandit")]
#[command(about = "Parallel bandit-guided k-medoids clustering", long_about = None)]
struct Args {
    /// Number of clusters (medoids)
    #[arg(short = 'k', long, default_value_t = 4)]
    clusters: usize,

    /// Number of points to generate when not using --input
    #[arg(short = 'n', long, default_value_t = 10_000)]
    points: usize,

    /// Dimensionality of points when generating
    #[arg(short, long, default_value_t = 2)]
    dim: usize,

    /// Maximum number of outer swap iterations
    #[arg(short, long, default_value_t = 1000)]
    iterations: usize,

    /// RNG seed
    #[arg(long, default_value_t = 42u64)]
    seed: u64,

    /// Input dataset (CSV or Parquet)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Explicitly specify the input file format (default: auto-detect from extension)
    #[arg(long, value_enum)]
    format: Option<InputFormat>,

    /// Output file for medoids and stats (JSON)
    #[arg(short, long, default_value = "kmedoids_result.json")]
    output: PathBuf,

    /// Optional file containing per-sample cluster assignments (CSV)
    #[arg(long)]
    assignments: Option<PathBuf>,

    /// Reference-batch size for build-phase sampling
    #[arg(long, default_value_t = 20)]
    build_batch_size: usize,

    /// Reference-batch size for swap-phase sampling
    #[arg(long, default_value_t = 100)]
    swap_batch_size: usize,

    /// Reference-batch size for the swap-phase sigma pass
    #[arg(long, default_value_t = 20)]
    sigma_batch_size: usize,

    /// Error probability for swap-phase confidence bounds (must be in (0, 1))
    #[arg(long, default_value_t = 1e-3)]
    swap_error_probability: f64,

    /// Save fitted model JSON
    #[arg(long)]
    save_model: Option<PathBuf>,

    /// Override Rayon global thread pool size
    #[arg(long)]
    threads: Option<usize>,

    /// Verbosity: set RUST_LOG style level (info, debug, warn)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum InputFormat {
    Csv,
    Parquet,
}

fn main() {
    let args = Args::parse();
    if let Err(err) = init_logging(&args.log_level) {
        eprintln!("failed to initialise logging: {err}");
    }

    if let Err(err) = run(args) {
        error!(error = %err, "kmedoids run failed");
        process::exit(1);
    }
}

fn init_logging(level: &str) -> Result<(), String> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(match level {
            "debug" => tracing::Level::DEBUG,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).map_err(|err| err.to_string())
}

fn run(args: Args) -> KMedoidsResult<()> {
    if let Some(threads) = args.threads {
        ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|err| {
                kmedoids_bandit::KMedoidsError::InvalidConfig(format!(
                    "failed to configure rayon threadpool: {err}"
                ))
            })?;
        info!(threads, "configured rayon global thread pool");
    }

    info!(
        clusters = args.clusters,
        max_swap_iterations = args.iterations,
        seed = args.seed,
        "starting k-medoids clustering"
    );

    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    let data = load_data(
        args.input.as_deref(),
        args.format,
        args.points,
        args.dim,
        &mut rng,
    )?;

    let config = KMedoidsConfig {
        clusters: args.clusters,
        max_swap_iterations: args.iterations,
        build_batch_size: args.build_batch_size,
        swap_batch_size: args.swap_batch_size,
        sigma_batch_size: args.sigma_batch_size,
        swap_error_probability: args.swap_error_probability,
    };

    let start = Instant::now();
    let run: KMedoidsRun = kmedoids_fit(&data, &config, &mut rng)?;
    let elapsed = start.elapsed();
    info!(
        loss = run.outcome.loss,
        swap_iterations = run.outcome.swap_iterations,
        converged = run.outcome.converged,
        took_seconds = elapsed.as_secs_f64(),
        "k-medoids clustering finished"
    );
    info!(?run.outcome.cluster_sizes, "cluster population counts");

    write_result(&args, &data, &run, elapsed.as_secs_f64(), args.seed)?;

    if let Some(path) = args.save_model.as_ref() {
        run.model.save_model(path)?;
        info!(path = ?path, "saved model snapshot");
    }

    if let Some(path) = args.assignments.as_ref() {
        write_assignments(path, &run)?;
    }

    Ok(())
}

fn load_data(
    input: Option<&Path>,
    format: Option<InputFormat>,
    points: usize,
    dim: usize,
    rng: &mut ChaCha8Rng,
) -> KMedoidsResult<DataMatrix> {
    if let Some(path) = input {
        let format_to_use =
            format.unwrap_or_else(|| infer_format(path).unwrap_or(InputFormat::Csv));
        info!(path = ?path, ?format_to_use, "loading input data");
        match format_to_use {
            InputFormat::Csv => DataLoader::load_csv(path),
            InputFormat::Parquet => DataLoader::load_parquet(path),
        }
    } else {
        if let Some(requested) = format {
            info!(
                ?requested,
                "ignoring --format because synthetic data will be generated"
            );
        }
        info!(points, dim, "generating synthetic uniform data");
        Ok(generate_points(points, dim, rng))
    }
}

fn infer_format(path: &Path) -> Option<InputFormat> {
    path.extension().and_then(|ext| ext.to_str()).map(|ext| {
        match ext.to_ascii_lowercase().as_str() {
            "parquet" | "pq" => InputFormat::Parquet,
            "csv" => InputFormat::Csv,
            _ => InputFormat::Csv,
        }
    })
}

fn write_result(
    args: &Args,
    data: &DataMatrix,
    run: &KMedoidsRun,
    elapsed_secs: f64,
    seed: u64,
) -> KMedoidsResult<()> {
    let medoids: Vec<Vec<f64>> = (0..run.model.medoids.nrows())
        .map(|row| run.model.medoids.row(row).to_vec())
        .collect();

    let dump = json!({
        "clusters": run.model.medoid_indices.len(),
        "dim": data.ncols(),
        "rows": data.nrows(),
        "loss": run.outcome.loss,
        "swap_iterations": run.outcome.swap_iterations,
        "converged": run.outcome.converged,
        "cluster_sizes": run.outcome.cluster_sizes,
        "medoid_indices": run.model.medoid_indices,
        "medoids": medoids,
        "seed": seed,
        "elapsed_seconds": elapsed_secs,
        "telemetry": run.outcome.telemetry,
        "config": {
            "max_swap_iterations": run.model.config.max_swap_iterations,
            "build_batch_size": run.model.config.build_batch_size,
            "swap_batch_size": run.model.config.swap_batch_size,
            "sigma_batch_size": run.model.config.sigma_batch_size,
            "swap_error_probability": run.model.config.swap_error_probability,
        },
        "data_source": if let Some(path) = args.input.as_ref() {
            let fmt = args
                .format
                .or_else(|| infer_format(path))
                .unwrap_or(InputFormat::Csv);
            json!({
                "type": "file",
                "path": path.display().to_string(),
                "format": format!("{fmt:?}").to_lowercase(),
            })
        } else {
            json!({
                "type": "synthetic",
                "points": args.points,
                "dim": args.dim,
            })
        },
        "assignments_path": args.assignments.as_ref().map(|p| p.display().to_string()),
    });

    std::fs::write(&args.output, serde_json::to_string_pretty(&dump)?)?;
    info!(path = ?args.output, "wrote clustering summary");
    Ok(())
}

fn write_assignments(path: &Path, run: &KMedoidsRun) -> KMedoidsResult<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["index", "cluster"])?;
    for (idx, cluster) in run.outcome.assignments.iter().enumerate() {
        writer.write_record([idx.to_string(), cluster.to_string()])?;
    }
    writer.flush()?;
    info!(path = ?path, "wrote assignments CSV");
    Ok(())
}
