//! Strength-test driver: run an EPD suite under a fixed move time and score
//! the engine's choices against the expected (`bm`) and avoided (`am`)
//! moves.

mod epd;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use mcts::{SearchParams, SearchSignals, SearchWorker, SilentSink, UniformEvaluator};
use position::Move;
use prediction_cache::PredictionCache;

use crate::epd::StrengthTestSpec;

#[derive(Parser, Debug)]
#[command(name = "chesscoach-strength-test")]
#[command(about = "Run an EPD strength test against the engine")]
struct Args {
    /// EPD file with one test position per line
    epd_path: std::path::PathBuf,

    /// Time per position in milliseconds
    #[arg(long, default_value_t = 1000)]
    move_time_ms: u64,

    /// Batch slots sharing the search tree
    #[arg(long, default_value_t = 256)]
    parallelism: usize,

    /// Prediction cache size in MiB
    #[arg(long, default_value_t = 256)]
    cache_mib: u64,

    /// Optional linear rating estimate: slope * score/positions + intercept
    #[arg(long, requires = "rating_intercept")]
    rating_slope: Option<f32>,

    #[arg(long, requires = "rating_slope")]
    rating_intercept: Option<f32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let text = std::fs::read_to_string(&args.epd_path)
        .with_context(|| format!("reading {}", args.epd_path.display()))?;
    let specs = epd::parse_epd(&text)?;
    info!(
        positions = specs.len(),
        move_time_ms = args.move_time_ms,
        "strength test starting"
    );

    let cache = Arc::new(PredictionCache::new());
    cache.allocate(args.cache_mib)?;
    // Clear between suites for comparable results.
    cache.clear();

    let params = SearchParams {
        parallelism: args.parallelism,
        ..SearchParams::default()
    };
    let mut worker = SearchWorker::new(
        params,
        cache,
        Arc::new(SearchSignals::new()),
        Box::new(SilentSink),
        1,
    );
    let evaluator = UniformEvaluator::new();

    let mut score = 0i32;
    let mut total = 0i32;
    for (index, spec) in specs.iter().enumerate() {
        worker
            .set_position(Some(&spec.fen), &[], true)
            .with_context(|| format!("installing position {}", index + 1))?;
        let played = worker
            .run_timed_search(&evaluator, args.move_time_ms)
            .context("searching test position")?
            .context("search produced no move")?;

        let points = judge(&worker, spec, &played)?;
        score += points;
        total += spec.achievable();

        let played_uci = worker.game(0).position().to_uci(&played);
        info!(
            position = index + 1,
            id = spec.id.as_deref().unwrap_or("-"),
            played = %played_uci,
            points,
            achievable = spec.achievable(),
            "position judged"
        );
    }

    println!("score {score} / {total} over {} positions", specs.len());
    if let (Some(slope), Some(intercept)) = (args.rating_slope, args.rating_intercept) {
        let rating = slope * score as f32 / specs.len().max(1) as f32 + intercept;
        println!("estimated rating {rating:.0}");
    }
    Ok(())
}

/// Score the played move: any `am` match is zero, otherwise the matched
/// `bm`'s points, otherwise zero (or one for pure-avoidance positions).
fn judge(worker: &SearchWorker, spec: &StrengthTestSpec, played: &Move) -> Result<i32> {
    let pos = worker.game(0).position();

    for avoid in &spec.avoid_sans {
        let avoid = pos
            .parse_san(avoid)
            .with_context(|| format!("resolving am '{avoid}'"))?;
        if avoid == *played {
            return Ok(0);
        }
    }

    for (san, points) in &spec.best_sans {
        let best = pos
            .parse_san(san)
            .with_context(|| format!("resolving bm '{san}'"))?;
        if best == *played {
            return Ok(*points);
        }
    }

    if spec.best_sans.is_empty() && !spec.avoid_sans.is_empty() {
        return Ok(1);
    }
    Ok(0)
}

fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt().with_env_filter(filter).init();
}
