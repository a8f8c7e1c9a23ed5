//! Self-play runner: plays training games with the search core and logs
//! their outcomes. Storage of finished games is a collaborator concern;
//! this binary exercises the training-mode search loop (root noise, move
//! sampling, statistics collection) end to end.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use mcts::{
    SearchParams, SearchSignals, SearchWorker, SilentSink, SimulationState, UniformEvaluator,
};
use prediction_cache::PredictionCache;

#[derive(Parser, Debug)]
#[command(name = "chesscoach-selfplay")]
#[command(about = "ChessCoach self-play game runner")]
struct Args {
    /// Number of games to play
    #[arg(long, default_value_t = 16)]
    games: u32,

    /// Simulations per move
    #[arg(long, default_value_t = 800)]
    simulations: u32,

    /// Batch slots sharing the worker (games in flight)
    #[arg(long, default_value_t = 256)]
    parallelism: usize,

    /// Moves sampled by visit count before switching to best-child play
    #[arg(long, default_value_t = 30)]
    sampling_moves: u32,

    /// Game length cap in plies; longer games adjudicate as draws
    #[arg(long, default_value_t = 512)]
    max_moves: u32,

    /// Prediction cache size in MiB
    #[arg(long, default_value_t = 256)]
    cache_mib: u64,

    /// RNG seed (noise, sampling)
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let params = SearchParams {
        num_simulations: args.simulations,
        num_sampling_moves: args.sampling_moves,
        max_moves: args.max_moves,
        parallelism: args.parallelism,
        ..SearchParams::default()
    };
    let batch = params.parallelism;

    let cache = Arc::new(PredictionCache::new());
    cache.allocate(args.cache_mib)?;

    let mut worker = SearchWorker::new(
        params,
        Arc::clone(&cache),
        Arc::new(SearchSignals::new()),
        Box::new(SilentSink),
        args.seed,
    );
    let evaluator = UniformEvaluator::new();

    info!(
        games = args.games,
        simulations = args.simulations,
        parallelism = batch,
        "self-play starting"
    );

    let started = Instant::now();
    let mut finished = 0u32;
    let mut white_score = 0.0f32;
    let mut game_starts = vec![Instant::now(); batch];

    while finished < args.games {
        for index in 0..batch {
            worker.play_step(index);

            // Whole games can finish on the CPU via the prediction cache, so
            // keep draining before the next batched evaluation.
            while worker.state(index) == SimulationState::Finished && finished < args.games {
                let game = worker.take_finished_game(index);
                finished += 1;
                white_score += game.result;

                let elapsed = game_starts[index].elapsed().as_secs_f32();
                info!(
                    game = finished,
                    plies = game.history.len(),
                    result = game.result,
                    seconds = elapsed,
                    hashfull = cache.permille_full(),
                    "game finished"
                );
                game_starts[index] = Instant::now();
                worker.play_step(index);
            }
        }
        worker.predict(&evaluator, batch)?;
    }

    info!(
        games = finished,
        white_score,
        minutes = started.elapsed().as_secs_f32() / 60.0,
        "self-play complete"
    );
    Ok(())
}

fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt().with_env_filter(filter).init();
}
