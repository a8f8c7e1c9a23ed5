//! ChessCoach UCI front-end.
//!
//! The main thread parses the UCI text protocol from stdin and signals a
//! pool of search workers; worker 0 reports on stdout, the rest search the
//! same position silently, contributing through the shared prediction
//! cache. Logging goes to stderr so stdout stays protocol-clean.

mod options;

use std::io::BufRead;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info, warn};

use mcts::{
    spawn_worker, Evaluator, SearchSignals, SilentSink, StdoutSink, TimeControl, UniformEvaluator,
};
use prediction_cache::PredictionCache;

use crate::options::EngineOptions;

const ENGINE_NAME: &str = "ChessCoach";
const ENGINE_AUTHOR: &str = "the ChessCoach developers";

#[derive(Parser, Debug)]
#[command(name = "chesscoach-uci")]
#[command(about = "ChessCoach UCI engine")]
struct Args {
    /// Log level for stderr diagnostics (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

struct Engine {
    options: EngineOptions,
    cache: Arc<PredictionCache>,
    workers: Vec<(Arc<SearchSignals>, JoinHandle<()>)>,
    /// Options changed since the pool was built; rebuild before the next go.
    pool_stale: bool,
}

impl Engine {
    fn new(options: EngineOptions) -> Result<Self> {
        let cache = Arc::new(PredictionCache::new());
        cache.allocate(options.hash_mib)?;
        Ok(Self {
            options,
            cache,
            workers: Vec::new(),
            pool_stale: true,
        })
    }

    /// The evaluator the workers search with. Real networks are loaded by
    /// an external collaborator keyed on `network_type`/`network_weights`;
    /// the bundled engine ships the uniform stand-in.
    fn build_evaluator(&self) -> Arc<dyn Evaluator> {
        if !self.options.network_weights.is_empty() {
            info!(
                network_type = %self.options.network_type,
                network_weights = %self.options.network_weights,
                "recorded network selection for the evaluator provider"
            );
        }
        Arc::new(UniformEvaluator::new())
    }

    /// (Re)build the worker pool to match the current options. Only called
    /// while idle, so tearing down the old pool cannot lose a search.
    fn ensure_workers(&mut self) {
        if !self.pool_stale && !self.workers.is_empty() {
            return;
        }
        self.shutdown_workers();

        let params = self.options.to_params();
        let evaluator = self.build_evaluator();
        for index in 0..self.options.search_threads.max(1) {
            let sink: Box<dyn mcts::InfoSink> = if index == 0 {
                Box::new(StdoutSink)
            } else {
                Box::new(SilentSink)
            };
            let worker = spawn_worker(
                params.clone(),
                Arc::clone(&self.cache),
                Arc::clone(&evaluator),
                sink,
                index as u64 + 1,
            );
            self.workers.push(worker);
        }
        self.pool_stale = false;
        debug!(threads = self.workers.len(), "worker pool ready");
    }

    fn shutdown_workers(&mut self) {
        for (signals, _) in &self.workers {
            signals.signal_quit();
        }
        for (_, handle) in self.workers.drain(..) {
            let _ = handle.join();
        }
    }

    fn broadcast<F: Fn(&SearchSignals)>(&self, apply: F) {
        for (signals, _) in &self.workers {
            apply(signals);
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let mut engine = Engine::new(EngineOptions::default())?;
    info!(engine = ENGINE_NAME, "engine starting");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = tokens.first() else {
            continue;
        };

        match command {
            "uci" => {
                println!("id name {ENGINE_NAME}");
                println!("id author {ENGINE_AUTHOR}");
                for declaration in engine.options.declarations() {
                    println!("{declaration}");
                }
                println!("uciok");
            }
            "isready" => {
                engine.ensure_workers();
                engine.broadcast(|signals| signals.wait_until_ready());
                println!("readyok");
            }
            "ucinewgame" => {
                engine.ensure_workers();
                engine.cache.clear();
                engine.broadcast(|signals| signals.signal_position(None, Vec::new(), true));
            }
            "position" => {
                engine.ensure_workers();
                match parse_position(&tokens[1..]) {
                    Ok((fen, moves)) => engine.broadcast(|signals| {
                        signals.signal_position(fen.clone(), moves.clone(), false)
                    }),
                    Err(message) => println!("info string {message}"),
                }
            }
            "go" => {
                engine.ensure_workers();
                let time_control = parse_go(&tokens[1..]);
                engine.broadcast(|signals| signals.signal_go(time_control));
            }
            "stop" => engine.broadcast(|signals| signals.signal_stop()),
            "ponderhit" => engine.broadcast(|signals| signals.signal_ponderhit()),
            "debug" => {
                let on = tokens.get(1) != Some(&"off");
                engine.broadcast(|signals| signals.signal_debug(on));
            }
            "setoption" => match parse_setoption(&tokens[1..]) {
                Ok((name, value)) => match engine.options.set(&name, &value) {
                    Ok(()) => {
                        engine.pool_stale = true;
                        if name == "Hash" {
                            if let Err(error) = engine.cache.allocate(engine.options.hash_mib) {
                                println!("info string {error}");
                                warn!(%error, "prediction cache allocation refused");
                            }
                        }
                    }
                    Err(message) => println!("info string setoption: {message}"),
                },
                Err(message) => println!("info string {message}"),
            },
            "quit" => break,
            other => debug!(command = other, "ignoring unknown command"),
        }
    }

    engine.shutdown_workers();
    info!("engine exiting");
    Ok(())
}

fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// `position (startpos | fen <6 fields>) [moves m1 m2 …]`
fn parse_position(tokens: &[&str]) -> Result<(Option<String>, Vec<String>), String> {
    let mut iter = tokens.iter();
    let fen = match iter.next() {
        Some(&"startpos") => None,
        Some(&"fen") => {
            let fields: Vec<&str> = iter
                .by_ref()
                .take_while(|&&token| token != "moves")
                .copied()
                .collect();
            if fields.len() < 4 {
                return Err(format!("position: incomplete fen '{}'", fields.join(" ")));
            }
            // `take_while` consumed the `moves` keyword; the remainder of
            // the iterator is the move list.
            let moves = iter.map(|&token| token.to_string()).collect();
            return Ok((Some(fields.join(" ")), moves));
        }
        _ => return Err("position: expected 'startpos' or 'fen'".to_string()),
    };

    let moves = match iter.next() {
        Some(&"moves") => iter.map(|&token| token.to_string()).collect(),
        None => Vec::new(),
        Some(other) => return Err(format!("position: unexpected token '{other}'")),
    };
    Ok((fen, moves))
}

/// `go [infinite | ponder | movetime ms | wtime … btime … winc … binc …]`
fn parse_go(tokens: &[&str]) -> TimeControl {
    let mut time_control = TimeControl::default();
    let mut iter = tokens.iter().peekable();

    while let Some(&token) = iter.next() {
        let mut take_number = || -> Option<u64> {
            let parsed = iter.peek().and_then(|next| next.parse::<i64>().ok())?;
            iter.next();
            Some(parsed.max(0) as u64)
        };
        match token {
            "infinite" => time_control.infinite = true,
            "ponder" => time_control.ponder = true,
            "movetime" => time_control.move_time_ms = take_number(),
            "wtime" => time_control.time_remaining_ms[0] = take_number(),
            "btime" => time_control.time_remaining_ms[1] = take_number(),
            "winc" => time_control.increment_ms[0] = take_number().unwrap_or(0),
            "binc" => time_control.increment_ms[1] = take_number().unwrap_or(0),
            _ => {}
        }
    }
    time_control
}

/// `setoption name <name…> [value <value…>]`
fn parse_setoption(tokens: &[&str]) -> Result<(String, String), String> {
    if tokens.first() != Some(&"name") {
        return Err("setoption: expected 'name'".to_string());
    }
    let rest = &tokens[1..];
    let split = rest
        .iter()
        .position(|&token| token == "value")
        .unwrap_or(rest.len());
    let name = rest[..split].join(" ");
    if name.is_empty() {
        return Err("setoption: missing option name".to_string());
    }
    let value = rest.get(split + 1..).unwrap_or(&[]).join(" ");
    Ok((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_startpos_with_moves() {
        let (fen, moves) = parse_position(&["startpos", "moves", "e2e4", "e7e5"]).unwrap();
        assert!(fen.is_none());
        assert_eq!(moves, vec!["e2e4", "e7e5"]);
    }

    #[test]
    fn parses_fen_with_and_without_moves() {
        let (fen, moves) =
            parse_position(&["fen", "8/8/8/8/8/8/8/K1k5", "w", "-", "-", "0", "1"]).unwrap();
        assert_eq!(fen.as_deref(), Some("8/8/8/8/8/8/8/K1k5 w - - 0 1"));
        assert!(moves.is_empty());

        let (fen, moves) = parse_position(&[
            "fen", "8/8/8/8/8/8/8/K1k5", "w", "-", "-", "0", "1", "moves", "a1a2",
        ])
        .unwrap();
        assert!(fen.is_some());
        assert_eq!(moves, vec!["a1a2"]);
    }

    #[test]
    fn rejects_malformed_position() {
        assert!(parse_position(&[]).is_err());
        assert!(parse_position(&["fen", "8/8"]).is_err());
        assert!(parse_position(&["sideways"]).is_err());
    }

    #[test]
    fn parses_go_variants() {
        let tc = parse_go(&["movetime", "1500"]);
        assert_eq!(tc.move_time_ms, Some(1500));
        assert!(!tc.infinite);

        let tc = parse_go(&["infinite"]);
        assert!(tc.infinite);

        let tc = parse_go(&["wtime", "60000", "btime", "55000", "winc", "1000", "binc", "900"]);
        assert_eq!(tc.time_remaining_ms, [Some(60000), Some(55000)]);
        assert_eq!(tc.increment_ms, [1000, 900]);

        let tc = parse_go(&["ponder", "movetime", "100"]);
        assert!(tc.ponder);
        assert_eq!(tc.move_time_ms, Some(100));
    }

    #[test]
    fn parses_setoption_lines() {
        let (name, value) = parse_setoption(&["name", "Hash", "value", "512"]).unwrap();
        assert_eq!(name, "Hash");
        assert_eq!(value, "512");

        let (name, value) =
            parse_setoption(&["name", "network_weights", "value", "nets/latest.bin"]).unwrap();
        assert_eq!(name, "network_weights");
        assert_eq!(value, "nets/latest.bin");

        assert!(parse_setoption(&["value", "x"]).is_err());
        assert!(parse_setoption(&["name"]).is_err());
    }
}
