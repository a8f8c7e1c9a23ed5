//! Controller behaviour through the real signalling path: a worker thread
//! driven by `position`/`go`/`stop`/`quit`, observed through a capturing
//! sink.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mcts::{spawn_worker, InfoSink, SearchParams, TimeControl, UniformEvaluator};
use prediction_cache::PredictionCache;

#[derive(Clone, Default)]
struct CaptureSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl CaptureSink {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    fn bestmoves(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|line| line.starts_with("bestmove"))
            .collect()
    }
}

impl InfoSink for CaptureSink {
    fn emit(&mut self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}

fn wait_for_bestmove(sink: &CaptureSink, count: usize) {
    for _ in 0..200 {
        if sink.bestmoves().len() >= count {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!(
        "no bestmove {count} within timeout; lines: {:?}",
        sink.lines()
    );
}

fn test_params() -> SearchParams {
    SearchParams {
        parallelism: 8,
        ..SearchParams::for_testing()
    }
}

#[test]
fn movetime_search_emits_info_then_bestmove() {
    let sink = CaptureSink::default();
    let cache = Arc::new(PredictionCache::new());
    let (signals, handle) = spawn_worker(
        test_params(),
        cache,
        Arc::new(UniformEvaluator::new()),
        Box::new(sink.clone()),
        3,
    );

    signals.wait_until_ready();
    signals.signal_position(None, vec!["e2e4".to_string()], false);
    signals.signal_go(TimeControl {
        move_time_ms: Some(150),
        ..TimeControl::default()
    });

    wait_for_bestmove(&sink, 1);
    let lines = sink.lines();
    let bestmove_at = lines
        .iter()
        .position(|line| line.starts_with("bestmove"))
        .unwrap();
    assert!(
        lines[..bestmove_at]
            .iter()
            .any(|line| line.starts_with("info depth")),
        "an info line precedes bestmove: {lines:?}"
    );
    // A legal reply for black, in long algebraic form.
    let bestmove = &lines[bestmove_at];
    assert!(bestmove.len() >= 13, "unexpected bestmove line: {bestmove}");

    signals.signal_quit();
    handle.join().unwrap();
}

#[test]
fn stop_terminates_an_infinite_search() {
    let sink = CaptureSink::default();
    let cache = Arc::new(PredictionCache::new());
    let (signals, handle) = spawn_worker(
        test_params(),
        cache,
        Arc::new(UniformEvaluator::new()),
        Box::new(sink.clone()),
        3,
    );

    signals.wait_until_ready();
    signals.signal_position(None, vec![], false);
    signals.signal_go(TimeControl {
        infinite: true,
        ..TimeControl::default()
    });

    std::thread::sleep(Duration::from_millis(100));
    assert!(sink.bestmoves().is_empty(), "infinite search must not stop");

    signals.signal_stop();
    wait_for_bestmove(&sink, 1);

    signals.signal_quit();
    handle.join().unwrap();
}

#[test]
fn time_trouble_clock_still_answers_promptly() {
    let sink = CaptureSink::default();
    let cache = Arc::new(PredictionCache::new());
    let (signals, handle) = spawn_worker(
        test_params(),
        cache,
        Arc::new(UniformEvaluator::new()),
        Box::new(sink.clone()),
        3,
    );

    signals.wait_until_ready();
    signals.signal_position(None, vec![], false);
    // Almost no clock left: the derived budget is zero, so the search must
    // stop as soon as a best move exists rather than burning simulations.
    signals.signal_go(TimeControl {
        time_remaining_ms: [Some(50), Some(50)],
        ..TimeControl::default()
    });

    wait_for_bestmove(&sink, 1);

    signals.signal_quit();
    handle.join().unwrap();
}

#[test]
fn position_during_search_finishes_the_old_search_first() {
    let sink = CaptureSink::default();
    let cache = Arc::new(PredictionCache::new());
    let (signals, handle) = spawn_worker(
        test_params(),
        cache,
        Arc::new(UniformEvaluator::new()),
        Box::new(sink.clone()),
        3,
    );

    signals.wait_until_ready();
    signals.signal_position(None, vec![], false);
    signals.signal_go(TimeControl {
        infinite: true,
        ..TimeControl::default()
    });
    std::thread::sleep(Duration::from_millis(80));

    // A new position mid-search: the old search answers first, then the new
    // one runs against its own clock.
    signals.signal_position(None, vec!["d2d4".to_string()], false);
    signals.signal_go(TimeControl {
        move_time_ms: Some(100),
        ..TimeControl::default()
    });

    wait_for_bestmove(&sink, 2);
    assert_eq!(sink.bestmoves().len(), 2);

    signals.signal_quit();
    handle.join().unwrap();
}

#[test]
fn ponderhit_converts_to_a_timed_search() {
    let sink = CaptureSink::default();
    let cache = Arc::new(PredictionCache::new());
    let (signals, handle) = spawn_worker(
        test_params(),
        cache,
        Arc::new(UniformEvaluator::new()),
        Box::new(sink.clone()),
        3,
    );

    signals.wait_until_ready();
    signals.signal_position(None, vec![], false);
    signals.signal_go(TimeControl {
        ponder: true,
        move_time_ms: Some(100),
        ..TimeControl::default()
    });

    std::thread::sleep(Duration::from_millis(150));
    assert!(
        sink.bestmoves().is_empty(),
        "pondering must ignore the clock"
    );

    signals.signal_ponderhit();
    wait_for_bestmove(&sink, 1);

    signals.signal_quit();
    handle.join().unwrap();
}
