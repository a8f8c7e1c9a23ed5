//! Search control: UCI-side signalling, the worker loop, time control, and
//! `info`/`bestmove` emission.
//!
//! The UCI thread talks to a worker through [`SearchSignals`] (one mutex,
//! two condvars, atomic flags); the worker applies pending position and
//! search updates at well-defined points so a mid-search `position` or
//! `stop` never corrupts the tree.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use position::{centipawns, Color, Move, STARTING_POSITION};
use prediction_cache::PredictionCache;
use tracing::{info, warn};

use crate::error::SearchError;
use crate::evaluator::Evaluator;
use crate::params::SearchParams;
use crate::worker::SearchWorker;

/// How often to re-emit the PV when it is not changing.
const PV_PRINT_INTERVAL: Duration = Duration::from_secs(5);

/// Time control for one `go`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeControl {
    pub infinite: bool,
    /// Pondering searches as infinite until `ponderhit` re-arms the clock.
    pub ponder: bool,
    pub move_time_ms: Option<u64>,
    /// Remaining clock per side, white then black.
    pub time_remaining_ms: [Option<u64>; 2],
    pub increment_ms: [u64; 2],
}

fn color_index(color: Color) -> usize {
    match color {
        Color::White => 0,
        Color::Black => 1,
    }
}

/// Where protocol output goes. The UCI binary writes stdout; helpers and
/// tests swallow or capture lines.
pub trait InfoSink: Send {
    fn emit(&mut self, line: &str);
}

/// Protocol output on stdout (the UCI channel).
pub struct StdoutSink;

impl InfoSink for StdoutSink {
    fn emit(&mut self, line: &str) {
        println!("{line}");
    }
}

/// Discards output; helper workers search without reporting.
pub struct SilentSink;

impl InfoSink for SilentSink {
    fn emit(&mut self, _line: &str) {}
}

#[derive(Default)]
struct Pending {
    ready: bool,
    fen: String,
    moves: Vec<String>,
    force_new_tree: bool,
    time_control: TimeControl,
}

/// Shared signalling between the UCI thread and one worker.
pub struct SearchSignals {
    pending: Mutex<Pending>,
    signal_uci: Condvar,
    signal_ready: Condvar,
    quit: AtomicBool,
    debug: AtomicBool,
    search: AtomicBool,
    search_updated: AtomicBool,
    position_updated: AtomicBool,
}

impl Default for SearchSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchSignals {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            signal_uci: Condvar::new(),
            signal_ready: Condvar::new(),
            quit: AtomicBool::new(false),
            debug: AtomicBool::new(false),
            search: AtomicBool::new(false),
            search_updated: AtomicBool::new(false),
            position_updated: AtomicBool::new(false),
        }
    }

    /// `position …`: queue a position; applied when the worker next wakes
    /// (or as soon as the current search winds down).
    pub fn signal_position(&self, fen: Option<String>, moves: Vec<String>, force_new_tree: bool) {
        let mut pending = self.pending.lock().expect("signal lock poisoned");
        pending.fen = fen.unwrap_or_else(|| STARTING_POSITION.to_string());
        pending.moves = moves;
        pending.force_new_tree |= force_new_tree;
        self.position_updated.store(true, Ordering::Release);
    }

    /// `go`: copy in the time control and wake the worker.
    pub fn signal_go(&self, time_control: TimeControl) {
        let mut pending = self.pending.lock().expect("signal lock poisoned");
        pending.time_control = time_control;
        self.search_updated.store(true, Ordering::Release);
        self.search.store(true, Ordering::Release);
        self.signal_uci.notify_all();
    }

    /// `ponderhit`: keep searching, but against the real clock from now.
    pub fn signal_ponderhit(&self) {
        let mut pending = self.pending.lock().expect("signal lock poisoned");
        pending.time_control.ponder = false;
        self.search_updated.store(true, Ordering::Release);
        self.search.store(true, Ordering::Release);
        self.signal_uci.notify_all();
    }

    pub fn signal_stop(&self) {
        let _pending = self.pending.lock().expect("signal lock poisoned");
        self.search_updated.store(true, Ordering::Release);
        self.search.store(false, Ordering::Release);
    }

    pub fn signal_quit(&self) {
        let _pending = self.pending.lock().expect("signal lock poisoned");
        self.quit.store(true, Ordering::Release);
        self.signal_uci.notify_all();
    }

    pub fn signal_debug(&self, on: bool) {
        self.debug.store(on, Ordering::Release);
    }

    pub fn is_debug(&self) -> bool {
        self.debug.load(Ordering::Acquire)
    }

    /// Block the UCI thread until the worker reaches the top of its loop.
    pub fn wait_until_ready(&self) {
        let mut pending = self.pending.lock().expect("signal lock poisoned");
        while !pending.ready {
            pending = self
                .signal_ready
                .wait(pending)
                .expect("signal lock poisoned");
        }
    }
}

/// Running state of the current (or last) search on a worker.
pub struct SearchState {
    pub position_fen: String,
    pub position_moves: Vec<String>,
    pub searching: bool,
    pub search_start: Instant,
    pub last_pv_print: Instant,
    pub time_control: TimeControl,
    pub node_count: u64,
    pub failed_node_count: u64,
    pub pv_changed: bool,
}

impl SearchState {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            position_fen: String::new(),
            position_moves: Vec::new(),
            searching: false,
            search_start: now,
            last_pv_print: now,
            time_control: TimeControl::default(),
            node_count: 0,
            failed_node_count: 0,
            pv_changed: false,
        }
    }
}

impl Default for SearchState {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchWorker {
    /// The worker loop: wait for `go`, apply pending position/search
    /// updates, then alternate CPU selection passes with batched
    /// evaluations until told to stop. Runs until `quit`.
    pub fn search_loop(&mut self, evaluator: &dyn Evaluator) {
        if let Err(error) = evaluator.warm_up(&mut self.slots[..1]) {
            warn!(%error, "evaluator warm-up failed");
        }

        // A naked `go` searches the starting position.
        {
            let signals = Arc::clone(&self.signals);
            let mut pending = signals.pending.lock().expect("signal lock poisoned");
            if !signals.position_updated.load(Ordering::Acquire) {
                pending.fen = STARTING_POSITION.to_string();
                pending.moves.clear();
                signals.position_updated.store(true, Ordering::Release);
            }
        }

        let parallelism = self.params.parallelism;

        loop {
            {
                let signals = Arc::clone(&self.signals);
                let mut pending = signals.pending.lock().expect("signal lock poisoned");
                if !pending.ready {
                    pending.ready = true;
                    signals.signal_ready.notify_all();
                }
                while !signals.quit.load(Ordering::Acquire)
                    && !signals.search.load(Ordering::Acquire)
                {
                    pending = signals
                        .signal_uci
                        .wait(pending)
                        .expect("signal lock poisoned");
                }
            }
            if self.signals.quit.load(Ordering::Acquire) {
                break;
            }

            self.update_position();
            self.update_search();
            if self.search_state.searching {
                self.initialize_search(parallelism);

                while !self.signals.quit.load(Ordering::Acquire)
                    && !self.signals.position_updated.load(Ordering::Acquire)
                    && self.search_state.searching
                {
                    self.search_play(parallelism);
                    if let Err(error) = self.predict(evaluator, parallelism) {
                        // The engine cannot continue this search, but it can
                        // still answer with the best move found so far.
                        self.sink
                            .emit(&format!("info string evaluator unavailable: {error}"));
                        warn!(%error, "aborting search: evaluator unavailable");
                        self.search_state.searching = false;
                        break;
                    }
                    self.check_print_info();
                    self.check_time_control();
                    self.update_search();
                }
                self.on_search_finished();
            }
        }

        self.tree.prune_all(self.games[0].root());
    }

    /// Apply a pending `position` update: extend the existing game when the
    /// new move list is a continuation of it, otherwise rebuild. Invalid
    /// input is reported and leaves the previous position in place.
    pub(crate) fn update_position(&mut self) {
        debug_assert!(!self.search_state.searching);
        if !self.signals.position_updated.load(Ordering::Acquire) {
            return;
        }

        let (fen, moves, force_new_tree) = {
            let signals = Arc::clone(&self.signals);
            let mut pending = signals.pending.lock().expect("signal lock poisoned");
            let update = (
                std::mem::take(&mut pending.fen),
                std::mem::take(&mut pending.moves),
                std::mem::take(&mut pending.force_new_tree),
            );
            signals.position_updated.store(false, Ordering::Release);
            update
        };

        let extends = !force_new_tree
            && fen == self.search_state.position_fen
            && moves.len() >= self.search_state.position_moves.len()
            && moves
                .iter()
                .zip(&self.search_state.position_moves)
                .all(|(a, b)| a == b);

        let applied = if extends {
            if self.signals.is_debug() {
                self.sink.emit(&format!(
                    "info string [position] reusing tree with {} additional moves",
                    moves.len() - self.search_state.position_moves.len()
                ));
            }
            self.extend_position(&moves, self.search_state.position_moves.len())
        } else {
            if self.signals.is_debug() {
                self.sink.emit("info string [position] building new tree");
            }
            self.set_position(Some(&fen), &moves, true)
        };

        match applied {
            Ok(()) => {
                self.search_state.position_fen = fen;
                self.search_state.position_moves = moves;
            }
            Err(error) => {
                self.sink
                    .emit(&format!("info string rejected position: {error}"));
                warn!(%error, "rejected position command");
            }
        }
    }

    /// Capture a pending `go`/`stop` into the search state.
    pub(crate) fn update_search(&mut self) {
        if !self.signals.search_updated.load(Ordering::Acquire) {
            return;
        }
        let signals = Arc::clone(&self.signals);
        let pending = signals.pending.lock().expect("signal lock poisoned");

        self.search_state.searching = signals.search.load(Ordering::Acquire);
        if self.search_state.searching {
            let now = Instant::now();
            self.search_state.search_start = now;
            self.search_state.last_pv_print = now;
            self.search_state.time_control = pending.time_control;
            self.search_state.node_count = 0;
            self.search_state.failed_node_count = 0;
            // Emit the first PV as soon as one exists.
            self.search_state.pv_changed = true;
        }

        // Arm the worker to go back to sleep once this search finishes,
        // unless another `go` arrives first.
        signals.search.store(false, Ordering::Release);
        signals.search_updated.store(false, Ordering::Release);
    }

    /// Final PV, `bestmove`, and back to sleep.
    pub(crate) fn on_search_finished(&mut self) {
        self.search_state.searching = false;
        self.unwind_in_flight();

        let best = self.games[0].select_move(&self.tree, &self.params, &mut self.rng);
        self.print_principal_variation();
        match best {
            Some((mov, _)) => {
                let uci = self.games[0].position().to_uci(&mov);
                self.sink.emit(&format!("bestmove {uci}"));
            }
            // Nothing searched at all (e.g. the evaluator died instantly):
            // answer with the conservative null move.
            None => self.sink.emit("bestmove 0000"),
        }

        let signals = Arc::clone(&self.signals);
        let _pending = signals.pending.lock().expect("signal lock poisoned");
        if !signals.search_updated.load(Ordering::Acquire) {
            signals.search.store(false, Ordering::Release);
        }
    }

    /// Emit the PV when it changed, or at least every five seconds.
    pub(crate) fn check_print_info(&mut self) {
        if self.search_state.pv_changed
            || self.search_state.last_pv_print.elapsed() >= PV_PRINT_INTERVAL
        {
            self.print_principal_variation();
            self.search_state.pv_changed = false;
        }
    }

    pub(crate) fn print_principal_variation(&mut self) {
        let root = self.games[0].root();
        if self.tree.node(root).best_child.is_none() {
            return;
        }

        let mut moves = Vec::new();
        let mut node = root;
        while let Some((mov, child)) = self.tree.node(node).best_child.clone() {
            moves.push(self.games[0].position().to_uci(&mov));
            node = child;
        }

        let now = Instant::now();
        self.search_state.last_pv_print = now;
        let elapsed = now - self.search_state.search_start;
        let elapsed_ms = elapsed.as_millis().max(1) as u64;

        // The PV head's value is already from the root's perspective.
        let (_, head) = self.tree.node(root).best_child.clone().expect("checked above");
        let head = self.tree.node(head);
        let score = match head.terminal.either_mate_n() {
            0 => format!("cp {}", centipawns(head.value())),
            mate => format!("mate {mate}"),
        };

        let nodes = self.search_state.node_count;
        let nps = nodes * 1000 / elapsed_ms;
        let line = format!(
            "info depth {} score {} nodes {} nps {} time {} hashfull {} pv {}",
            moves.len(),
            score,
            nodes,
            nps,
            elapsed_ms,
            self.cache.permille_full(),
            moves.join(" "),
        );
        self.sink.emit(&line);

        if self.signals.is_debug() {
            self.sink.emit(&format!(
                "info string [cache] hitrate {} evictionrate {}",
                self.cache.permille_hits(),
                self.cache.permille_evictions()
            ));
        }
    }

    /// Stop the search when its time budget runs out. Never stops before a
    /// best move exists, and never under `infinite` or while pondering.
    pub(crate) fn check_time_control(&mut self) {
        if self
            .tree
            .node(self.games[0].root())
            .best_child
            .is_none()
        {
            return;
        }

        let tc = self.search_state.time_control;
        if tc.infinite || tc.ponder {
            return;
        }

        let elapsed_ms = self.search_state.search_start.elapsed().as_millis() as u64;

        if let Some(move_time_ms) = tc.move_time_ms {
            if elapsed_ms >= move_time_ms {
                self.search_state.searching = false;
            }
            return;
        }

        // Game clock: spend a fraction of remaining time plus the increment,
        // behind the safety buffers. In time trouble the budget can reach
        // zero, which means stop now (a best child exists; see above).
        let side = color_index(self.games[0].position().turn());
        if let Some(remaining_ms) = tc.time_remaining_ms[side] {
            let allowed_ms = remaining_ms
                .saturating_sub(self.params.safety_buffer_overall_ms)
                / u64::from(self.params.time_fraction_of_remaining.max(1))
                + tc.increment_ms[side];
            let allowed_ms = allowed_ms.saturating_sub(self.params.safety_buffer_move_ms);
            if elapsed_ms >= allowed_ms {
                self.search_state.searching = false;
            }
            return;
        }

        // No clock supplied at all: fall back to a training-sized
        // simulation cap.
        if self.completed_simulations(0) >= self.params.num_simulations {
            self.search_state.searching = false;
        }
    }

    /// Synchronous timed search over the current slot-0 game; the
    /// strength-test driver's entry point.
    pub fn run_timed_search(
        &mut self,
        evaluator: &dyn Evaluator,
        move_time_ms: u64,
    ) -> Result<Option<Move>, SearchError> {
        self.search_state.searching = true;
        let now = Instant::now();
        self.search_state.search_start = now;
        self.search_state.last_pv_print = now;
        self.search_state.time_control = TimeControl {
            move_time_ms: Some(move_time_ms),
            ..TimeControl::default()
        };
        self.search_state.node_count = 0;
        self.search_state.failed_node_count = 0;
        self.search_state.pv_changed = false;

        let parallelism = self.params.parallelism;
        self.initialize_search(parallelism);

        while self.search_state.searching {
            self.search_play(parallelism);
            self.predict(evaluator, parallelism)?;
            self.check_time_control();
        }
        self.unwind_in_flight();

        info!(
            nodes = self.search_state.node_count,
            failed = self.search_state.failed_node_count,
            "timed search complete"
        );
        Ok(self
            .games[0]
            .select_move(&self.tree, &self.params, &mut self.rng)
            .map(|(mov, _)| mov))
    }
}

/// Spawn a worker on its own OS thread, returning its signal handle and the
/// join handle. Thread 0 gets the stdout sink; helpers search silently and
/// contribute through the shared prediction cache.
pub fn spawn_worker(
    params: SearchParams,
    cache: Arc<PredictionCache>,
    evaluator: Arc<dyn Evaluator>,
    sink: Box<dyn InfoSink>,
    seed: u64,
) -> (Arc<SearchSignals>, JoinHandle<()>) {
    let signals = Arc::new(SearchSignals::new());
    let worker_signals = Arc::clone(&signals);
    let handle = std::thread::spawn(move || {
        let mut worker = SearchWorker::new(params, cache, worker_signals, sink, seed);
        worker.search_loop(evaluator.as_ref());
    });
    (signals, handle)
}
