//! Parallel Monte-Carlo Tree Search core.
//!
//! An AlphaZero-style searcher serving two modes from the same machinery:
//! self-play training games (`try_hard = false`: root noise, move sampling,
//! fixed simulation budgets) and real UCI search (`try_hard = true`: best
//! child always, time-control driven, tree reuse across `position` updates).
//!
//! # Structure
//!
//! - [`tree`]: arena-backed node storage with constant-time recycling
//! - [`terminal`]: proven mates/draws and their selection incentives
//! - [`game`]: a position under search and the two-phase
//!   expand-and-evaluate step against a batched evaluator
//! - [`worker`]: batch slots sharing one tree — selection with virtual
//!   loss, backpropagation, mate proving, principal-variation tracking
//! - [`controller`]: UCI-side signalling, time control, `info`/`bestmove`
//! - [`evaluator`]: the pluggable batched network interface
//!
//! Workers own their trees outright and share only the prediction cache;
//! inside a worker, slots are interleaved on one thread between batched
//! evaluator calls, coordinated by virtual loss and `expanding` claims.

pub mod controller;
pub mod error;
pub mod evaluator;
pub mod game;
pub mod node;
pub mod params;
pub mod terminal;
pub mod tree;
pub mod worker;

pub use controller::{
    spawn_worker, InfoSink, SearchSignals, SearchState, SilentSink, StdoutSink, TimeControl,
};
pub use error::SearchError;
pub use evaluator::{EvalSlot, Evaluator, EvaluatorError, UniformEvaluator};
pub use game::{FinishedGame, SearchGame, SimulationState};
pub use node::{worse_than, Node, NodeId};
pub use params::SearchParams;
pub use terminal::TerminalValue;
pub use tree::Tree;
pub use worker::{
    backpropagate, backpropagate_mate, select_child, ucb_score, update_principal_variation,
    PathStep, SearchWorker,
};
