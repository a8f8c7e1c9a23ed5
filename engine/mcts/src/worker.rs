//! The MCTS worker: a batch of slots sharing one tree, driven in
//! alternation with a batched evaluator call.
//!
//! All tree mutation happens on the worker's thread; slots are logically
//! parallel but interleaved, coordinated through `visiting_count` (virtual
//! loss) and the `expanding` leaf claim.

use std::sync::Arc;

use position::{flip_value, GamePosition, Move};
use prediction_cache::{CacheReservation, PredictionCache};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Gamma};
use tracing::debug;

use crate::controller::{InfoSink, SearchSignals, SearchState};
use crate::error::SearchError;
use crate::evaluator::{EvalSlot, Evaluator};
use crate::game::{FinishedGame, SearchGame, SimulationState};
use crate::node::{worse_than, Node, NodeId};
use crate::params::SearchParams;
use crate::tree::Tree;

/// One step of a simulation's root-to-leaf path. The root entry carries no
/// move.
#[derive(Debug, Clone)]
pub struct PathStep {
    pub mov: Option<Move>,
    pub node: NodeId,
}

/// Owns a batch of games sharing one tree, the per-slot evaluation buffers,
/// and the search bookkeeping. One worker per OS thread; workers share only
/// the prediction cache.
pub struct SearchWorker {
    pub(crate) params: SearchParams,
    pub(crate) cache: Arc<PredictionCache>,
    pub(crate) tree: Tree,

    pub(crate) states: Vec<SimulationState>,
    pub(crate) slots: Vec<EvalSlot>,
    pub(crate) games: Vec<SearchGame>,
    scratch: Vec<SearchGame>,
    simulations: Vec<u32>,
    search_paths: Vec<Vec<PathStep>>,
    cache_slots: Vec<Option<CacheReservation>>,

    pub(crate) rng: ChaCha20Rng,
    pub(crate) search_state: SearchState,
    pub(crate) signals: Arc<SearchSignals>,
    pub(crate) sink: Box<dyn InfoSink>,
}

impl SearchWorker {
    pub fn new(
        params: SearchParams,
        cache: Arc<PredictionCache>,
        signals: Arc<SearchSignals>,
        sink: Box<dyn InfoSink>,
        seed: u64,
    ) -> Self {
        let batch = params.parallelism;
        let mut tree = Tree::new();
        let games = (0..batch)
            .map(|_| SearchGame::startpos(false, &mut tree))
            .collect::<Vec<_>>();
        let scratch = games.iter().map(SearchGame::clone_shadow).collect();

        Self {
            cache,
            tree,
            states: vec![SimulationState::Working; batch],
            slots: (0..batch).map(|_| EvalSlot::default()).collect(),
            games,
            scratch,
            simulations: vec![0; batch],
            search_paths: (0..batch).map(|_| Vec::new()).collect(),
            cache_slots: vec![None; batch],
            rng: ChaCha20Rng::seed_from_u64(seed),
            search_state: SearchState::new(),
            signals,
            sink,
            params,
        }
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn game(&self, index: usize) -> &SearchGame {
        &self.games[index]
    }

    pub fn search_state(&self) -> &SearchState {
        &self.search_state
    }

    /// Simulations completed by a slot within its current budget block.
    pub fn completed_simulations(&self, index: usize) -> u32 {
        self.simulations[index]
    }

    pub fn state(&self, index: usize) -> SimulationState {
        self.states[index]
    }

    fn clear_slot(&mut self, index: usize) {
        self.states[index] = SimulationState::Working;
        self.simulations[index] = 0;
        self.search_paths[index].clear();
        self.cache_slots[index] = None;
    }

    /// Install a fresh position for slot 0, discarding any existing tree.
    /// Move strings are validated before anything is touched; a bad input
    /// leaves the previous game intact.
    pub fn set_position(
        &mut self,
        fen: Option<&str>,
        moves: &[String],
        try_hard: bool,
    ) -> Result<(), SearchError> {
        let mut pos = match fen {
            Some(fen) => GamePosition::from_fen(fen)?,
            None => GamePosition::startpos(),
        };
        for mov in moves {
            pos.play_uci(mov)?;
        }

        self.tree.prune_all(self.games[0].root());
        self.clear_slot(0);
        self.games[0] = SearchGame::from_position(pos, try_hard, &mut self.tree);
        Ok(())
    }

    /// Play `moves[offset..]` onto slot 0's existing game, promoting matching
    /// children to root (pruning their siblings) and preserving their
    /// subtrees. Falls back to fresh nodes where the tree has no matching
    /// child. Validates the whole suffix before mutating.
    pub fn extend_position(
        &mut self,
        moves: &[String],
        offset: usize,
    ) -> Result<(), SearchError> {
        let mut probe = self.games[0].position().clone();
        let mut parsed = Vec::with_capacity(moves.len().saturating_sub(offset));
        for mov in &moves[offset..] {
            parsed.push(probe.play_uci(mov)?);
        }

        for mov in parsed {
            let old_root = self.games[0].root();
            let child = self
                .tree
                .node(old_root)
                .children
                .iter()
                .find(|(child_mov, _)| *child_mov == mov)
                .map(|&(_, id)| id);

            match child {
                Some(child) => {
                    self.games[0].apply_move_with_root(&mov, child);
                    self.tree.prune_except(old_root, child);
                    rebase_root_visits(&mut self.tree, child);
                }
                None => {
                    self.tree.prune_all(old_root);
                    let new_root = self.tree.alloc(Node::new(0.0));
                    self.games[0].apply_move_with_root(&mov, new_root);
                }
            }
        }
        self.clear_slot(0);
        Ok(())
    }

    /// Set up tree parallelism: slots 1..N become shadows of slot 0, sharing
    /// its tree but carrying their own evaluation buffers.
    pub fn initialize_search(&mut self, parallelism: usize) {
        self.clear_slot(0);
        for index in 1..parallelism {
            self.clear_slot(index);
            self.states[index] = self.states[0];
            self.games[index] = self.games[0].clone_shadow();
        }
        self.cache.reset_probe_metrics();
    }

    /// One CPU pass: make sure the root is expanded, then advance every
    /// slot's simulation to its next suspension point.
    pub fn search_play(&mut self, parallelism: usize) {
        if !self.tree.node(self.games[0].root()).is_expanded() {
            self.games[0].expand_and_evaluate(
                &mut self.tree,
                &mut self.slots[0],
                &mut self.states[0],
                &mut self.cache_slots[0],
                &self.cache,
                &self.params,
            );
            if self.states[0] == SimulationState::WaitingForPrediction {
                return;
            }
        }

        for index in 0..parallelism {
            let _ = self.run_mcts(index);
        }
    }

    /// Abandon simulations still waiting on a prediction: unwind their
    /// virtual loss and release their leaf claims. Called when a search
    /// winds down so the tree carries no in-flight state into reuse.
    pub(crate) fn unwind_in_flight(&mut self) {
        for index in 0..self.states.len() {
            if self.states[index] != SimulationState::WaitingForPrediction {
                continue;
            }
            let leaf = self.scratch[index].root();
            self.tree.node_mut(leaf).expanding = false;
            for step in &self.search_paths[index] {
                let node = self.tree.node_mut(step.node);
                node.visiting_count = node.visiting_count.saturating_sub(1);
            }
            self.search_paths[index].clear();
            self.cache_slots[index] = None;
            self.states[index] = SimulationState::Working;
        }
    }

    /// Issue the batched evaluation for the first `parallelism` slots.
    pub fn predict(
        &mut self,
        evaluator: &dyn Evaluator,
        parallelism: usize,
    ) -> Result<(), SearchError> {
        evaluator.predict_batch(&mut self.slots[..parallelism])?;
        Ok(())
    }

    /// Run simulations for one slot until it needs a prediction, fails
    /// selection, or exhausts its budget. Returns the selected move once the
    /// budget completes (self-play applies it; search ignores it).
    pub fn run_mcts(&mut self, index: usize) -> Option<(Move, NodeId)> {
        let try_hard = self.games[index].try_hard();
        let target = if try_hard {
            // Bound time between PV/time-control checks, but stay high
            // enough to amortise runs of prediction-cache hits.
            self.simulations[index] + self.params.search_simulation_block
        } else {
            self.params.num_simulations
        };

        while self.simulations[index] < target {
            if self.states[index] == SimulationState::Working {
                if self.simulations[index] == 0 && !try_hard {
                    self.add_exploration_noise(index);
                }

                // Fresh descent: clone the game, stake a virtual-loss claim
                // on every node along the way.
                self.scratch[index] = self.games[index].clone_shadow();
                let path = &mut self.search_paths[index];
                path.clear();
                path.push(PathStep {
                    mov: None,
                    node: self.scratch[index].root(),
                });
                self.tree
                    .node_mut(self.scratch[index].root())
                    .visiting_count += 1;

                while self.tree.node(self.scratch[index].root()).is_expanded() {
                    let selected =
                        select_child(&self.tree, self.scratch[index].root(), &self.params);
                    let (mov, child) = match selected {
                        Some(pair) => pair,
                        None => {
                            // Parallel slots are already expanding every
                            // child here. Give up on this slot for the
                            // batch and unwind the virtual loss.
                            debug_assert!(try_hard);
                            for step in self.search_paths[index].iter() {
                                self.tree.node_mut(step.node).visiting_count -= 1;
                            }
                            self.search_state.failed_node_count += 1;
                            return None;
                        }
                    };

                    self.scratch[index].apply_move_with_root(&mov, child);
                    self.search_paths[index].push(PathStep {
                        mov: Some(mov),
                        node: child,
                    });
                    self.tree.node_mut(child).visiting_count += 1;
                }
            }

            let leaf = self.scratch[index].root();
            let was_immediate_mate =
                self.tree.node(leaf).terminal == crate::terminal::TerminalValue::MateIn(1);

            let value = self.scratch[index].expand_and_evaluate(
                &mut self.tree,
                &mut self.slots[index],
                &mut self.states[index],
                &mut self.cache_slots[index],
                &self.cache,
                &self.params,
            );

            if self.states[index] == SimulationState::WaitingForPrediction {
                // The leaf will become expanded once results arrive; mark it
                // off-limits to other slots until then.
                self.tree.node_mut(leaf).expanding = true;
                return None;
            }
            self.tree.node_mut(leaf).expanding = false;

            // The value is from the scratch leaf's parent's perspective;
            // start applying it at the real game's root, flipping once if
            // their sides to move differ.
            debug_assert!(!value.is_nan());
            let value = if self.games[index].position().turn()
                != self.scratch[index].position().turn()
            {
                flip_value(value)
            } else {
                value
            };
            backpropagate(&mut self.tree, &self.search_paths[index], value);
            self.search_state.node_count += 1;

            // If this leaf *just* became a mate, prove it backwards as far
            // as it goes.
            if !was_immediate_mate && self.tree.node(leaf).terminal.is_mate_in_n() {
                backpropagate_mate(
                    &mut self.tree,
                    &self.search_paths[index],
                    self.params.max_moves,
                    &mut self.search_state.pv_changed,
                );
            }

            update_principal_variation(
                &mut self.tree,
                &self.search_paths[index],
                self.params.max_moves,
                &mut self.search_state.pv_changed,
            );
            debug_assert!(self
                .tree
                .is_principal_variation_valid(self.games[index].root(), self.params.max_moves));

            self.simulations[index] += 1;
        }

        self.simulations[index] = 0;
        self.games[index].select_move(&self.tree, &self.params, &mut self.rng)
    }

    /// Mix root Dirichlet noise into child priors, once per move at
    /// simulation 0 (self-play only).
    fn add_exploration_noise(&mut self, index: usize) {
        let alpha = self.params.root_dirichlet_alpha;
        let fraction = self.params.root_exploration_fraction;
        if alpha <= 0.0 || fraction <= 0.0 {
            return;
        }

        let root = self.games[index].root();
        let children: Vec<NodeId> = self
            .tree
            .node(root)
            .children
            .iter()
            .map(|&(_, id)| id)
            .collect();
        if children.is_empty() {
            return;
        }

        let gamma = Gamma::new(f64::from(alpha), 1.0).expect("alpha is positive");
        let mut noise: Vec<f64> = (0..children.len())
            .map(|_| gamma.sample(&mut self.rng))
            .collect();
        let sum: f64 = noise.iter().sum();
        if !(sum.is_finite() && sum > 0.0) {
            return;
        }
        for sample in &mut noise {
            *sample /= sum;
        }

        for (child, sample) in children.into_iter().zip(noise) {
            let node = self.tree.node_mut(child);
            node.prior = node.prior * (1.0 - fraction) + sample as f32 * fraction;
        }
    }

    /// Drive one self-play game forward to its next suspension point,
    /// playing moves as simulation budgets complete. Marks the slot
    /// `Finished` once the game ends.
    pub fn play_step(&mut self, index: usize) {
        if !self.tree.node(self.games[index].root()).is_expanded() {
            self.games[index].expand_and_evaluate(
                &mut self.tree,
                &mut self.slots[index],
                &mut self.states[index],
                &mut self.cache_slots[index],
                &self.cache,
                &self.params,
            );
            if self.states[index] == SimulationState::WaitingForPrediction {
                return;
            }
        }

        while !self.is_game_over(index) {
            let old_root = self.games[index].root();
            let selected = self.run_mcts(index);
            if self.states[index] == SimulationState::WaitingForPrediction {
                return;
            }
            let (mov, new_root) =
                selected.expect("self-play slots own their subtrees; selection cannot fail");

            self.games[index].store_search_statistics(&self.tree);
            self.games[index]
                .apply_move_with_root_and_history(&mov, new_root, &mut self.tree);
            self.tree.prune_except(old_root, new_root);
            // The first move of the old PV is gone.
            self.search_state.pv_changed = true;

            debug_assert!(self.tree.visit_counts_consistent(self.games[index].root()));
        }

        self.states[index] = SimulationState::Finished;
    }

    fn is_game_over(&self, index: usize) -> bool {
        self.tree
            .node(self.games[index].root())
            .terminal
            .is_immediate()
            || self.games[index].position().ply() >= self.params.max_moves
    }

    /// Take a finished game out of its slot and set up a fresh one.
    pub fn take_finished_game(&mut self, index: usize) -> FinishedGame {
        debug_assert_eq!(self.states[index], SimulationState::Finished);
        let fresh = SearchGame::startpos(false, &mut self.tree);
        let done = std::mem::replace(&mut self.games[index], fresh);
        self.clear_slot(index);
        let finished = done.complete(&mut self.tree);
        debug!(
            result = finished.result,
            plies = finished.history.len(),
            "self-play game finished"
        );
        finished
    }
}

/// UCB over the parent's children, skipping leaves claimed for expansion.
/// Returns `None` when every child is claimed.
pub fn select_child(tree: &Tree, parent: NodeId, params: &SearchParams) -> Option<(Move, NodeId)> {
    let parent_node = tree.node(parent);
    let mut best: Option<(Move, NodeId)> = None;
    let mut best_score = f32::NEG_INFINITY;

    for &(ref mov, child_id) in &parent_node.children {
        let child = tree.node(child_id);
        if child.expanding {
            continue;
        }
        let score = ucb_score(parent_node, child, params);
        if score > best_score {
            best_score = score;
            best = Some((mov.clone(), child_id));
        }
    }
    best
}

/// AlphaZero-style PUCT with virtual exploration and a proven-mate
/// incentive. Virtual counts depress scores along paths other slots are
/// already walking.
pub fn ucb_score(parent: &Node, child: &Node, params: &SearchParams) -> f32 {
    let virtual_loss = params.virtual_loss_coefficient;
    let parent_virtual = parent.visit_count as f32 + virtual_loss * parent.visiting_count as f32;
    let child_virtual = child.visit_count as f32 + virtual_loss * child.visiting_count as f32;

    let exploration_rate = (((parent_virtual + params.exploration_rate_base + 1.0)
        / params.exploration_rate_base)
        .ln()
        + params.exploration_rate_init)
        * parent_virtual.sqrt()
        / (child_virtual + 1.0);

    child.value() + exploration_rate * child.prior + child.terminal.mate_score(exploration_rate)
}

/// Value backpropagation: each ply flips perspective, every node on the path
/// trades its in-flight claim for a completed visit.
pub fn backpropagate(tree: &mut Tree, path: &[PathStep], mut value: f32) {
    for step in path {
        let node = tree.node_mut(step.node);
        node.visiting_count -= 1;
        node.visit_count += 1;
        node.value_sum += value;
        value = flip_value(value);
    }
}

/// Prove mates backwards from a leaf that just became `MateIn(1)`.
///
/// Walking toward the root with an alternating flag: a parent looking at a
/// freshly mated child becomes an opponent-mate (if that is news, or a
/// faster one); a parent whose children are *all* opponent-mates becomes a
/// mate one move deeper than its slowest reply. Stops as soon as nothing
/// improves.
pub fn backpropagate_mate(
    tree: &mut Tree,
    path: &[PathStep],
    max_moves: u32,
    pv_changed: &mut bool,
) {
    let mut child_is_mate = true;
    for i in (0..path.len().saturating_sub(1)).rev() {
        let parent = path[i].node;

        if child_is_mate {
            let child = tree.node(path[i + 1].node);
            let new_mate_n = child.terminal.mate_n();
            debug_assert!(new_mate_n > 0);

            let parent_node = tree.node(parent);
            let improves = !parent_node.terminal.is_opponent_mate_in_n()
                || new_mate_n < parent_node.terminal.opponent_mate_n();
            if !improves {
                return;
            }
            tree.node_mut(parent).terminal =
                crate::terminal::TerminalValue::OpponentMateIn(new_mate_n);

            // The parent just got worse, so the grandparent may need a
            // different best child; the regular PV update only handles
            // paths that improved.
            if i >= 1 {
                fix_principal_variation(tree, path, path[i - 1].node, max_moves, pv_changed);
            }
        } else {
            let mut slowest_reply = 0u16;
            for &(_, child_id) in &tree.node(parent).children {
                let reply = tree.node(child_id).terminal.opponent_mate_n();
                if reply == 0 {
                    // Some reply is not yet a proven loss: not a mate.
                    return;
                }
                slowest_reply = slowest_reply.max(reply);
            }
            debug_assert!(slowest_reply > 0);
            tree.node_mut(parent).terminal =
                crate::terminal::TerminalValue::MateIn(slowest_reply + 1);
        }

        child_is_mate = !child_is_mate;
    }
}

/// Re-derive `parent`'s best child from scratch after a worsening update,
/// and record a PV change if `parent` was on the live PV.
fn fix_principal_variation(
    tree: &mut Tree,
    path: &[PathStep],
    parent: NodeId,
    max_moves: u32,
    pv_changed: &mut bool,
) {
    let mut updated = None;
    {
        let parent_node = tree.node(parent);
        let mut best = parent_node.best_child.clone();
        for &(ref mov, child_id) in &parent_node.children {
            let incumbent = best.as_ref().map(|&(_, id)| tree.node(id));
            if worse_than(incumbent, tree.node(child_id), max_moves) {
                best = Some((mov.clone(), child_id));
                updated = best.clone();
            }
        }
    }

    if let Some(best) = updated {
        tree.node_mut(parent).best_child = Some(best);

        for i in 0..path.len().saturating_sub(1) {
            if path[i].node == parent {
                *pv_changed = true;
                break;
            }
            let on_pv = tree
                .node(path[i].node)
                .best_child
                .as_ref()
                .map(|&(_, id)| id)
                == Some(path[i + 1].node);
            if !on_pv {
                break;
            }
        }
    }
}

/// Walk the fresh path root-to-leaf, promoting each step to best child where
/// it now wins the ordering; record whether the live PV changed.
pub fn update_principal_variation(
    tree: &mut Tree,
    path: &[PathStep],
    max_moves: u32,
    pv_changed: &mut bool,
) {
    let mut on_principal_variation = true;
    for i in 0..path.len().saturating_sub(1) {
        let parent = path[i].node;
        let next = path[i + 1].node;

        let incumbent_id = tree
            .node(parent)
            .best_child
            .as_ref()
            .map(|&(_, id)| id);
        let incumbent = incumbent_id.map(|id| tree.node(id));

        if worse_than(incumbent, tree.node(next), max_moves) {
            let mov = path[i + 1]
                .mov
                .clone()
                .expect("non-root path steps carry their move");
            tree.node_mut(parent).best_child = Some((mov, next));
            *pv_changed |= on_principal_variation;
        } else {
            on_principal_variation &= incumbent_id == Some(next);
        }
    }
}

fn rebase_root_visits(tree: &mut Tree, root: NodeId) {
    let node = tree.node_mut(root);
    if node.children.is_empty() {
        node.visit_count = 0;
    } else {
        node.visit_count = node.visit_count.saturating_sub(1);
    }
}
