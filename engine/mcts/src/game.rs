//! A position under search: the tree root it points at, per-search scratch,
//! and the two-phase expand-and-evaluate step.

use position::{flip_value, GamePosition, Move, VALUE_DRAW};
use prediction_cache::{CacheProbe, CacheReservation, PredictionCache};
use rand::Rng;

use crate::evaluator::EvalSlot;
use crate::node::{Node, NodeId};
use crate::params::SearchParams;
use crate::terminal::TerminalValue;
use crate::tree::Tree;

/// Re-entrant state of one batch slot's simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationState {
    Working,
    WaitingForPrediction,
    Finished,
}

/// Snapshot of a finished self-play game.
#[derive(Debug, Clone)]
pub struct FinishedGame {
    /// Result from White's perspective: 1 win, 0.5 draw, 0 loss.
    pub result: f32,
    pub history: Vec<Move>,
    /// One normalised child-visit distribution per played move, the policy
    /// training targets.
    pub child_visits: Vec<Vec<(Move, f32)>>,
}

/// A chess position paired with its current tree node.
///
/// Real games (one per batch slot) also carry the move history and visit
/// statistics; shadow and scratch clones share the tree but none of the
/// history. Values returned by [`expand_and_evaluate`](Self::expand_and_evaluate)
/// are always from the parent's perspective, so backpropagation is a plain
/// alternating sign flip.
pub struct SearchGame {
    pos: GamePosition,
    root: NodeId,
    try_hard: bool,
    search_root_ply: u32,

    history: Vec<Move>,
    child_visits: Vec<Vec<(Move, f32)>>,

    // Expansion scratch, live between the Working return and the
    // WaitingForPrediction re-entry.
    pending_key: u64,
    pending_moves: Vec<Move>,
    pending_priors: Vec<f32>,
}

impl SearchGame {
    pub fn from_position(pos: GamePosition, try_hard: bool, tree: &mut Tree) -> Self {
        let root = tree.alloc(Node::new(0.0));
        let search_root_ply = pos.ply();
        Self {
            pos,
            root,
            try_hard,
            search_root_ply,
            history: Vec::new(),
            child_visits: Vec::new(),
            pending_key: 0,
            pending_moves: Vec::new(),
            pending_priors: Vec::new(),
        }
    }

    pub fn startpos(try_hard: bool, tree: &mut Tree) -> Self {
        Self::from_position(GamePosition::startpos(), try_hard, tree)
    }

    /// Clone for a scratch descent or a parallel shadow slot: shares the
    /// tree root, re-bases the search root at the current ply, carries no
    /// history.
    pub fn clone_shadow(&self) -> Self {
        Self {
            pos: self.pos.clone(),
            root: self.root,
            try_hard: self.try_hard,
            search_root_ply: self.pos.ply(),
            history: Vec::new(),
            child_visits: Vec::new(),
            pending_key: 0,
            pending_moves: Vec::new(),
            pending_priors: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn position(&self) -> &GamePosition {
        &self.pos
    }

    pub fn try_hard(&self) -> bool {
        self.try_hard
    }

    pub fn history(&self) -> &[Move] {
        &self.history
    }

    /// Step the position forward and point at the chosen child, preserving
    /// its subtree. No visit adjustment: scratch descents use this too.
    pub fn apply_move_with_root(&mut self, mov: &Move, new_root: NodeId) {
        self.pos.play(mov);
        self.root = new_root;
    }

    /// Real-game move: also records history and re-bases the new root's
    /// visit count to the sum of its children (it was counted once as a
    /// leaf before being expanded; terminal roots reset to zero).
    pub fn apply_move_with_root_and_history(
        &mut self,
        mov: &Move,
        new_root: NodeId,
        tree: &mut Tree,
    ) {
        self.apply_move_with_root(mov, new_root);
        self.history.push(mov.clone());

        let node = tree.node_mut(new_root);
        if node.children.is_empty() {
            node.visit_count = 0;
        } else {
            node.visit_count = node.visit_count.saturating_sub(1);
        }
    }

    /// Two-phase expansion. First entry generates moves, handles terminals
    /// and draws, probes the cache, and either finishes from cached priors
    /// or parks the slot as `WaitingForPrediction` (returning NaN). Re-entry
    /// consumes the filled slot: flips the network value to the parent's
    /// perspective, optionally mixes the handcrafted evaluation, softmaxes
    /// the legal-move logits, caps branching, stores to the reserved cache
    /// slot, and creates the children.
    pub fn expand_and_evaluate(
        &mut self,
        tree: &mut Tree,
        slot: &mut EvalSlot,
        state: &mut SimulationState,
        cache_slot: &mut Option<CacheReservation>,
        cache: &PredictionCache,
        params: &SearchParams,
    ) -> f32 {
        let root = self.root;
        debug_assert!(!tree.node(root).is_expanded());

        // A known-immediate leaf stays a leaf; revisits answer instantly.
        if tree.node(root).terminal.is_immediate() {
            return tree.node(root).terminal.immediate_value();
        }

        if *state == SimulationState::Working {
            *cache_slot = None;

            let legal = self.pos.legal_moves();
            if legal.is_empty() {
                let terminal = if self.pos.is_check() {
                    TerminalValue::MateIn(1)
                } else {
                    TerminalValue::Draw
                };
                tree.node_mut(root).terminal = terminal;
                return terminal.immediate_value();
            }

            let ply_to_search_root = self.pos.ply() - self.search_root_ply;
            if self.is_draw_by_no_progress_or_repetition(ply_to_search_root) {
                tree.node_mut(root).terminal = TerminalValue::Draw;
                return VALUE_DRAW;
            }

            self.pending_key = self.pos.key();
            self.pending_moves = legal.iter().cloned().collect();
            self.pending_priors.clear();
            self.pending_priors.resize(self.pending_moves.len(), 0.0);

            // Self-play only probes shallow plies: it sees enough unique
            // positions to thrash the cache otherwise. Search keeps
            // everything recent.
            if self.try_hard || self.pos.ply() <= params.prediction_cache_max_ply {
                match cache.probe(
                    self.pending_key,
                    self.pending_moves.len(),
                    &mut self.pending_priors,
                ) {
                    CacheProbe::Hit { value } => {
                        normalise(&mut self.pending_priors);
                        create_children(tree, root, &self.pending_moves, &self.pending_priors);
                        return value;
                    }
                    CacheProbe::Miss(reservation) => *cache_slot = Some(reservation),
                    CacheProbe::Disabled => {}
                }
            }

            slot.image = self.pos.encode_image();
            *state = SimulationState::WaitingForPrediction;
            return f32::NAN;
        }

        // Re-entry: the batched prediction has filled this slot. The network
        // valued the position for its side to move; the node stores it from
        // the parent's perspective.
        let mut value = flip_value(slot.value);

        if !self.try_hard && params.handcraft_evaluation_weight > 0.0 {
            // Guides search and policy targets without touching the value
            // head's training signal, which stays pure game outcome.
            let weight = params.handcraft_evaluation_weight;
            let handcraft = flip_value(self.pos.material_evaluation());
            value = value * (1.0 - weight) + handcraft * weight;
        }

        for (prior, mov) in self.pending_priors.iter_mut().zip(&self.pending_moves) {
            *prior = slot.policy[position::policy_index(mov)];
        }
        softmax(&mut self.pending_priors);

        if self.pending_moves.len() > params.max_branch_moves {
            limit_branching_to_best(
                &mut self.pending_moves,
                &mut self.pending_priors,
                params.max_branch_moves,
            );
            normalise(&mut self.pending_priors);
        }

        if let Some(reservation) = cache_slot.take() {
            cache.store(
                reservation,
                self.pending_key,
                value,
                self.pending_moves.len(),
                &self.pending_priors,
            );
        }

        create_children(tree, root, &self.pending_moves, &self.pending_priors);
        *state = SimulationState::Working;
        value
    }

    /// 50-move rule, or a repetition that either occurred strictly after the
    /// search root or is a third occurrence overall. Pruning twofolds past
    /// the root is sound because the tree is path-dependent, and it spends
    /// the simulation budget on lines that still matter.
    fn is_draw_by_no_progress_or_repetition(&self, ply_to_search_root: u32) -> bool {
        if self.pos.halfmove_clock() > 99 {
            return true;
        }
        let repetition = self.pos.repetition();
        repetition != 0 && repetition < ply_to_search_root as i32
    }

    /// End-of-search move choice: sample by visits below the sampling-ply
    /// threshold in self-play, otherwise take the best child.
    pub fn select_move<R: Rng>(
        &self,
        tree: &Tree,
        params: &SearchParams,
        rng: &mut R,
    ) -> Option<(Move, NodeId)> {
        let root = tree.node(self.root);
        if root.children.is_empty() {
            return None;
        }

        if !self.try_hard && self.pos.ply() < params.num_sampling_moves {
            return self.sample_move(tree, params, rng);
        }

        root.best_child.clone()
    }

    /// Visit-weighted sampling with move-diversity shaping: only children
    /// within the value-delta of the best candidate participate, weighted by
    /// `visits^(1/temperature)`.
    fn sample_move<R: Rng>(
        &self,
        tree: &Tree,
        params: &SearchParams,
        rng: &mut R,
    ) -> Option<(Move, NodeId)> {
        let root = tree.node(self.root);

        let best_value = root
            .children
            .iter()
            .map(|&(_, id)| tree.node(id).value())
            .fold(f32::NEG_INFINITY, f32::max);
        let floor = best_value - params.move_diversity_value_delta_threshold;
        let inverse_temperature = 1.0 / params.move_diversity_temperature.max(1e-3);

        let weights: Vec<f64> = root
            .children
            .iter()
            .map(|&(_, id)| {
                let node = tree.node(id);
                if node.visit_count == 0 || node.value() < floor {
                    0.0
                } else {
                    f64::from(node.visit_count).powf(f64::from(inverse_temperature))
                }
            })
            .collect();

        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return root.best_child.clone();
        }

        let mut sample = rng.gen_range(0.0..total);
        for (pair, weight) in root.children.iter().zip(&weights) {
            if sample < *weight {
                return Some(pair.clone());
            }
            sample -= weight;
        }
        root.children.last().cloned()
    }

    /// Append the root's normalised child-visit distribution; these become
    /// the policy training targets for the move about to be played.
    pub fn store_search_statistics(&mut self, tree: &Tree) {
        let root = tree.node(self.root);
        let total = root.visit_count.max(1) as f32;
        let visits = root
            .children
            .iter()
            .map(|&(ref mov, id)| (mov.clone(), tree.node(id).visit_count as f32 / total))
            .collect();
        self.child_visits.push(visits);
    }

    /// Finish the game: derive the result from the root's terminal value
    /// (flipped from the parent's perspective to the side to move, then to
    /// White), free the whole tree, and hand back the training snapshot.
    pub fn complete(mut self, tree: &mut Tree) -> FinishedGame {
        let to_move_value = flip_value(tree.node(self.root).terminal.immediate_value());
        let result = if self.pos.turn() == position::Color::White {
            to_move_value
        } else {
            flip_value(to_move_value)
        };
        tree.prune_all(self.root);

        FinishedGame {
            result,
            history: std::mem::take(&mut self.history),
            child_visits: std::mem::take(&mut self.child_visits),
        }
    }
}

fn create_children(tree: &mut Tree, parent: NodeId, moves: &[Move], priors: &[f32]) {
    debug_assert_eq!(moves.len(), priors.len());
    let mut children = Vec::with_capacity(moves.len());
    for (mov, &prior) in moves.iter().zip(priors) {
        let child = tree.alloc(Node::new(prior));
        children.push((mov.clone(), child));
    }
    tree.node_mut(parent).children = children;
}

/// In-place softmax over logits.
fn softmax(distribution: &mut [f32]) {
    let max = distribution.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for logit in distribution.iter_mut() {
        *logit = (*logit - max).exp();
        sum += *logit;
    }
    for probability in distribution.iter_mut() {
        *probability /= sum;
    }
}

fn normalise(distribution: &mut [f32]) {
    let sum: f32 = distribution.iter().sum();
    if sum > 0.0 {
        for p in distribution.iter_mut() {
            *p /= sum;
        }
    }
}

/// Keep the `cap` highest-prior moves, preserving generation order within
/// the kept set (ties keep the earlier move).
fn limit_branching_to_best(moves: &mut Vec<Move>, priors: &mut Vec<f32>, cap: usize) {
    debug_assert!(moves.len() > cap);

    let mut order: Vec<usize> = (0..priors.len()).collect();
    order.sort_by(|&a, &b| {
        priors[b]
            .partial_cmp(&priors[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    order.truncate(cap);
    order.sort_unstable();

    let kept_moves: Vec<Move> = order.iter().map(|&i| moves[i].clone()).collect();
    let kept_priors: Vec<f32> = order.iter().map(|&i| priors[i]).collect();
    *moves = kept_moves;
    *priors = kept_priors;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_normalises_and_orders() {
        let mut logits = vec![1.0, 2.0, 3.0];
        softmax(&mut logits);
        let sum: f32 = logits.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(logits[2] > logits[1] && logits[1] > logits[0]);
    }

    #[test]
    fn softmax_handles_large_logits() {
        let mut logits = vec![1000.0, 1000.0];
        softmax(&mut logits);
        assert!((logits[0] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn limit_branching_keeps_top_priors_in_order() {
        let moves: Vec<Move> = GamePosition::startpos()
            .legal_moves()
            .iter()
            .cloned()
            .collect();
        let mut kept_moves = moves[..5].to_vec();
        let mut priors = vec![0.1, 0.4, 0.05, 0.3, 0.15];
        limit_branching_to_best(&mut kept_moves, &mut priors, 3);

        // Top three by prior are indices 1, 3, 4, in original order.
        assert_eq!(priors, vec![0.4, 0.3, 0.15]);
        assert_eq!(kept_moves[0], moves[1]);
        assert_eq!(kept_moves[1], moves[3]);
        assert_eq!(kept_moves[2], moves[4]);
    }

    #[test]
    fn limit_branching_breaks_ties_toward_earlier_moves() {
        let moves: Vec<Move> = GamePosition::startpos()
            .legal_moves()
            .iter()
            .cloned()
            .collect();
        let mut kept_moves = moves[..4].to_vec();
        let mut priors = vec![0.25, 0.25, 0.25, 0.25];
        limit_branching_to_best(&mut kept_moves, &mut priors, 2);
        assert_eq!(kept_moves[0], moves[0]);
        assert_eq!(kept_moves[1], moves[1]);
    }
}
