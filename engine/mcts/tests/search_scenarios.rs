//! End-to-end search behaviour on a single worker: mate discovery, tree
//! reuse, repetition handling, cache round-trips, and bookkeeping
//! invariants.

use std::sync::Arc;

use mcts::{
    select_child, EvalSlot, Evaluator, EvaluatorError, Node, SearchParams, SearchSignals,
    SearchWorker, SilentSink, SimulationState, TerminalValue, Tree, UniformEvaluator,
};
use position::{GamePosition, VALUE_DRAW, VALUE_LOSS};
use prediction_cache::PredictionCache;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// Uniform priors, always-losing value (for the side to move).
struct LossEvaluator;

impl Evaluator for LossEvaluator {
    fn predict_batch(&self, slots: &mut [EvalSlot]) -> Result<(), EvaluatorError> {
        for slot in slots {
            slot.value = VALUE_LOSS;
            slot.policy.fill(0.0);
        }
        Ok(())
    }
}

/// Deterministic nonuniform evaluator for cache round-trips.
struct PatternEvaluator;

impl Evaluator for PatternEvaluator {
    fn predict_batch(&self, slots: &mut [EvalSlot]) -> Result<(), EvaluatorError> {
        for slot in slots {
            slot.value = 0.7;
            for (i, logit) in slot.policy.iter_mut().enumerate() {
                *logit = (i % 7) as f32 * 0.3;
            }
        }
        Ok(())
    }
}

fn test_worker(params: SearchParams, cache: Arc<PredictionCache>) -> SearchWorker {
    SearchWorker::new(
        params,
        cache,
        Arc::new(SearchSignals::new()),
        Box::new(SilentSink),
        7,
    )
}

fn run_batches(worker: &mut SearchWorker, evaluator: &dyn Evaluator, batches: usize) {
    let parallelism = worker.params().parallelism;
    for _ in 0..batches {
        worker.search_play(parallelism);
        worker
            .predict(evaluator, parallelism)
            .expect("test evaluators do not fail");
    }
}

#[test]
fn finds_mate_in_one() {
    let params = SearchParams::for_testing().with_parallelism(16);
    let mut worker = test_worker(params, Arc::new(PredictionCache::new()));
    worker
        .set_position(Some("6k1/5ppp/8/8/8/8/5PPP/R5K1 w - - 0 1"), &[], true)
        .unwrap();
    worker.initialize_search(16);

    let mut found = false;
    for _ in 0..200 {
        run_batches(&mut worker, &LossEvaluator, 1);
        let root = worker.game(0).root();
        if let Some((mov, child)) = worker.tree().node(root).best_child.clone() {
            if worker.tree().node(child).terminal == TerminalValue::MateIn(1) {
                assert_eq!(worker.game(0).position().to_uci(&mov), "a1a8");
                found = true;
                break;
            }
        }
    }
    assert!(found, "mate in one was not proven within the budget");

    // The root itself is proven lost-for-opponent and the PV head carries
    // the mate score.
    let root = worker.game(0).root();
    assert_eq!(
        worker.tree().node(root).terminal,
        TerminalValue::OpponentMateIn(1)
    );
    let (_, head) = worker.tree().node(root).best_child.clone().unwrap();
    assert_eq!(worker.tree().node(head).terminal.either_mate_n(), 1);
}

#[test]
fn tree_reuse_preserves_subtree_across_one_ply() {
    let params = SearchParams::for_testing().with_parallelism(8);
    let mut worker = test_worker(params, Arc::new(PredictionCache::new()));
    worker.set_position(None, &[], true).unwrap();
    worker.initialize_search(8);
    run_batches(&mut worker, &UniformEvaluator::new(), 40);

    let root = worker.game(0).root();
    let (mov, child) = worker
        .tree()
        .node(root)
        .best_child
        .clone()
        .expect("search produced a best child");
    let child_visits = worker.tree().node(child).visit_count;
    assert!(child_visits > 0);
    let pv_move = worker.game(0).position().to_uci(&mov);

    worker.extend_position(&[pv_move], 0).unwrap();

    let new_root = worker.game(0).root();
    assert_eq!(new_root, child);
    assert_eq!(
        worker.tree().node(new_root).visit_count,
        child_visits - 1,
        "promotion adjusts the one-time leaf visit"
    );
}

#[test]
fn identical_position_commands_are_idempotent() {
    let params = SearchParams::for_testing().with_parallelism(8);
    let mut worker = test_worker(params, Arc::new(PredictionCache::new()));
    let moves = vec!["e2e4".to_string(), "e7e5".to_string()];
    worker.set_position(None, &moves, true).unwrap();
    worker.initialize_search(8);
    run_batches(&mut worker, &UniformEvaluator::new(), 20);

    let root = worker.game(0).root();
    let visits = worker.tree().node(root).visit_count;
    let best = worker.tree().node(root).best_child.clone();

    // Re-sending the identical move list is a no-op extension.
    worker.extend_position(&moves, moves.len()).unwrap();

    assert_eq!(worker.game(0).root(), root);
    assert_eq!(worker.tree().node(root).visit_count, visits);
    assert_eq!(
        worker.tree().node(root).best_child.clone().map(|(_, id)| id),
        best.map(|(_, id)| id)
    );
}

#[test]
fn rejected_moves_leave_the_position_untouched() {
    let params = SearchParams::for_testing().with_parallelism(4);
    let mut worker = test_worker(params, Arc::new(PredictionCache::new()));
    worker
        .set_position(None, &["e2e4".to_string()], true)
        .unwrap();
    let root = worker.game(0).root();
    let key = worker.game(0).position().key();

    assert!(worker
        .set_position(None, &["e2e4".to_string(), "e2e4".to_string()], true)
        .is_err());
    assert!(worker
        .extend_position(&["e7e5".to_string(), "banana".to_string()], 0)
        .is_err());

    assert_eq!(worker.game(0).root(), root);
    assert_eq!(worker.game(0).position().key(), key);
}

#[test]
fn twofold_after_search_root_is_a_draw_leaf() {
    // e2e4 d7d6 d1g4 g8f6 g4d1 f6g8 d1g4: the final position repeats the
    // one after the first d1g4, four plies earlier.
    let uci_moves = ["e2e4", "d7d6", "d1g4", "g8f6", "g4d1", "f6g8", "d1g4"];

    let cache = Arc::new(PredictionCache::new());
    let params = SearchParams::for_testing();

    // Search root at the starting position: the repetition lies strictly
    // inside the search, so the leaf is a draw without a network call.
    let mut tree = Tree::new();
    let mut game = mcts::SearchGame::startpos(true, &mut tree);
    let mut replay = GamePosition::startpos();
    for mov in uci_moves {
        let parsed = replay.play_uci(mov).unwrap();
        let child = tree.alloc(Node::new(0.0));
        game.apply_move_with_root(&parsed, child);
    }
    let mut slot = EvalSlot::default();
    let mut state = SimulationState::Working;
    let mut reservation = None;
    let value = game.expand_and_evaluate(
        &mut tree,
        &mut slot,
        &mut state,
        &mut reservation,
        &cache,
        &params,
    );
    assert_eq!(state, SimulationState::Working);
    assert_eq!(value, VALUE_DRAW);
    assert_eq!(tree.node(game.root()).terminal, TerminalValue::Draw);

    // Search root two plies before the end: only one occurrence lies past
    // the root, so the leaf goes to the network instead.
    let mut start = GamePosition::startpos();
    for mov in &uci_moves[..4] {
        start.play_uci(mov).unwrap();
    }
    let mut tree = Tree::new();
    let mut game = mcts::SearchGame::from_position(start.clone(), true, &mut tree);
    let mut replay = start;
    for mov in &uci_moves[4..] {
        let parsed = replay.play_uci(mov).unwrap();
        let child = tree.alloc(Node::new(0.0));
        game.apply_move_with_root(&parsed, child);
    }
    let mut state = SimulationState::Working;
    let mut reservation = None;
    let value = game.expand_and_evaluate(
        &mut tree,
        &mut slot,
        &mut state,
        &mut reservation,
        &cache,
        &params,
    );
    assert_eq!(state, SimulationState::WaitingForPrediction);
    assert!(value.is_nan());
    assert_eq!(tree.node(game.root()).terminal, TerminalValue::NonTerminal);
}

#[test]
fn stalemate_and_checkmate_leaves_need_no_network() {
    let cache = Arc::new(PredictionCache::new());
    let params = SearchParams::for_testing();

    // Black to move, stalemated.
    let mut tree = Tree::new();
    let stalemate = GamePosition::from_fen("7k/5Q2/6K1/8/8/8/8/8 b - - 0 1").unwrap();
    let mut game = mcts::SearchGame::from_position(stalemate, true, &mut tree);
    let mut slot = EvalSlot::default();
    let mut state = SimulationState::Working;
    let mut reservation = None;
    let value = game.expand_and_evaluate(
        &mut tree,
        &mut slot,
        &mut state,
        &mut reservation,
        &cache,
        &params,
    );
    assert_eq!(state, SimulationState::Working);
    assert_eq!(value, VALUE_DRAW);
    assert_eq!(tree.node(game.root()).terminal, TerminalValue::Draw);

    // Black to move, checkmated: a win for the side that just moved.
    let mut tree = Tree::new();
    let mated = GamePosition::from_fen("R5k1/5ppp/8/8/8/8/8/6K1 b - - 0 1").unwrap();
    let mut game = mcts::SearchGame::from_position(mated, true, &mut tree);
    let mut state = SimulationState::Working;
    let mut reservation = None;
    let value = game.expand_and_evaluate(
        &mut tree,
        &mut slot,
        &mut state,
        &mut reservation,
        &cache,
        &params,
    );
    assert_eq!(state, SimulationState::Working);
    assert_eq!(value, 1.0);
    assert_eq!(tree.node(game.root()).terminal, TerminalValue::MateIn(1));
}

#[test]
fn cache_round_trip_matches_fresh_expansion() {
    let cache = Arc::new(PredictionCache::new());
    cache.allocate(1).unwrap();
    let params = SearchParams::for_testing();
    let evaluator = PatternEvaluator;

    let expand = |cache: &Arc<PredictionCache>| -> (f32, Vec<f32>) {
        let mut tree = Tree::new();
        let mut game =
            mcts::SearchGame::from_position(GamePosition::startpos(), true, &mut tree);
        let mut slot = EvalSlot::default();
        let mut state = SimulationState::Working;
        let mut reservation = None;
        let first = game.expand_and_evaluate(
            &mut tree,
            &mut slot,
            &mut state,
            &mut reservation,
            cache,
            &params,
        );
        let value = if state == SimulationState::WaitingForPrediction {
            evaluator.predict_batch(std::slice::from_mut(&mut slot)).unwrap();
            game.expand_and_evaluate(
                &mut tree,
                &mut slot,
                &mut state,
                &mut reservation,
                cache,
                &params,
            )
        } else {
            first
        };
        let priors = tree
            .node(game.root())
            .children
            .iter()
            .map(|&(_, id)| tree.node(id).prior)
            .collect();
        (value, priors)
    };

    let (fresh_value, fresh_priors) = expand(&cache);
    let (cached_value, cached_priors) = expand(&cache);

    assert!((fresh_value - cached_value).abs() < 1e-6);
    assert_eq!(fresh_priors.len(), cached_priors.len());
    for (a, b) in fresh_priors.iter().zip(&cached_priors) {
        assert!((a - b).abs() <= 1.0 / 255.0 + 1e-4);
    }
    let sum: f32 = cached_priors.iter().sum();
    assert!((sum - 1.0).abs() < 1e-4);
}

#[test]
fn priors_sum_to_one_after_expansion() {
    let params = SearchParams::for_testing().with_parallelism(8);
    let mut worker = test_worker(params, Arc::new(PredictionCache::new()));
    worker.set_position(None, &[], true).unwrap();
    worker.initialize_search(8);
    run_batches(&mut worker, &PatternEvaluator, 30);

    let tree = worker.tree();
    let mut stack = vec![worker.game(0).root()];
    let mut expanded = 0;
    while let Some(id) = stack.pop() {
        let node = tree.node(id);
        if node.is_expanded() {
            expanded += 1;
            let sum: f32 = node
                .children
                .iter()
                .map(|&(_, child)| tree.node(child).prior)
                .sum();
            assert!((sum - 1.0).abs() < 1e-4, "prior sum {sum}");
            assert!(
                node.terminal == TerminalValue::NonTerminal,
                "terminal nodes must not have children"
            );
            stack.extend(node.children.iter().map(|&(_, child)| child));
        }
    }
    assert!(expanded > 1);
}

#[test]
fn wide_positions_are_capped_to_the_branching_limit() {
    // 218 legal moves for white, the classic composed maximum.
    let fen = "R6R/3Q4/1Q4Q1/4Q3/2Q4Q/Q4Q2/pp1Q4/kBNN1KB1 w - - 0 1";
    let cache = Arc::new(PredictionCache::new());
    cache.allocate(1).unwrap();
    let params = SearchParams::for_testing();

    let mut tree = Tree::new();
    let wide = GamePosition::from_fen(fen).unwrap();
    assert!(wide.legal_moves().len() > 52);
    let mut game = mcts::SearchGame::from_position(wide, true, &mut tree);

    let mut slot = EvalSlot::default();
    let mut state = SimulationState::Working;
    let mut reservation = None;
    let value = game.expand_and_evaluate(
        &mut tree,
        &mut slot,
        &mut state,
        &mut reservation,
        &cache,
        &params,
    );
    assert!(value.is_nan());
    assert_eq!(state, SimulationState::WaitingForPrediction);

    PatternEvaluator
        .predict_batch(std::slice::from_mut(&mut slot))
        .unwrap();
    let value = game.expand_and_evaluate(
        &mut tree,
        &mut slot,
        &mut state,
        &mut reservation,
        &cache,
        &params,
    );
    assert!(!value.is_nan());

    let root = tree.node(game.root());
    assert_eq!(root.children.len(), 52);
    let sum: f32 = root
        .children
        .iter()
        .map(|&(_, id)| tree.node(id).prior)
        .sum();
    assert!((sum - 1.0).abs() < 1e-4);
}

#[test]
fn bookkeeping_is_clean_after_a_drained_search() {
    let params = SearchParams::for_testing().with_parallelism(8);
    let mut worker = test_worker(params, Arc::new(PredictionCache::new()));
    worker.set_position(None, &[], true).unwrap();

    let best = worker
        .run_timed_search(&UniformEvaluator::new(), 50)
        .unwrap();
    assert!(best.is_some());
    assert!(worker.search_state().node_count > 0);

    let root = worker.game(0).root();
    assert!(worker.tree().visit_counts_consistent(root));
    assert!(worker
        .tree()
        .is_principal_variation_valid(root, worker.params().max_moves));
}

#[test]
fn selection_skips_expanding_children_and_can_fail() {
    let params = SearchParams::for_testing();
    let mut tree = Tree::new();
    let root = tree.alloc(Node::new(0.0));
    let moves = GamePosition::startpos().legal_moves();
    for i in 0..2 {
        let child = tree.alloc(Node::new(0.5));
        tree.node_mut(root).children.push((moves[i].clone(), child));
    }
    let first = tree.node(root).children[0].1;
    let second = tree.node(root).children[1].1;

    tree.node_mut(first).expanding = true;
    let picked = select_child(&tree, root, &params).map(|(_, id)| id);
    assert_eq!(picked, Some(second));

    tree.node_mut(second).expanding = true;
    assert!(select_child(&tree, root, &params).is_none());
}

#[test]
fn sampling_follows_visit_distribution_below_threshold() {
    let params = SearchParams::for_testing();
    let mut tree = Tree::new();
    let game = mcts::SearchGame::startpos(false, &mut tree);
    let moves = GamePosition::startpos().legal_moves();

    let visits = [10u32, 30, 60];
    for (i, &count) in visits.iter().enumerate() {
        let child = tree.alloc(Node::new(0.3));
        let node = tree.node_mut(child);
        node.visit_count = count;
        node.value_sum = count as f32 * 0.5;
        tree.node_mut(game.root())
            .children
            .push((moves[i].clone(), child));
    }
    tree.node_mut(game.root()).visit_count = 100;

    let mut counts = [0u32; 3];
    let mut rng = ChaCha20Rng::seed_from_u64(11);
    for _ in 0..3000 {
        let (mov, _) = game.select_move(&tree, &params, &mut rng).unwrap();
        let index = moves.iter().position(|m| *m == mov).unwrap();
        counts[index] += 1;
    }

    // Roughly 10% / 30% / 60%.
    assert!(counts[0] > 150 && counts[0] < 450);
    assert!(counts[1] > 700 && counts[1] < 1100);
    assert!(counts[2] > 1500 && counts[2] < 2100);

    // A try-hard game at the same node always takes the best child.
    let mut tree_hard = Tree::new();
    let game_hard = mcts::SearchGame::startpos(true, &mut tree_hard);
    let best_child = tree_hard.alloc(Node::new(0.5));
    tree_hard.node_mut(best_child).visit_count = 60;
    let other = tree_hard.alloc(Node::new(0.5));
    tree_hard.node_mut(other).visit_count = 40;
    tree_hard
        .node_mut(game_hard.root())
        .children
        .push((moves[0].clone(), best_child));
    tree_hard
        .node_mut(game_hard.root())
        .children
        .push((moves[1].clone(), other));
    tree_hard.node_mut(game_hard.root()).best_child = Some((moves[0].clone(), best_child));

    for _ in 0..50 {
        let (mov, _) = game_hard.select_move(&tree_hard, &params, &mut rng).unwrap();
        assert_eq!(mov, moves[0]);
    }
}
