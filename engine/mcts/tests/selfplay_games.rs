//! Full self-play games on one worker: sampling, statistics collection,
//! completion, and node recycling.

use std::sync::Arc;

use mcts::{SearchParams, SearchSignals, SearchWorker, SilentSink, SimulationState, UniformEvaluator};
use prediction_cache::PredictionCache;

#[test]
fn plays_complete_games_and_recycles_nodes() {
    let params = SearchParams {
        num_simulations: 24,
        num_sampling_moves: 6,
        max_moves: 40,
        parallelism: 2,
        handcraft_evaluation_weight: 0.5,
        ..SearchParams::for_testing()
    };
    let batch = params.parallelism;
    let cache = Arc::new(PredictionCache::new());
    cache.allocate(1).unwrap();

    let mut worker = SearchWorker::new(
        params,
        cache,
        Arc::new(SearchSignals::new()),
        Box::new(SilentSink),
        42,
    );
    let evaluator = UniformEvaluator::new();

    let mut finished = Vec::new();
    let target = 3;
    while finished.len() < target {
        for index in 0..batch {
            worker.play_step(index);
            while worker.state(index) == SimulationState::Finished && finished.len() < target {
                finished.push(worker.take_finished_game(index));
                worker.play_step(index);
            }
        }
        worker.predict(&evaluator, batch).unwrap();
    }

    for game in &finished {
        assert!(
            game.result == 0.0 || game.result == 0.5 || game.result == 1.0,
            "result {}",
            game.result
        );
        assert!(!game.history.is_empty());
        assert_eq!(game.child_visits.len(), game.history.len());
        for distribution in &game.child_visits {
            let sum: f32 = distribution.iter().map(|&(_, share)| share).sum();
            assert!((sum - 1.0).abs() < 1e-3, "visit share sum {sum}");
        }
    }

    // Completed games release their whole subtree; what's left is the live
    // games' trees.
    let live_roots: usize = (0..batch)
        .map(|index| {
            let mut stack = vec![worker.game(index).root()];
            let mut count = 0;
            while let Some(id) = stack.pop() {
                count += 1;
                stack.extend(
                    worker
                        .tree()
                        .node(id)
                        .children
                        .iter()
                        .map(|&(_, child)| child),
                );
            }
            count
        })
        .sum();
    assert_eq!(worker.tree().live_count(), live_roots);
}
