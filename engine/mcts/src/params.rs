//! Search tuning parameters.

/// Every knob the search consumes. A flat record handed to the worker at
/// construction; UCI `setoption` changes apply on the next search.
#[derive(Debug, Clone)]
pub struct SearchParams {
    /// Simulations per move in self-play, and the fallback budget when no
    /// time control is derivable in search.
    pub num_simulations: u32,

    /// Self-play samples moves (temperature-weighted by visits) below this
    /// game ply; at or above it, the best child is played.
    pub num_sampling_moves: u32,

    /// Self-play games are adjudicated drawn at this game ply.
    pub max_moves: u32,

    /// Exploration rate: `ln((N + base + 1) / base) + init`, AlphaZero's
    /// visit-growing coefficient.
    pub exploration_rate_base: f32,
    pub exploration_rate_init: f32,

    /// Weight on `visiting_count` when computing virtual exploration totals.
    pub virtual_loss_coefficient: f32,

    /// Root Dirichlet noise (self-play only).
    pub root_dirichlet_alpha: f32,
    pub root_exploration_fraction: f32,

    /// Children kept per expansion; positions above this are trimmed to the
    /// top priors (and only then are cache-sized).
    pub max_branch_moves: usize,

    /// Self-play probes the prediction cache only up to this game ply;
    /// search probes at every ply.
    pub prediction_cache_max_ply: u32,

    /// Batch slots sharing one tree inside a worker.
    pub parallelism: usize,

    /// Worker threads during search (thread 0 owns the reported tree).
    pub search_threads: usize,

    /// Game-clock budgeting: spend `remaining / fraction + increment`,
    /// guarded by per-move and overall safety buffers.
    pub time_fraction_of_remaining: u32,
    pub safety_buffer_move_ms: u64,
    pub safety_buffer_overall_ms: u64,

    /// Weight of the handcrafted material evaluation mixed into the network
    /// value at self-play expansion; 0 disables the mix-in.
    pub handcraft_evaluation_weight: f32,

    /// Move-diversity sampling: only children within this value delta of the
    /// best are sampled, with visits raised to `1/temperature`.
    pub move_diversity_value_delta_threshold: f32,
    pub move_diversity_temperature: f32,

    /// Inner simulation budget per `run_mcts` call during search; bounds
    /// time between PV/time-control checks while still amortising cache
    /// hits.
    pub search_simulation_block: u32,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            num_simulations: 800,
            num_sampling_moves: 30,
            max_moves: 512,
            exploration_rate_base: 19652.0,
            exploration_rate_init: 1.25,
            virtual_loss_coefficient: 1.0,
            root_dirichlet_alpha: 0.3,
            root_exploration_fraction: 0.25,
            max_branch_moves: prediction_cache::MAX_CACHE_MOVES,
            prediction_cache_max_ply: 30,
            parallelism: 256,
            search_threads: 2,
            time_fraction_of_remaining: 20,
            safety_buffer_move_ms: 100,
            safety_buffer_overall_ms: 1000,
            handcraft_evaluation_weight: 0.5,
            move_diversity_value_delta_threshold: 1.0,
            move_diversity_temperature: 1.0,
            search_simulation_block: 1000,
        }
    }
}

impl SearchParams {
    /// Small, deterministic preset for tests.
    pub fn for_testing() -> Self {
        Self {
            num_simulations: 64,
            num_sampling_moves: 4,
            max_moves: 60,
            parallelism: 8,
            search_threads: 1,
            handcraft_evaluation_weight: 0.0,
            ..Self::default()
        }
    }

    pub fn with_simulations(mut self, n: u32) -> Self {
        self.num_simulations = n;
        self
    }

    pub fn with_parallelism(mut self, n: usize) -> Self {
        self.parallelism = n;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_paper_constants() {
        let params = SearchParams::default();
        assert_eq!(params.num_simulations, 800);
        assert!((params.exploration_rate_init - 1.25).abs() < 1e-6);
        assert!((params.root_exploration_fraction - 0.25).abs() < 1e-6);
        assert_eq!(params.max_branch_moves, 52);
    }

    #[test]
    fn builders_override_fields() {
        let params = SearchParams::for_testing()
            .with_simulations(16)
            .with_parallelism(2);
        assert_eq!(params.num_simulations, 16);
        assert_eq!(params.parallelism, 2);
    }
}
