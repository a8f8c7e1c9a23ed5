//! The engine's UCI option surface.
//!
//! Options are declared with their types and ranges, printed in response to
//! `uci`, and validated on `setoption`. Values apply to the next search:
//! the worker pool is rebuilt with fresh parameters once the engine is idle.
//! A few options (network selection, syzygy path, some tuning scalars) are
//! recorded for collaborator components rather than consumed by the search
//! itself.

use mcts::SearchParams;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub network_type: String,
    pub network_weights: String,
    pub search_threads: usize,
    pub search_parallelism: usize,
    pub fraction_of_remaining: u32,
    pub safety_buffer_move_milliseconds: u64,
    pub safety_buffer_overall_milliseconds: u64,
    /// Prediction cache size in MiB (`Hash` in UCI terms).
    pub hash_mib: u64,
    pub exploration_rate_init: f32,
    pub exploration_rate_base: f32,
    pub virtual_loss_coefficient: f32,
    pub moving_average_build: f32,
    pub moving_average_cap: f32,
    pub backpropagation_puct_threshold: f32,
    pub move_diversity_value_delta_threshold: f32,
    pub move_diversity_temperature: f32,
    pub minimax_visits_ignore: f32,
    pub elimination_base_exponent: i64,
    pub move_diversity_plies: u32,
    pub transposition_progress_threshold: i64,
    pub progress_decay_divisor: i64,
    pub minimax_material_maximum: i64,
    pub minimax_visits_recurse: i64,
    pub syzygy: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        let params = SearchParams::default();
        Self {
            network_type: "teacher".to_string(),
            network_weights: String::new(),
            search_threads: params.search_threads,
            search_parallelism: params.parallelism,
            fraction_of_remaining: params.time_fraction_of_remaining,
            safety_buffer_move_milliseconds: params.safety_buffer_move_ms,
            safety_buffer_overall_milliseconds: params.safety_buffer_overall_ms,
            hash_mib: 256,
            exploration_rate_init: params.exploration_rate_init,
            exploration_rate_base: params.exploration_rate_base,
            virtual_loss_coefficient: params.virtual_loss_coefficient,
            moving_average_build: 1.0,
            moving_average_cap: 1.0,
            backpropagation_puct_threshold: 0.0,
            move_diversity_value_delta_threshold: params.move_diversity_value_delta_threshold,
            move_diversity_temperature: params.move_diversity_temperature,
            minimax_visits_ignore: 0.0,
            elimination_base_exponent: 0,
            move_diversity_plies: params.num_sampling_moves,
            transposition_progress_threshold: 0,
            progress_decay_divisor: 1,
            minimax_material_maximum: 0,
            minimax_visits_recurse: 0,
            syzygy: String::new(),
        }
    }
}

impl EngineOptions {
    /// Search parameters derived from the current option values.
    pub fn to_params(&self) -> SearchParams {
        SearchParams {
            num_sampling_moves: self.move_diversity_plies,
            exploration_rate_base: self.exploration_rate_base,
            exploration_rate_init: self.exploration_rate_init,
            virtual_loss_coefficient: self.virtual_loss_coefficient,
            parallelism: self.search_parallelism,
            search_threads: self.search_threads,
            time_fraction_of_remaining: self.fraction_of_remaining,
            safety_buffer_move_ms: self.safety_buffer_move_milliseconds,
            safety_buffer_overall_ms: self.safety_buffer_overall_milliseconds,
            move_diversity_value_delta_threshold: self.move_diversity_value_delta_threshold,
            move_diversity_temperature: self.move_diversity_temperature,
            ..SearchParams::default()
        }
    }

    /// `option name … type … default …` lines for the `uci` reply.
    pub fn declarations(&self) -> Vec<String> {
        let spin =
            |name: &str, default: i64, min: i64, max: i64| {
                format!("option name {name} type spin default {default} min {min} max {max}")
            };
        let string =
            |name: &str, default: &str| format!("option name {name} type string default {default}");

        vec![
            string("network_type", &self.network_type),
            string("network_weights", &self.network_weights),
            spin("search_threads", self.search_threads as i64, 1, 256),
            spin(
                "search_parallelism",
                self.search_parallelism as i64,
                1,
                4096,
            ),
            spin(
                "fraction_of_remaining",
                i64::from(self.fraction_of_remaining),
                5,
                100,
            ),
            spin(
                "safety_buffer_move_milliseconds",
                self.safety_buffer_move_milliseconds as i64,
                0,
                5000,
            ),
            spin(
                "safety_buffer_overall_milliseconds",
                self.safety_buffer_overall_milliseconds as i64,
                0,
                30000,
            ),
            spin("Hash", self.hash_mib as i64, 0, 262_144),
            string(
                "exploration_rate_init",
                &self.exploration_rate_init.to_string(),
            ),
            string(
                "exploration_rate_base",
                &self.exploration_rate_base.to_string(),
            ),
            string(
                "virtual_loss_coefficient",
                &self.virtual_loss_coefficient.to_string(),
            ),
            string(
                "moving_average_build",
                &self.moving_average_build.to_string(),
            ),
            string("moving_average_cap", &self.moving_average_cap.to_string()),
            string(
                "backpropagation_puct_threshold",
                &self.backpropagation_puct_threshold.to_string(),
            ),
            string(
                "move_diversity_value_delta_threshold",
                &self.move_diversity_value_delta_threshold.to_string(),
            ),
            string(
                "move_diversity_temperature",
                &self.move_diversity_temperature.to_string(),
            ),
            string(
                "minimax_visits_ignore",
                &self.minimax_visits_ignore.to_string(),
            ),
            spin(
                "elimination_base_exponent",
                self.elimination_base_exponent,
                0,
                64,
            ),
            spin(
                "move_diversity_plies",
                i64::from(self.move_diversity_plies),
                0,
                512,
            ),
            spin(
                "transposition_progress_threshold",
                self.transposition_progress_threshold,
                0,
                1_000_000,
            ),
            spin("progress_decay_divisor", self.progress_decay_divisor, 1, 1_000_000),
            spin(
                "minimax_material_maximum",
                self.minimax_material_maximum,
                0,
                128,
            ),
            spin(
                "minimax_visits_recurse",
                self.minimax_visits_recurse,
                0,
                1_000_000,
            ),
            string("syzygy", &self.syzygy),
        ]
    }

    /// Apply `setoption name <name> value <value>`. Returns an error message
    /// for unknown names, parse failures, or out-of-range values.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), String> {
        fn spin<T>(value: &str, min: i64, max: i64) -> Result<T, String>
        where
            T: TryFrom<i64>,
        {
            let parsed: i64 = value
                .trim()
                .parse()
                .map_err(|_| format!("expected an integer, got '{value}'"))?;
            if parsed < min || parsed > max {
                return Err(format!("value {parsed} out of range {min}..{max}"));
            }
            T::try_from(parsed).map_err(|_| format!("value {parsed} does not fit"))
        }

        fn float(value: &str) -> Result<f32, String> {
            let parsed: f32 = value
                .trim()
                .parse()
                .map_err(|_| format!("expected a number, got '{value}'"))?;
            if !parsed.is_finite() {
                return Err(format!("value '{value}' is not finite"));
            }
            Ok(parsed)
        }

        match name {
            "network_type" => match value {
                "teacher" | "student" => self.network_type = value.to_string(),
                other => return Err(format!("network_type must be teacher or student, got '{other}'")),
            },
            "network_weights" => self.network_weights = value.to_string(),
            "search_threads" => self.search_threads = spin::<u16>(value, 1, 256)? as usize,
            "search_parallelism" => {
                self.search_parallelism = spin::<u16>(value, 1, 4096)? as usize
            }
            "fraction_of_remaining" => {
                self.fraction_of_remaining = spin::<u32>(value, 5, 100)?
            }
            "safety_buffer_move_milliseconds" => {
                self.safety_buffer_move_milliseconds = spin::<u64>(value, 0, 5000)?
            }
            "safety_buffer_overall_milliseconds" => {
                self.safety_buffer_overall_milliseconds = spin::<u64>(value, 0, 30000)?
            }
            "Hash" => self.hash_mib = spin::<u64>(value, 0, 262_144)?,
            "exploration_rate_init" => self.exploration_rate_init = float(value)?,
            "exploration_rate_base" => self.exploration_rate_base = float(value)?,
            "virtual_loss_coefficient" => self.virtual_loss_coefficient = float(value)?,
            "moving_average_build" => self.moving_average_build = float(value)?,
            "moving_average_cap" => self.moving_average_cap = float(value)?,
            "backpropagation_puct_threshold" => {
                self.backpropagation_puct_threshold = float(value)?
            }
            "move_diversity_value_delta_threshold" => {
                self.move_diversity_value_delta_threshold = float(value)?
            }
            "move_diversity_temperature" => self.move_diversity_temperature = float(value)?,
            "minimax_visits_ignore" => self.minimax_visits_ignore = float(value)?,
            "elimination_base_exponent" => {
                self.elimination_base_exponent = spin::<i64>(value, 0, 64)?
            }
            "move_diversity_plies" => self.move_diversity_plies = spin::<u32>(value, 0, 512)?,
            "transposition_progress_threshold" => {
                self.transposition_progress_threshold = spin::<i64>(value, 0, 1_000_000)?
            }
            "progress_decay_divisor" => {
                self.progress_decay_divisor = spin::<i64>(value, 1, 1_000_000)?
            }
            "minimax_material_maximum" => {
                self.minimax_material_maximum = spin::<i64>(value, 0, 128)?
            }
            "minimax_visits_recurse" => {
                self.minimax_visits_recurse = spin::<i64>(value, 0, 1_000_000)?
            }
            "syzygy" => self.syzygy = value.to_string(),
            unknown => return Err(format!("unknown option '{unknown}'")),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declarations_cover_every_option() {
        let options = EngineOptions::default();
        let declarations = options.declarations();
        assert_eq!(declarations.len(), 24);
        assert!(declarations
            .iter()
            .any(|line| line == "option name Hash type spin default 256 min 0 max 262144"));
        assert!(declarations
            .iter()
            .any(|line| line.starts_with("option name network_type type string")));
    }

    #[test]
    fn set_validates_ranges() {
        let mut options = EngineOptions::default();
        assert!(options.set("search_threads", "4").is_ok());
        assert_eq!(options.search_threads, 4);

        assert!(options.set("search_threads", "0").is_err());
        assert!(options.set("search_threads", "257").is_err());
        assert!(options.set("fraction_of_remaining", "4").is_err());
        assert!(options.set("Hash", "notanumber").is_err());
        assert!(options.set("nonsense", "1").is_err());
        assert!(options.set("network_type", "oracle").is_err());
    }

    #[test]
    fn float_options_parse() {
        let mut options = EngineOptions::default();
        options.set("exploration_rate_init", "1.5").unwrap();
        assert!((options.exploration_rate_init - 1.5).abs() < 1e-6);
        assert!(options.set("exploration_rate_init", "inf").is_err());
    }

    #[test]
    fn params_reflect_options() {
        let mut options = EngineOptions::default();
        options.set("search_parallelism", "64").unwrap();
        options.set("move_diversity_plies", "10").unwrap();
        let params = options.to_params();
        assert_eq!(params.parallelism, 64);
        assert_eq!(params.num_sampling_moves, 10);
    }
}
