//! Batched position evaluator.
//!
//! The network is a pluggable capability: it receives a batch of encoded
//! positions and fills in a value and policy logits per slot. Real networks
//! live outside this crate; [`UniformEvaluator`] stands in for tests and as
//! the bundled default.

use position::{InputImage, INPUT_PLANES, POLICY_SIZE, VALUE_DRAW};
use thiserror::Error;

/// Errors from the external evaluator. The search aborts, emits a
/// best-effort `bestmove`, and returns to idle.
#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("evaluation failed: {0}")]
    EvaluationFailed(String),

    #[error("evaluator returned an inconsistent shape: {0}")]
    BadShape(String),
}

/// One batch slot: the worker writes `image`, the evaluator fills `value`
/// (probability of a win for the side to move in the encoded position) and
/// `policy` logits indexed by [`position::policy_index`].
pub struct EvalSlot {
    pub image: InputImage,
    pub value: f32,
    pub policy: Vec<f32>,
}

impl Default for EvalSlot {
    fn default() -> Self {
        Self {
            image: [0; INPUT_PLANES],
            value: VALUE_DRAW,
            policy: vec![0.0; POLICY_SIZE],
        }
    }
}

/// Batched value + policy prediction.
///
/// The call blocks the worker thread for its duration; slots not currently
/// awaiting a prediction carry stale images and their results are ignored.
pub trait Evaluator: Send + Sync {
    fn predict_batch(&self, slots: &mut [EvalSlot]) -> Result<(), EvaluatorError>;

    /// One throwaway batch to absorb cold-start cost before timed search.
    fn warm_up(&self, slots: &mut [EvalSlot]) -> Result<(), EvaluatorError> {
        self.predict_batch(slots)
    }
}

/// Uniform stand-in: zero logits (softmax gives equal priors over legal
/// moves) and a drawn value. Deterministic, which the test suite relies on.
#[derive(Debug, Clone, Default)]
pub struct UniformEvaluator;

impl UniformEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl Evaluator for UniformEvaluator {
    fn predict_batch(&self, slots: &mut [EvalSlot]) -> Result<(), EvaluatorError> {
        for slot in slots {
            slot.value = VALUE_DRAW;
            slot.policy.fill(0.0);
        }
        Ok(())
    }
}
