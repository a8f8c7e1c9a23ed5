//! Chess rules adapter for the search core.
//!
//! Wraps `shakmaty` behind the narrow surface the search needs: position
//! stepping with Zobrist key history (for repetition detection relative to a
//! search root), move parsing in UCI and SAN notation, and the encodings that
//! form the evaluator contract (input image planes, flat policy indexing,
//! value/centipawn conversions).

mod encode;
mod game;

pub use encode::{
    centipawns, flip_value, policy_index, InputImage, INPUT_PLANES, POLICY_SIZE, VALUE_DRAW,
    VALUE_LOSS, VALUE_WIN,
};
pub use game::GamePosition;

pub use shakmaty::{Color, Move, MoveList, Role, Square};

use thiserror::Error;

/// Errors from position construction and move parsing.
///
/// These are input-validation failures: the caller rejects the offending
/// command and keeps its previous state.
#[derive(Debug, Error)]
pub enum PositionError {
    #[error("invalid FEN '{fen}': {reason}")]
    InvalidFen { fen: String, reason: String },

    #[error("illegal or malformed move '{mov}'")]
    IllegalMove { mov: String },

    #[error("unparseable SAN '{san}'")]
    InvalidSan { san: String },
}

/// FEN of the standard starting position.
pub const STARTING_POSITION: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";
