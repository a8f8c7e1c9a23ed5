//! Position stepping with key history and repetition state.

use shakmaty::fen::Fen;
use shakmaty::san::San;
use shakmaty::uci::UciMove;
use shakmaty::zobrist::{Zobrist64, ZobristHash};
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, Move, MoveList, Position, Role};

use crate::encode::{encode_planes, InputImage};
use crate::PositionError;

/// A chess position plus the history the search needs: Zobrist keys of every
/// position since the game start and a Stockfish-style repetition distance
/// per position.
///
/// The repetition distance for a position is 0 when the position has not
/// occurred before, `d > 0` when the same key occurred `d` plies earlier, and
/// `-d` when that earlier occurrence was itself a repetition (third
/// occurrence overall). The scan is bounded by the halfmove clock, so
/// captures and pawn moves act as barriers.
#[derive(Clone)]
pub struct GamePosition {
    pos: Chess,
    keys: Vec<u64>,
    repetitions: Vec<i32>,
    ply: u32,
}

impl GamePosition {
    /// The standard starting position.
    pub fn startpos() -> Self {
        Self::from_parts(Chess::default())
    }

    pub fn from_fen(fen: &str) -> Result<Self, PositionError> {
        let parsed: Fen = Fen::from_ascii(fen.as_bytes()).map_err(|e| PositionError::InvalidFen {
            fen: fen.to_string(),
            reason: e.to_string(),
        })?;
        let pos: Chess =
            parsed
                .into_position(CastlingMode::Standard)
                .map_err(|e| PositionError::InvalidFen {
                    fen: fen.to_string(),
                    reason: e.to_string(),
                })?;
        Ok(Self::from_parts(pos))
    }

    fn from_parts(pos: Chess) -> Self {
        let ply = (pos.fullmoves().get() - 1) * 2 + u32::from(pos.turn() == Color::Black);
        let key = zobrist_key(&pos);
        Self {
            pos,
            keys: vec![key],
            repetitions: vec![0],
            ply,
        }
    }

    /// Apply a known-legal move.
    pub fn play(&mut self, mov: &Move) {
        self.pos.play_unchecked(mov);
        self.ply += 1;
        self.keys.push(zobrist_key(&self.pos));
        let repetition = self.compute_repetition();
        self.repetitions.push(repetition);
    }

    /// Parse a UCI move string, validate it against this position, and apply.
    pub fn play_uci(&mut self, mov: &str) -> Result<Move, PositionError> {
        let illegal = |_| PositionError::IllegalMove {
            mov: mov.to_string(),
        };
        let uci = UciMove::from_ascii(mov.as_bytes()).map_err(illegal)?;
        let mov = uci.to_move(&self.pos).map_err(|_| PositionError::IllegalMove {
            mov: uci.to_string(),
        })?;
        self.play(&mov);
        Ok(mov)
    }

    /// Resolve a SAN string against this position (strength-test judging).
    pub fn parse_san(&self, san: &str) -> Result<Move, PositionError> {
        let parsed = San::from_ascii(san.as_bytes()).map_err(|_| PositionError::InvalidSan {
            san: san.to_string(),
        })?;
        parsed.to_move(&self.pos).map_err(|_| PositionError::InvalidSan {
            san: san.to_string(),
        })
    }

    pub fn to_uci(&self, mov: &Move) -> String {
        mov.to_uci(CastlingMode::Standard).to_string()
    }

    pub fn legal_moves(&self) -> MoveList {
        self.pos.legal_moves()
    }

    pub fn is_check(&self) -> bool {
        self.pos.is_check()
    }

    pub fn turn(&self) -> Color {
        self.pos.turn()
    }

    /// Halfmoves since the last capture or pawn move (the 50-move clock).
    pub fn halfmove_clock(&self) -> u32 {
        self.pos.halfmoves()
    }

    /// Game ply: halfmoves since the start of the game (not the search root).
    pub fn ply(&self) -> u32 {
        self.ply
    }

    /// Zobrist key of the current position.
    pub fn key(&self) -> u64 {
        *self.keys.last().expect("key history is never empty")
    }

    /// Repetition distance of the current position (see type docs).
    pub fn repetition(&self) -> i32 {
        *self
            .repetitions
            .last()
            .expect("repetition history is never empty")
    }

    /// Input planes for the evaluator.
    pub fn encode_image(&self) -> InputImage {
        encode_planes(&self.pos)
    }

    /// Handcrafted probability-of-win in [0, 1] for the side to move, from
    /// material balance through a logistic squash. Mixed into self-play
    /// expansion with a configurable weight.
    pub fn material_evaluation(&self) -> f32 {
        const VALUES: [(Role, f32); 5] = [
            (Role::Pawn, 1.0),
            (Role::Knight, 3.0),
            (Role::Bishop, 3.0),
            (Role::Rook, 5.0),
            (Role::Queen, 9.0),
        ];

        let board = self.pos.board();
        let mut balance = 0.0f32;
        for (role, value) in VALUES {
            let white = board.by_piece(shakmaty::Piece {
                color: Color::White,
                role,
            });
            let black = board.by_piece(shakmaty::Piece {
                color: Color::Black,
                role,
            });
            balance += value * (white.count() as f32 - black.count() as f32);
        }
        if self.pos.turn() == Color::Black {
            balance = -balance;
        }
        1.0 / (1.0 + (-0.25 * balance).exp())
    }

    fn compute_repetition(&self) -> i32 {
        let cur = self.keys.len() - 1;
        let window = self.pos.halfmoves() as usize;
        let key = self.keys[cur];

        // Same side to move repeats at even distances; 4 is the minimum.
        let mut distance = 4;
        while distance <= window && distance <= cur {
            let earlier = cur - distance;
            if self.keys[earlier] == key {
                return if self.repetitions[earlier] != 0 {
                    -(distance as i32)
                } else {
                    distance as i32
                };
            }
            distance += 2;
        }
        0
    }
}

fn zobrist_key(pos: &Chess) -> u64 {
    let z: Zobrist64 = pos.zobrist_hash(EnPassantMode::Legal);
    z.0
}
