//! Evaluator contract: input planes, flat policy indexing, value scales.

use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, Move, Position, Role};

/// Number of `u64` bitplanes in an input image.
pub const INPUT_PLANES: usize = 16;

/// Network input: 12 piece planes (white then black, pawn through king),
/// side-to-move plane, castling-rights plane, en-passant plane, and the
/// halfmove clock saturated at 99 in the final word.
pub type InputImage = [u64; INPUT_PLANES];

/// Flat policy head size: a 64x64 from/to grid plus 3 under-promotion roles
/// by 3 file deltas by 64 target squares.
pub const POLICY_SIZE: usize = 64 * 64 + 3 * 3 * 64;

/// Value scale: probability of a win for the relevant perspective.
pub const VALUE_WIN: f32 = 1.0;
pub const VALUE_DRAW: f32 = 0.5;
pub const VALUE_LOSS: f32 = 0.0;

/// Flip a probability-of-win to the other side's perspective.
#[inline]
pub fn flip_value(value: f32) -> f32 {
    1.0 - value
}

pub(crate) fn encode_planes(pos: &Chess) -> InputImage {
    let mut image = [0u64; INPUT_PLANES];
    let board = pos.board();

    let roles = [
        Role::Pawn,
        Role::Knight,
        Role::Bishop,
        Role::Rook,
        Role::Queen,
        Role::King,
    ];
    for (i, role) in roles.into_iter().enumerate() {
        image[i] = board.by_piece(shakmaty::Piece {
            color: Color::White,
            role,
        })
        .0;
        image[6 + i] = board.by_piece(shakmaty::Piece {
            color: Color::Black,
            role,
        })
        .0;
    }

    if pos.turn() == Color::Black {
        image[12] = !0;
    }
    image[13] = pos.castles().castling_rights().0;
    if let Some(sq) = pos.ep_square(EnPassantMode::Legal) {
        image[14] = 1u64 << sq as u64;
    }
    image[15] = u64::from(pos.halfmoves().min(99));

    image
}

/// Index of a move in the flat policy vector.
///
/// Normal moves (queen promotions included) use the from/to grid; knight,
/// bishop and rook promotions get their own block keyed by promotion role
/// and capture direction. Castling is indexed by the king's from/to squares
/// in standard notation.
pub fn policy_index(mov: &Move) -> usize {
    match mov.to_uci(CastlingMode::Standard) {
        UciMove::Normal {
            from,
            to,
            promotion,
        } => match promotion {
            None | Some(Role::Queen) => (from as usize) * 64 + to as usize,
            Some(role) => {
                let role_index = match role {
                    Role::Knight => 0,
                    Role::Bishop => 1,
                    _ => 2, // Rook; king/pawn promotions don't exist
                };
                let delta = (to.file() as i32 - from.file() as i32 + 1) as usize;
                64 * 64 + (role_index * 3 + delta) * 64 + to as usize
            }
        },
        // Null and drop moves never come out of legal movegen.
        _ => 0,
    }
}

/// Convert a probability-of-win to a centipawn score (0.5 maps to 0 cp,
/// monotonic, saturating toward +/-12800 at the extremes).
pub fn centipawns(value: f32) -> i32 {
    let centered = (2.0 * value - 1.0).clamp(-1.0, 1.0);
    let cp = 111.714_64 * (1.562_068_8 * centered).tan();
    cp.clamp(-12800.0, 12800.0) as i32
}
