//! Terminal values and mate distances.

use once_cell::sync::Lazy;
use position::{VALUE_DRAW, VALUE_WIN};

/// Incentive multiplier for visiting proven mates, indexed by mate-in-N and
/// saturating at the table end. Positive and strictly decreasing in N, so
/// faster mates score higher during selection.
static UCB_MATE_TERM: Lazy<[f32; 64]> = Lazy::new(|| {
    let mut table = [0.0f32; 64];
    for (n, term) in table.iter_mut().enumerate().skip(1) {
        *term = 1.0 / n as f32;
    }
    table
});

/// Proven outcome of a node, always expressed from the parent's perspective:
/// `MateIn(n)` means the side that moved into this node mates in `n` full
/// moves (`MateIn(1)` is a delivered checkmate — the side to move here is
/// mated), `OpponentMateIn(n)` means the side to move here mates in `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminalValue {
    #[default]
    NonTerminal,
    Draw,
    MateIn(u16),
    OpponentMateIn(u16),
}

impl TerminalValue {
    /// Immediate terminals stay leaves forever: a delivered mate or a draw.
    pub fn is_immediate(self) -> bool {
        matches!(self, TerminalValue::Draw | TerminalValue::MateIn(1))
    }

    /// Value of an immediate terminal from the parent's perspective.
    /// Non-immediate values coalesce to a draw.
    pub fn immediate_value(self) -> f32 {
        if self == TerminalValue::MateIn(1) {
            VALUE_WIN
        } else {
            VALUE_DRAW
        }
    }

    pub fn is_mate_in_n(self) -> bool {
        matches!(self, TerminalValue::MateIn(_))
    }

    pub fn is_opponent_mate_in_n(self) -> bool {
        matches!(self, TerminalValue::OpponentMateIn(_))
    }

    /// Mate distance when this is a mate, else 0.
    pub fn mate_n(self) -> u16 {
        match self {
            TerminalValue::MateIn(n) => n,
            _ => 0,
        }
    }

    /// Opponent-mate distance when this is an opponent mate, else 0.
    pub fn opponent_mate_n(self) -> u16 {
        match self {
            TerminalValue::OpponentMateIn(n) => n,
            _ => 0,
        }
    }

    /// Signed mate distance: positive for mates, negative for opponent
    /// mates, 0 otherwise. This is the `mate` score UCI reports for the PV
    /// head.
    pub fn either_mate_n(self) -> i32 {
        match self {
            TerminalValue::MateIn(n) => i32::from(n),
            TerminalValue::OpponentMateIn(n) => -i32::from(n),
            _ => 0,
        }
    }

    /// Selection incentive: proven mates earn an extra slice of the
    /// exploration rate, larger for faster mates. Opponent mates and draws
    /// get no adjustment; the search should go wide there, not deep.
    pub fn mate_score(self, exploration_rate: f32) -> f32 {
        match self {
            TerminalValue::MateIn(n) => {
                let index = (n as usize).min(UCB_MATE_TERM.len() - 1);
                exploration_rate * UCB_MATE_TERM[index]
            }
            _ => 0.0,
        }
    }
}
