use lazy_static::lazy_static;
use regex::Regex;
use shakmaty::{Chess, Color, Position};
use std::cmp::Ordering;
use std::fmt;

lazy_static! {
    static ref MOVE_NUMBER_REGEX: Regex = Regex::new(r"^(\d+)((\.{3})|\.?)").unwrap();
}

/// A fullmove number together with the color that made the move.
///
/// "5." is move 5 by White, "5..." is move 5 by Black. Plain numbers parse
/// as White. The total order is (n, White) < (n, Black) < (n+1, White) and
/// is used both for display and as a pruning bound in move search.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct MoveNumber {
    pub number: u32,
    pub color: Color,
}

impl MoveNumber {
    pub fn new(number: u32, color: Color) -> MoveNumber {
        MoveNumber { number, color }
    }

    /// The move number of the move that led to `pos`.
    pub fn from_position(pos: &Chess) -> MoveNumber {
        MoveNumber {
            number: pos.fullmoves().get(),
            color: pos.turn(),
        }
        .previous()
    }

    /// Parse a move number like "3.", "5..." or "7". The whole string must match.
    pub fn parse(s: &str) -> Option<MoveNumber> {
        let (number, rest) = Self::parse_prefix(s)?;
        rest.is_empty().then_some(number)
    }

    /// Parse a move number prefix and return it together with the remainder
    /// of the string, e.g. "8.Nxe5" -> (8., "Nxe5").
    pub fn parse_prefix(s: &str) -> Option<(MoveNumber, &str)> {
        let captures = MOVE_NUMBER_REGEX.captures(s)?;
        let number = captures.get(1)?.as_str().parse::<u32>().ok()?;
        let color = if captures.get(3).is_some() {
            Color::Black
        } else {
            Color::White
        };
        let end = captures.get(0).unwrap().end();
        Some((MoveNumber { number, color }, &s[end..]))
    }

    pub fn previous(self) -> MoveNumber {
        match self.color {
            Color::White => MoveNumber {
                number: self.number.saturating_sub(1),
                color: Color::Black,
            },
            Color::Black => MoveNumber {
                number: self.number,
                color: Color::White,
            },
        }
    }

    pub fn next(self) -> MoveNumber {
        match self.color {
            Color::White => MoveNumber {
                number: self.number,
                color: Color::Black,
            },
            Color::Black => MoveNumber {
                number: self.number + 1,
                color: Color::White,
            },
        }
    }

    fn ply_index(self) -> u64 {
        u64::from(self.number) * 2
            + match self.color {
                Color::White => 0,
                Color::Black => 1,
            }
    }
}

impl Ord for MoveNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ply_index().cmp(&other.ply_index())
    }
}

impl PartialOrd for MoveNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MoveNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.color {
            Color::White => write!(f, "{}.", self.number),
            Color::Black => write!(f, "{}...", self.number),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_white_and_black() {
        assert_eq!(MoveNumber::parse("5."), Some(MoveNumber::new(5, Color::White)));
        assert_eq!(MoveNumber::parse("10..."), Some(MoveNumber::new(10, Color::Black)));
        assert_eq!(MoveNumber::parse("7"), Some(MoveNumber::new(7, Color::White)));
        assert_eq!(MoveNumber::parse("x7"), None);
        assert_eq!(MoveNumber::parse("5.Nf3"), None);
    }

    #[test]
    fn parse_prefix_returns_remainder() {
        let (number, rest) = MoveNumber::parse_prefix("8.Nxe5").unwrap();
        assert_eq!(number, MoveNumber::new(8, Color::White));
        assert_eq!(rest, "Nxe5");

        let (number, rest) = MoveNumber::parse_prefix("12...c5").unwrap();
        assert_eq!(number, MoveNumber::new(12, Color::Black));
        assert_eq!(rest, "c5");
    }

    #[test]
    fn total_order() {
        let w5 = MoveNumber::new(5, Color::White);
        let b5 = MoveNumber::new(5, Color::Black);
        let w6 = MoveNumber::new(6, Color::White);
        assert!(w5 < b5);
        assert!(b5 < w6);
        assert_eq!(w5.next(), b5);
        assert_eq!(b5.next(), w6);
        assert_eq!(w6.previous(), b5);
        assert_eq!(b5.previous(), w5);
    }

    #[test]
    fn from_start_position() {
        // No move has been made yet, so the "last move" steps back to 0...
        let number = MoveNumber::from_position(&Chess::default());
        assert_eq!(number, MoveNumber::new(0, Color::Black));
    }

    #[test]
    fn display() {
        assert_eq!(MoveNumber::new(5, Color::White).to_string(), "5.");
        assert_eq!(MoveNumber::new(5, Color::Black).to_string(), "5...");
    }
}
