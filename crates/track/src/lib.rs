use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod layout;

pub use layout::{TrackLayout, TrackLayoutBuilder};

/// The three lines of the network. The line universe is fixed; everything
/// else about the track comes from layout data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Line {
    Blue,
    Red,
    Green,
}

impl Line {
    pub const ALL: [Line; 3] = [Line::Blue, Line::Red, Line::Green];

    /// Letter used as the first character of train ids on this line.
    pub fn letter(&self) -> char {
        match self {
            Line::Blue => 'B',
            Line::Red => 'R',
            Line::Green => 'G',
        }
    }

    pub fn from_letter(letter: char) -> Option<Line> {
        match letter {
            'B' => Some(Line::Blue),
            'R' => Some(Line::Red),
            'G' => Some(Line::Green),
            _ => None,
        }
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Line::Blue => write!(f, "Blue"),
            Line::Red => write!(f, "Red"),
            Line::Green => write!(f, "Green"),
        }
    }
}

impl FromStr for Line {
    type Err = UnknownLine;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Blue" => Ok(Line::Blue),
            "Red" => Ok(Line::Red),
            "Green" => Ok(Line::Green),
            other => Err(UnknownLine(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown line name: {0}")]
pub struct UnknownLine(pub String);

/// Block number within a line. Block 0 is the yard.
pub type BlockNumber = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Ascending,
    Descending,
    Bidirectional,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationInfo {
    pub id: u16,
    pub name: String,
    pub side: Option<String>,
}

/// One leg of a switch: travel is permitted from `from_block` to `to_block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchConnection {
    pub from_block: BlockNumber,
    pub to_block: BlockNumber,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchInfo {
    pub connections: Vec<SwitchConnection>,
}

impl SwitchInfo {
    /// Blocks reachable from `from` over this switch.
    pub fn destinations_from(&self, from: BlockNumber) -> impl Iterator<Item = BlockNumber> + '_ {
        self.connections
            .iter()
            .filter(move |connection| connection.from_block == from)
            .map(|connection| connection.to_block)
    }

    pub fn permits(&self, from: BlockNumber, to: BlockNumber) -> bool {
        self.connections
            .iter()
            .any(|c| (c.from_block == from && c.to_block == to) || (c.from_block == to && c.to_block == from))
    }
}

/// One track block record as supplied by the track reader. Index in the
/// per-line sequence equals `number`; block 0 is the yard.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackBlock {
    pub number: BlockNumber,
    pub line: Line,
    pub section: String,
    pub length_m: f64,
    pub grade_percent: f64,
    pub speed_limit_kmh: f64,
    pub elevation_m: f64,
    pub direction: Direction,
    pub is_underground: bool,
    pub has_switch: bool,
    pub has_crossing: bool,
    pub has_station: bool,
    pub station: Option<StationInfo>,
    pub switch: Option<SwitchInfo>,
}

impl TrackBlock {
    pub fn is_yard(&self) -> bool {
        self.number == 0
    }

    pub fn is_bidirectional(&self) -> bool {
        matches!(self.direction, Direction::Bidirectional)
    }

    pub fn station_id(&self) -> u16 {
        self.station.as_ref().map(|station| station.id).unwrap_or(0)
    }
}

/// Per-line block sequences, keyed by line, blocks ordered by number.
pub type LineBlocks = BTreeMap<Line, Vec<TrackBlock>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_letters_round_trip() {
        for line in Line::ALL {
            assert_eq!(Line::from_letter(line.letter()), Some(line));
        }
        assert_eq!(Line::from_letter('X'), None);
    }

    #[test]
    fn line_names_parse() {
        assert_eq!("Green".parse::<Line>().unwrap(), Line::Green);
        assert!("Yellow".parse::<Line>().is_err());
    }

    #[test]
    fn switch_permits_either_direction() {
        let switch = SwitchInfo {
            connections: vec![SwitchConnection {
                from_block: 5,
                to_block: 12,
            }],
        };
        assert!(switch.permits(5, 12));
        assert!(switch.permits(12, 5));
        assert!(!switch.permits(5, 6));
    }
}
