use std::collections::BTreeMap;

use crate::{
    BlockNumber, Direction, Line, LineBlocks, StationInfo, SwitchConnection, SwitchInfo,
    TrackBlock,
};

/// In-memory view of the track as returned by the external track reader.
/// Loaded once at startup and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct TrackLayout {
    lines: LineBlocks,
}

impl TrackLayout {
    pub fn new(lines: LineBlocks) -> Self {
        Self { lines }
    }

    pub fn lines(&self) -> impl Iterator<Item = Line> + '_ {
        self.lines.keys().copied()
    }

    /// Number of blocks on the line, yard included. Zero for unknown lines.
    pub fn line_length(&self, line: Line) -> usize {
        self.lines.get(&line).map(|blocks| blocks.len()).unwrap_or(0)
    }

    pub fn blocks(&self, line: Line) -> &[TrackBlock] {
        self.lines
            .get(&line)
            .map(|blocks| blocks.as_slice())
            .unwrap_or(&[])
    }

    pub fn block(&self, line: Line, number: BlockNumber) -> Option<&TrackBlock> {
        self.lines
            .get(&line)
            .and_then(|blocks| blocks.get(number as usize))
    }

    pub fn has_line(&self, line: Line) -> bool {
        self.lines.contains_key(&line)
    }

    /// First block a train enters when leaving the yard. Taken from the yard
    /// block's switch connections where present, otherwise block 1.
    pub fn yard_exit_block(&self, line: Line) -> Option<BlockNumber> {
        let yard = self.block(line, 0)?;
        if let Some(switch) = &yard.switch {
            if let Some(exit) = switch.destinations_from(0).next() {
                return Some(exit);
            }
        }
        if self.line_length(line) > 1 {
            Some(1)
        } else {
            None
        }
    }

    /// Whether a train may travel directly from `a` to `b`. Adjacent numbers
    /// are always connected; anything else needs a switch pairing on either
    /// side.
    pub fn blocks_connected(&self, line: Line, a: BlockNumber, b: BlockNumber) -> bool {
        if a.abs_diff(b) == 1 {
            return true;
        }
        let permitted = |number: BlockNumber| {
            self.block(line, number)
                .and_then(|block| block.switch.as_ref())
                .map(|switch| switch.permits(a, b))
                .unwrap_or(false)
        };
        permitted(a) || permitted(b)
    }

    pub fn station_id(&self, line: Line, number: BlockNumber) -> u16 {
        self.block(line, number)
            .map(|block| block.station_id())
            .unwrap_or(0)
    }
}

/// Builds synthetic layouts for tests and the playground. Real deployments
/// get their layout from the external track reader instead.
#[derive(Debug, Default)]
pub struct TrackLayoutBuilder {
    lines: BTreeMap<Line, Vec<TrackBlock>>,
}

impl TrackLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a line of `length` blocks (yard at 0) with uniform geometry.
    pub fn line(mut self, line: Line, length: usize) -> Self {
        let blocks = (0..length)
            .map(|number| TrackBlock {
                number: number as BlockNumber,
                line,
                section: "A".to_owned(),
                length_m: 100.0,
                grade_percent: 0.0,
                speed_limit_kmh: 50.0,
                elevation_m: 0.0,
                direction: Direction::Ascending,
                is_underground: false,
                has_switch: false,
                has_crossing: false,
                has_station: false,
                station: None,
                switch: None,
            })
            .collect();
        self.lines.insert(line, blocks);
        self
    }

    fn block_mut(&mut self, line: Line, number: BlockNumber) -> &mut TrackBlock {
        self.lines
            .get_mut(&line)
            .and_then(|blocks| blocks.get_mut(number as usize))
            .expect("block must exist before it is customized")
    }

    pub fn station(mut self, line: Line, number: BlockNumber, id: u16, name: &str) -> Self {
        let block = self.block_mut(line, number);
        block.has_station = true;
        block.station = Some(StationInfo {
            id,
            name: name.to_owned(),
            side: None,
        });
        self
    }

    pub fn switch(mut self, line: Line, number: BlockNumber, connections: &[(BlockNumber, BlockNumber)]) -> Self {
        let block = self.block_mut(line, number);
        block.has_switch = true;
        block.switch = Some(SwitchInfo {
            connections: connections
                .iter()
                .map(|&(from_block, to_block)| SwitchConnection {
                    from_block,
                    to_block,
                })
                .collect(),
        });
        self
    }

    pub fn crossing(mut self, line: Line, number: BlockNumber) -> Self {
        self.block_mut(line, number).has_crossing = true;
        self
    }

    pub fn grade(mut self, line: Line, number: BlockNumber, percent: f64) -> Self {
        self.block_mut(line, number).grade_percent = percent;
        self
    }

    pub fn speed_limit(mut self, line: Line, number: BlockNumber, kmh: f64) -> Self {
        self.block_mut(line, number).speed_limit_kmh = kmh;
        self
    }

    pub fn bidirectional(mut self, line: Line, from: BlockNumber, to: BlockNumber) -> Self {
        for number in from..=to {
            self.block_mut(line, number).direction = Direction::Bidirectional;
        }
        self
    }

    pub fn build(self) -> TrackLayout {
        TrackLayout::new(self.lines)
    }
}
