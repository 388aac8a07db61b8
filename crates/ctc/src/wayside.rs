use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use track::{BlockNumber, Line, TrackLayout};
use utility::id::{HasId, Id};

use crate::error::ProtocolViolation;

/// Identifier a wayside controller registers under.
pub type ControllerId = Id<RegisteredController>;

impl HasId for RegisteredController {
    type IdType = String;
}

/// The kinds of block-length state arrays a controller reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldKind {
    Occupancy,
    Switches,
    Crossings,
}

pub type ControllerError = Box<dyn std::error::Error + Send + Sync>;

/// Remote wayside controller peer. Implementations are expected to be
/// internally thread safe; the core may call them from the message worker
/// and the departure sequencer concurrently.
#[async_trait]
pub trait WaysideController: Send + Sync {
    fn controller_id(&self) -> &str;

    /// Six line-length arrays, indexed by the commanded train's current
    /// block. The controller filters against its own coverage mask.
    async fn command_train(&self, commands: &TrainCommands) -> Result<(), ControllerError>;

    /// Full line occupation array; uncovered blocks are ignored by the peer.
    async fn set_occupied(&self, occupied: &[bool]) -> Result<(), ControllerError>;

    /// Full line switch position array, meaningful only at switch blocks.
    async fn command_switch(&self, positions: &[bool]) -> Result<(), ControllerError>;
}

/// One full-line command batch. Array index = the train's current block,
/// array value = the instruction for the target block (`block_num[i]`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainCommands {
    pub suggested_speed: Vec<u8>,
    pub authority: Vec<u8>,
    pub block_num: Vec<u16>,
    pub update_block_in_queue: Vec<u8>,
    pub next_station: Vec<u16>,
    pub blocks_away: Vec<u16>,
}

impl TrainCommands {
    pub fn zeroed(line_length: usize) -> Self {
        Self {
            suggested_speed: vec![0; line_length],
            authority: vec![0; line_length],
            block_num: vec![0; line_length],
            update_block_in_queue: vec![0; line_length],
            next_station: vec![0; line_length],
            blocks_away: vec![0; line_length],
        }
    }

    pub fn len(&self) -> usize {
        self.block_num.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_num.is_empty()
    }

    /// True if any position carries an actual command.
    pub fn has_commands(&self) -> bool {
        self.block_num.iter().any(|&block| block > 0)
            || self.suggested_speed.iter().any(|&speed| speed > 0)
            || self.authority.iter().any(|&authority| authority > 0)
    }
}

pub struct RegisteredController {
    pub handle: Arc<dyn WaysideController>,
    pub line: Line,
    pub covers: Vec<bool>,
}

impl std::fmt::Debug for RegisteredController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredController")
            .field("id", &self.handle.controller_id())
            .field("line", &self.line)
            .field(
                "covered",
                &self
                    .covers
                    .iter()
                    .enumerate()
                    .filter(|(_, &covered)| covered)
                    .count(),
            )
            .finish()
    }
}

/// Registry of wayside controllers with their coverage masks, the reverse
/// block-to-controller index, and each controller's last reported slices
/// (the raw material for line-state reassembly).
pub struct WaysideRegistry {
    layout: Arc<TrackLayout>,
    controllers: IndexMap<ControllerId, RegisteredController>,
    block_index: HashMap<(Line, BlockNumber), ControllerId>,
    last_reports: HashMap<(ControllerId, FieldKind), Vec<bool>>,
}

impl WaysideRegistry {
    pub fn new(layout: Arc<TrackLayout>) -> Self {
        Self {
            layout,
            controllers: IndexMap::new(),
            block_index: HashMap::new(),
            last_reports: HashMap::new(),
        }
    }

    pub fn line_length(&self, line: Line) -> usize {
        self.layout.line_length(line)
    }

    /// Registers a controller under the strict block-length array protocol.
    /// Every violation rejects the registration and leaves the registry
    /// unchanged.
    pub fn register(
        &mut self,
        controller: Arc<dyn WaysideController>,
        covers: Vec<bool>,
        red_line: bool,
    ) -> Result<ControllerId, ProtocolViolation> {
        let raw_id = controller.controller_id().trim();
        if raw_id.is_empty() {
            return Err(ProtocolViolation::MissingControllerId);
        }
        let id = ControllerId::from_name(raw_id);

        if covers.is_empty() {
            return Err(ProtocolViolation::EmptyMask);
        }

        // Line from the registration flag, controller id prefix as fallback
        // for the Blue line.
        let line = if red_line {
            Line::Red
        } else if raw_id.starts_with("Blue") {
            Line::Blue
        } else {
            Line::Green
        };

        let expected = self.layout.line_length(line);
        if covers.len() != expected {
            return Err(ProtocolViolation::MaskLengthMismatch {
                line,
                expected,
                got: covers.len(),
            });
        }
        if !covers.iter().any(|&covered| covered) {
            return Err(ProtocolViolation::NoCoveredBlocks { controller: id });
        }
        if self.controllers.contains_key(&id) {
            return Err(ProtocolViolation::DuplicateController { controller: id });
        }
        for (block, _) in covers.iter().enumerate().filter(|(_, &covered)| covered) {
            let block = block as BlockNumber;
            if let Some(existing) = self.block_index.get(&(line, block)) {
                return Err(ProtocolViolation::OverlappingCoverage {
                    line,
                    block,
                    existing: existing.clone(),
                    controller: id,
                });
            }
        }

        for (block, _) in covers.iter().enumerate().filter(|(_, &covered)| covered) {
            self.block_index
                .insert((line, block as BlockNumber), id.clone());
        }
        let covered_blocks: Vec<usize> = covers
            .iter()
            .enumerate()
            .filter(|(_, &covered)| covered)
            .map(|(block, _)| block)
            .collect();
        log::info!(
            "wayside controller {} registered for {} line covering blocks {:?}",
            id,
            line,
            covered_blocks
        );
        self.controllers.insert(
            id.clone(),
            RegisteredController {
                handle: controller,
                line,
                covers,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: &ControllerId) -> Option<&RegisteredController> {
        self.controllers.get(id)
    }

    pub fn line_of(&self, id: &ControllerId) -> Option<Line> {
        self.controllers.get(id).map(|controller| controller.line)
    }

    /// Controllers on a line in registration order.
    pub fn controllers_on(&self, line: Line) -> Vec<(ControllerId, Arc<dyn WaysideController>)> {
        self.controllers
            .iter()
            .filter(|(_, controller)| controller.line == line)
            .map(|(id, controller)| (id.clone(), controller.handle.clone()))
            .collect()
    }

    /// The single controller covering a block, or none.
    pub fn controller_for_block(&self, line: Line, block: BlockNumber) -> Option<&ControllerId> {
        self.block_index.get(&(line, block))
    }

    pub fn is_registered(&self, id: &ControllerId) -> bool {
        self.controllers.contains_key(id)
    }

    /// Filters an inbound array to the sender's covered indices and stores
    /// the result as that controller's last report. Values at uncovered
    /// indices are discarded.
    pub fn store_report(
        &mut self,
        id: &ControllerId,
        kind: FieldKind,
        values: &[bool],
    ) -> Result<(), ProtocolViolation> {
        let controller = self
            .controllers
            .get(id)
            .ok_or_else(|| ProtocolViolation::UnknownSender(id.clone()))?;
        if values.len() != controller.covers.len() {
            return Err(ProtocolViolation::ArrayLengthMismatch {
                kind,
                line: controller.line,
                expected: controller.covers.len(),
                got: values.len(),
            });
        }
        let mut filtered = vec![false; values.len()];
        let mut discarded = 0usize;
        for (index, &value) in values.iter().enumerate() {
            if controller.covers[index] {
                filtered[index] = value;
            } else if value {
                discarded += 1;
            }
        }
        if discarded > 0 {
            log::debug!(
                "discarded {} {:?} values outside coverage of {}",
                discarded,
                kind,
                id
            );
        }
        self.last_reports.insert((id.clone(), kind), filtered);
        Ok(())
    }

    /// Rebuilds the complete line state by overlaying every controller's
    /// last reported slice at its covered indices.
    pub fn reassemble_line_state(&self, kind: FieldKind, line: Line) -> Vec<bool> {
        let mut state = vec![false; self.layout.line_length(line)];
        for (id, controller) in &self.controllers {
            if controller.line != line {
                continue;
            }
            let Some(report) = self.last_reports.get(&(id.clone(), kind)) else {
                continue;
            };
            for (index, &covered) in controller.covers.iter().enumerate() {
                if covered && index < state.len() {
                    state[index] = report[index];
                }
            }
        }
        state
    }

    /// Coverage mask of a controller, by id.
    pub fn mask_of(&self, id: &ControllerId) -> Option<&[bool]> {
        self.controllers
            .get(id)
            .map(|controller| controller.covers.as_slice())
    }
}
