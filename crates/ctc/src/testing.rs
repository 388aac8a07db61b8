//! Test support: in-process wayside controller doubles used by the unit and
//! integration tests (and the playground).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::wayside::{ControllerError, TrainCommands, WaysideController};

/// Controller that records everything the core sends to it.
pub struct RecordingController {
    id: String,
    commands: Mutex<Vec<TrainCommands>>,
    occupations: Mutex<Vec<Vec<bool>>>,
    switch_positions: Mutex<Vec<Vec<bool>>>,
    fail_sends: AtomicBool,
}

impl RecordingController {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            commands: Mutex::new(Vec::new()),
            occupations: Mutex::new(Vec::new()),
            switch_positions: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// Makes every subsequent send fail, for transient-error tests.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<TrainCommands> {
        self.commands.lock().unwrap().clone()
    }

    pub fn command_count(&self) -> usize {
        self.commands.lock().unwrap().len()
    }

    pub fn last_command(&self) -> Option<TrainCommands> {
        self.commands.lock().unwrap().last().cloned()
    }

    pub fn occupations(&self) -> Vec<Vec<bool>> {
        self.occupations.lock().unwrap().clone()
    }

    pub fn switch_positions(&self) -> Vec<Vec<bool>> {
        self.switch_positions.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.commands.lock().unwrap().clear();
        self.occupations.lock().unwrap().clear();
        self.switch_positions.lock().unwrap().clear();
    }
}

#[async_trait]
impl WaysideController for RecordingController {
    fn controller_id(&self) -> &str {
        &self.id
    }

    async fn command_train(&self, commands: &TrainCommands) -> Result<(), ControllerError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(format!("controller {} unreachable", self.id).into());
        }
        self.commands.lock().unwrap().push(commands.clone());
        Ok(())
    }

    async fn set_occupied(&self, occupied: &[bool]) -> Result<(), ControllerError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(format!("controller {} unreachable", self.id).into());
        }
        self.occupations.lock().unwrap().push(occupied.to_vec());
        Ok(())
    }

    async fn command_switch(&self, positions: &[bool]) -> Result<(), ControllerError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(format!("controller {} unreachable", self.id).into());
        }
        self.switch_positions.lock().unwrap().push(positions.to_vec());
        Ok(())
    }
}

/// Controller with no identifier, for registration rejection tests.
pub struct AnonymousController;

#[async_trait]
impl WaysideController for AnonymousController {
    fn controller_id(&self) -> &str {
        ""
    }

    async fn command_train(&self, _commands: &TrainCommands) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn set_occupied(&self, _occupied: &[bool]) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn command_switch(&self, _positions: &[bool]) -> Result<(), ControllerError> {
        Ok(())
    }
}
