use anyhow::{anyhow, Result};
use std::collections::VecDeque;

use crate::detect::backend::DetectorBackend;
use crate::frame::{DetectionBox, Frame};

/// One scripted detector response.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Boxes(Vec<DetectionBox>),
    Fail(String),
    /// Panic inside `detect`, as an opaque model runtime might.
    Panic(String),
}

/// Backend that replays a fixed sequence of responses, one per call.
///
/// Once the script is exhausted every further call returns no boxes. Used to
/// drive the pipeline deterministically, including detector failures.
#[derive(Default)]
pub struct ScriptedBackend {
    steps: VecDeque<ScriptStep>,
    calls: u64,
}

impl ScriptedBackend {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            calls: 0,
        }
    }

    /// Number of `detect` calls served so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<DetectionBox>> {
        self.calls += 1;
        match self.steps.pop_front() {
            Some(ScriptStep::Boxes(boxes)) => Ok(boxes),
            Some(ScriptStep::Fail(reason)) => Err(anyhow!(reason)),
            Some(ScriptStep::Panic(reason)) => panic!("{}", reason),
            None => Ok(Vec::new()),
        }
    }
}
