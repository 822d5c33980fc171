//! Deterministic detector for tests and demos
//!
//! Each call to `detect_faces` consumes the next scripted step. Once the script
//! is exhausted the fallback step is replayed for every further frame.

use super::{FaceDetection, FaceDetector};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use image::RgbImage;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone)]
enum Step {
    Faces(Vec<FaceDetection>),
    Fail(String),
}

pub struct ScriptedDetector {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: Mutex<usize>,
}

impl ScriptedDetector {
    /// Detector that finds nothing unless steps are pushed
    pub fn new() -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            fallback: Step::Faces(Vec::new()),
            calls: Mutex::new(0),
        }
    }

    /// Detector returning `faces` for every frame
    pub fn repeating(faces: Vec<FaceDetection>) -> Self {
        Self {
            fallback: Step::Faces(faces),
            ..Self::new()
        }
    }

    /// Detector failing on every frame
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fallback: Step::Fail(message.into()),
            ..Self::new()
        }
    }

    /// Queue the faces returned for the next frame
    pub fn then_faces(self, faces: Vec<FaceDetection>) -> Self {
        self.push(Step::Faces(faces));
        self
    }

    /// Queue a failure for the next frame
    pub fn then_fail(self, message: impl Into<String>) -> Self {
        self.push(Step::Fail(message.into()));
        self
    }

    /// Number of frames seen so far
    pub fn calls(&self) -> usize {
        self.calls.lock().map(|c| *c).unwrap_or(0)
    }

    fn push(&self, step: Step) {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push_back(step);
        }
    }
}

impl Default for ScriptedDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FaceDetector for ScriptedDetector {
    fn id(&self) -> &'static str {
        "scripted"
    }

    async fn detect_faces(&self, _frame: &RgbImage) -> Result<Vec<FaceDetection>> {
        *self
            .calls
            .lock()
            .map_err(|e| anyhow!("Failed to lock call counter: {}", e))? += 1;

        let step = self
            .steps
            .lock()
            .map_err(|e| anyhow!("Failed to lock detector script: {}", e))?
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match step {
            Step::Faces(faces) => Ok(faces),
            Step::Fail(message) => Err(anyhow!(message)),
        }
    }
}
