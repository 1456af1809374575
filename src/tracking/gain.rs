//! Scale-restriction gain schedule.
//!
//! The scale prior is switched off when tracking is lost (a fresh visual map
//! has an arbitrary scale) and ramped back in linearly once tracking resumes.

use serde::{Deserialize, Serialize};

/// Nominal restriction gains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GainConfig {
    pub scale: f64,
    pub pitch: f64,
    pub model: f64,
    /// Tracking frames needed to ramp the scale gain from 0 to nominal.
    pub recovery_frames: u32,
}

impl Default for GainConfig {
    fn default() -> Self {
        Self {
            scale: 10.0,
            pitch: 10.0,
            model: 1.0,
            recovery_frames: 50,
        }
    }
}

/// Current scale gain and its ramp.
#[derive(Debug, Clone)]
pub struct ScaleGainSchedule {
    nominal: f64,
    step: f64,
    current: f64,
}

impl ScaleGainSchedule {
    pub fn new(nominal: f64, recovery_frames: u32) -> Self {
        Self {
            nominal,
            step: nominal / recovery_frames.max(1) as f64,
            current: nominal,
        }
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn restore(&mut self) {
        self.current = self.nominal;
    }

    pub fn suspend(&mut self) {
        self.current = 0.0;
    }

    /// One step of the ramp; never exceeds nominal.
    pub fn ramp(&mut self) {
        if self.current < self.nominal {
            self.current = (self.current + self.step).min(self.nominal);
        }
    }
}
