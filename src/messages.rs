// Define message types for the runtime

use serde::{Deserialize, Serialize};

use crate::motor::SpeedMode;

// Input sample from a controller bridge -> runtime
// Axes are normalized to [-1, 1]; buttons is a raw bitmask
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputState {
    #[serde(default)]
    pub axes: Vec<f32>,
    #[serde(default)]
    pub buttons: u32,
    pub connected: bool,
}

impl InputState {
    /// A lost controller or a pressed safety button both mean stop now
    pub fn is_cutout(&self, safety_mask: u32) -> bool {
        !self.connected || self.buttons & safety_mask != 0
    }

    pub fn axis(&self, index: usize) -> Option<f32> {
        self.axes.get(index).copied()
    }
}

// Pulse output from runtime -> pulse bus bridge
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseCommand {
    pub channel: u8,
    pub pulse_us: u16,
}

/// Which source currently drives the motors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOwner {
    None,
    Rc,
}

/// State of the input source as seen by the last primary loop tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputStatus {
    Ok,
    NoData,
    Cutout,
    Error,
    /// A control session owns the input
    Suspended,
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriveHealth {
    pub enabled: bool,
    pub speed: SpeedMode,
    pub session: SessionOwner,
    pub input: InputStatus,
}
