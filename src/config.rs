// Timeouts, topics, motor configuration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::input::AxisMap;
use crate::motor::{Calibration, CalibrationError, SpeedMode, Topology, Wheel};

// Primary loop frequency. The pulse bus bridge cannot keep up with much
// more than this, so it doubles as a rate limit.
pub const LOOP_HZ: u64 = 20;

// Input watchdog: a sample older than this counts as a lost controller
pub const INPUT_TIMEOUT: Duration = Duration::from_millis(250);

// Connection attempts before giving up on the bus
pub const CONNECT_MAX_TRIES: u32 = 5;
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

// Edge signals closer together than this are treated as switch bounce
pub const SIGNAL_DEBOUNCE: Duration = Duration::from_millis(300);

// Zenoh topics
pub const TOPIC_INPUT: &str = "drivetrain/input"; // controller samples
pub const TOPIC_SIGNAL: &str = "drivetrain/signal"; // edge signals
pub const TOPIC_PULSE: &str = "drivetrain/rt/pulse"; // actuation
pub const TOPIC_HEALTH: &str = "drivetrain/state/health"; // health status

// Pulse bus carrier, used to report duty ticks alongside pulse lengths
pub const PWM_FREQ_HZ: u32 = 50;
pub const PWM_RESOLUTION: u32 = 4096;

// Default ESC pulse bounds (us)
pub const DEFAULT_FULL_MIN: u16 = 1000;
pub const DEFAULT_MID: u16 = 1500;
pub const DEFAULT_FULL_MAX: u16 = 2000;

// Button bit that acts as a safety cutout
pub const DEFAULT_SAFETY_BUTTON_MASK: u32 = 0x0080;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

/// Pulse bounds and sink channel of one motor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorConfig {
    pub wheel: Wheel,
    pub channel: u8,
    pub full_min: u16,
    pub mid: u16,
    pub full_max: u16,
}

impl MotorConfig {
    fn with_defaults(wheel: Wheel, channel: u8) -> Self {
        Self {
            wheel,
            channel,
            full_min: DEFAULT_FULL_MIN,
            mid: DEFAULT_MID,
            full_max: DEFAULT_FULL_MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    pub topology: Topology,
    pub speed: SpeedMode,
    pub motors: Vec<MotorConfig>,
    pub axes: AxisMap,
    pub safety_button_mask: u32,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            topology: Topology::Omni,
            speed: SpeedMode::Full,
            motors: vec![
                MotorConfig::with_defaults(Wheel::Left, 0),
                MotorConfig::with_defaults(Wheel::Right, 1),
                MotorConfig::with_defaults(Wheel::Front, 2),
            ],
            axes: AxisMap::default(),
            safety_button_mask: DEFAULT_SAFETY_BUTTON_MASK,
        }
    }
}

impl DriveConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Build the calibration, rejecting bad pulse bounds
    pub fn calibration(&self) -> Result<Calibration, CalibrationError> {
        let mut cal = Calibration::new();
        for m in &self.motors {
            cal.configure(m.wheel, m.channel, m.full_min, m.mid, m.full_max)?;
        }
        cal.select_speed(self.speed);
        Ok(cal)
    }
}
