// Per-motor pulse calibration and the axis -> pulse mapper
//
// Each motor has a full pulse range (full_min < mid < full_max) and a
// derived low range at half the width on each side of mid. The active
// range is switched for every motor at once.

use serde::{Deserialize, Serialize};
use tracing::info;

/// Logical position of a motor on the base
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Wheel {
    Left,
    Right,
    Front,
}

impl Wheel {
    pub const ALL: [Wheel; 3] = [Wheel::Left, Wheel::Right, Wheel::Front];
}

/// Selects which pulse sub-range is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedMode {
    #[default]
    Full,
    Low,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CalibrationError {
    #[error("Invalid pulse range for {wheel:?}: need full_min < mid < full_max, got {full_min} / {mid} / {full_max}")]
    InvalidRange {
        wheel: Wheel,
        full_min: u16,
        mid: u16,
        full_max: u16,
    },

    #[error("Motor {0:?} is not configured")]
    UnknownMotor(Wheel),
}

/// Calibration of a single motor channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorChannel {
    pub wheel: Wheel,
    /// Index on the pulse sink
    pub channel: u8,
    full_min: u16,
    mid: u16,
    full_max: u16,
    low_min: u16,
    low_max: u16,
    active_min: u16,
    active_max: u16,
}

impl MotorChannel {
    /// Validate the bounds and derive the low-speed range.
    ///
    /// The low half-widths are rounded up so that `low_min < mid < low_max`
    /// still holds when a side of the full range is only 1 us wide.
    pub fn new(
        wheel: Wheel,
        channel: u8,
        full_min: u16,
        mid: u16,
        full_max: u16,
    ) -> Result<Self, CalibrationError> {
        if full_min >= mid || mid >= full_max {
            return Err(CalibrationError::InvalidRange {
                wheel,
                full_min,
                mid,
                full_max,
            });
        }

        let low_min = mid - (mid - full_min).div_ceil(2);
        let low_max = mid + (full_max - mid).div_ceil(2);

        Ok(Self {
            wheel,
            channel,
            full_min,
            mid,
            full_max,
            low_min,
            low_max,
            active_min: full_min,
            active_max: full_max,
        })
    }

    pub fn mid(&self) -> u16 {
        self.mid
    }

    pub fn full_range(&self) -> (u16, u16) {
        (self.full_min, self.full_max)
    }

    pub fn low_range(&self) -> (u16, u16) {
        (self.low_min, self.low_max)
    }

    /// Currently selected (min, max)
    pub fn active_range(&self) -> (u16, u16) {
        (self.active_min, self.active_max)
    }

    fn apply_speed(&mut self, mode: SpeedMode) {
        let (min, max) = match mode {
            SpeedMode::Full => self.full_range(),
            SpeedMode::Low => self.low_range(),
        };
        self.active_min = min;
        self.active_max = max;
    }

    /// Map a normalized value in [-1, 1] to a pulse in the active range.
    ///
    /// Interpolates [-1, 0] onto [active_min, mid] and [0, 1] onto
    /// [mid, active_max], so 0 always lands on mid. Out of range input is
    /// clamped; NaN maps to mid. Fractions are truncated toward zero.
    pub fn map(&self, value: f32) -> u16 {
        let value = if value.is_finite() {
            value.clamp(-1.0, 1.0)
        } else {
            0.0
        };

        let mid = self.mid as f32;
        let pulse = if value < 0.0 {
            mid + value * (mid - self.active_min as f32)
        } else {
            mid + value * (self.active_max as f32 - mid)
        };

        (pulse as u16).clamp(self.active_min, self.active_max)
    }
}

/// Calibration for every motor on the base
#[derive(Debug, Clone, Default)]
pub struct Calibration {
    motors: Vec<MotorChannel>,
    speed: SpeedMode,
}

impl Calibration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure (or reconfigure) one motor. The current speed mode is
    /// applied to it straight away.
    pub fn configure(
        &mut self,
        wheel: Wheel,
        channel: u8,
        full_min: u16,
        mid: u16,
        full_max: u16,
    ) -> Result<(), CalibrationError> {
        let mut motor = MotorChannel::new(wheel, channel, full_min, mid, full_max)?;
        motor.apply_speed(self.speed);

        match self.motors.iter_mut().find(|m| m.wheel == wheel) {
            Some(existing) => *existing = motor,
            None => self.motors.push(motor),
        }
        Ok(())
    }

    /// Switch the active range of every configured motor
    pub fn select_speed(&mut self, mode: SpeedMode) {
        for motor in &mut self.motors {
            motor.apply_speed(mode);
        }
        if self.speed != mode {
            info!("Speed mode set to {:?}", mode);
        }
        self.speed = mode;
    }

    pub fn speed(&self) -> SpeedMode {
        self.speed
    }

    pub fn motor(&self, wheel: Wheel) -> Result<&MotorChannel, CalibrationError> {
        self.motors
            .iter()
            .find(|m| m.wheel == wheel)
            .ok_or(CalibrationError::UnknownMotor(wheel))
    }

    pub fn motors(&self) -> &[MotorChannel] {
        &self.motors
    }

    pub fn map(&self, value: f32, wheel: Wheel) -> Result<u16, CalibrationError> {
        Ok(self.motor(wheel)?.map(value))
    }
}
