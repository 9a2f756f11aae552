// Channel mixing for the two supported drivetrains
//
// Differential: (throttle, steering) -> left / right pulses.
// Omni tri-wheel: (forward, side, rotate) -> left / right / front pulses.
//
// Axes are first mapped to pulses through each motor's calibration, so the
// active speed mode limits the output of both mixers.

use serde::{Deserialize, Serialize};

use super::calibration::{Calibration, CalibrationError, MotorChannel, Wheel};

/// Kinematic weight of the side axis on the left/right wheels
pub const SIDE_WEIGHT: f64 = 0.15;
/// Kinematic weight of the forward axis on the left/right wheels
pub const FORWARD_WEIGHT: f64 = 0.86;

/// Wheel layout of the base
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Two wheels, throttle + steering
    Differential,
    /// Three omni wheels, forward + side + rotate
    #[default]
    Omni,
}

impl Topology {
    /// Wheels that must be calibrated for this topology
    pub fn wheels(&self) -> &'static [Wheel] {
        match self {
            Topology::Differential => &[Wheel::Left, Wheel::Right],
            Topology::Omni => &Wheel::ALL,
        }
    }
}

/// Normalized drive request, every axis in [-1, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriveCommand {
    Differential { throttle: f32, steering: f32 },
    Omni { forward: f32, side: f32, rotate: f32 },
}

/// Pulse lengths (us) for each driven wheel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WheelPulses {
    pub left: u16,
    pub right: u16,
    pub front: Option<u16>,
}

impl WheelPulses {
    /// (wheel, pulse) pairs in send order: left, right, then front
    pub fn iter(&self) -> impl Iterator<Item = (Wheel, u16)> {
        [
            Some((Wheel::Left, self.left)),
            Some((Wheel::Right, self.right)),
            self.front.map(|p| (Wheel::Front, p)),
        ]
        .into_iter()
        .flatten()
    }
}

pub fn mix(cal: &Calibration, cmd: DriveCommand) -> Result<WheelPulses, CalibrationError> {
    match cmd {
        DriveCommand::Differential { throttle, steering } => {
            mix_differential(cal, throttle, steering)
        }
        DriveCommand::Omni {
            forward,
            side,
            rotate,
        } => mix_omni(cal, forward, side, rotate),
    }
}

/// Two channel mix. Throttle is mapped through the left motor and steering
/// through the right motor before combining.
pub fn mix_differential(
    cal: &Calibration,
    throttle: f32,
    steering: f32,
) -> Result<WheelPulses, CalibrationError> {
    let left = cal.motor(Wheel::Left)?;
    let right = cal.motor(Wheel::Right)?;

    let pt = left.map(throttle) as i32;
    let ps = right.map(steering) as i32;

    let left_pulse = clip_to_active(left, (pt + ps) / 2);
    let right_pulse = clip_to_active(right, (pt - ps) / 2 + right.mid() as i32);

    Ok(WheelPulses {
        left: left_pulse,
        right: right_pulse,
        front: None,
    })
}

/// Three wheel omni mix.
///
/// Each wheel maps the axes through its own calibration and works on the
/// deviation from its mid point:
///
/// ```text
/// front = -side - rotate
/// left  = -round(0.15 * side + 0.86 * forward - rotate)
/// right =  round(0.15 * side - 0.86 * forward - rotate)
/// ```
///
/// Deviations are clipped to half the active range. Rounding is half away
/// from zero.
pub fn mix_omni(
    cal: &Calibration,
    forward: f32,
    side: f32,
    rotate: f32,
) -> Result<WheelPulses, CalibrationError> {
    let left = cal.motor(Wheel::Left)?;
    let right = cal.motor(Wheel::Right)?;
    let front = cal.motor(Wheel::Front)?;

    let left_dev = {
        let (fwd, side, rot) = deviations(left, forward, side, rotate);
        -(SIDE_WEIGHT * side + FORWARD_WEIGHT * fwd - rot).round() as i32
    };
    let right_dev = {
        let (fwd, side, rot) = deviations(right, forward, side, rotate);
        (SIDE_WEIGHT * side - FORWARD_WEIGHT * fwd - rot).round() as i32
    };
    let front_dev = {
        let (_, side, rot) = deviations(front, forward, side, rotate);
        (-side - rot) as i32
    };

    Ok(WheelPulses {
        left: apply_deviation(left, left_dev),
        right: apply_deviation(right, right_dev),
        front: Some(apply_deviation(front, front_dev)),
    })
}

/// Centered (forward, side, rotate) deviations for one motor
fn deviations(motor: &MotorChannel, forward: f32, side: f32, rotate: f32) -> (f64, f64, f64) {
    let mid = motor.mid() as i32;
    let dev = |axis: f32| (motor.map(axis) as i32 - mid) as f64;
    (dev(forward), dev(side), dev(rotate))
}

fn apply_deviation(motor: &MotorChannel, dev: i32) -> u16 {
    let (min, max) = motor.active_range();
    let half_range = (max as i32 - min as i32) / 2;
    clip_to_active(motor, motor.mid() as i32 + dev.clamp(-half_range, half_range))
}

fn clip_to_active(motor: &MotorChannel, pulse: i32) -> u16 {
    let (min, max) = motor.active_range();
    pulse.clamp(min as i32, max as i32) as u16
}
