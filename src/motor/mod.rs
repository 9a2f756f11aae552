// Motor control module for the pulse-driven base
//
// Provides:
// - Per-motor pulse calibration and speed modes
// - Differential and omni tri-wheel channel mixing
// - The pulse sink boundary
// - The drivetrain with its enable/disable safety interlock

pub mod calibration;
mod driver;
pub mod mixer;
pub mod sink;

pub use calibration::{Calibration, CalibrationError, MotorChannel, SpeedMode, Wheel};
pub use driver::{DriveError, DriveTrain, SharedDriveTrain, lock};
pub use mixer::{DriveCommand, Topology, WheelPulses};
pub use sink::{LogPulseSink, PulseSink, PulseSinkError, ZenohPulseSink};
