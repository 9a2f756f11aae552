// High-level drivetrain with the enable/disable safety interlock
//
// Combines calibration, mixing and a pulse sink. Pulses only reach the sink
// while the drivetrain is enabled; disabling sends neutral to every motor
// before closing the gate.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::calibration::{Calibration, CalibrationError, SpeedMode};
use super::mixer::{DriveCommand, Topology, WheelPulses, mix};
use super::sink::{PulseSink, PulseSinkError};

/// Drivetrain shared between the primary loop and a control session
pub type SharedDriveTrain = Arc<Mutex<DriveTrain>>;

#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Sink(#[from] PulseSinkError),

    #[error("{command:?} cannot drive a {topology:?} base")]
    TopologyMismatch {
        command: DriveCommand,
        topology: Topology,
    },
}

pub struct DriveTrain {
    sink: Box<dyn PulseSink + Send>,
    calibration: Calibration,
    topology: Topology,
    // Set when motors are allowed to move
    enabled: bool,
}

impl DriveTrain {
    /// Create a disabled drivetrain. Every wheel the topology drives must be
    /// calibrated.
    pub fn new(
        sink: Box<dyn PulseSink + Send>,
        calibration: Calibration,
        topology: Topology,
    ) -> Result<Self, CalibrationError> {
        for &wheel in topology.wheels() {
            calibration.motor(wheel)?;
        }

        info!(
            "Drivetrain ready: {:?}, {} motors, {:?} speed",
            topology,
            topology.wheels().len(),
            calibration.speed()
        );

        Ok(Self {
            sink,
            calibration,
            topology,
            enabled: false,
        })
    }

    pub fn into_shared(self) -> SharedDriveTrain {
        Arc::new(Mutex::new(self))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn speed(&self) -> SpeedMode {
        self.calibration.speed()
    }

    /// Allow motors to be used
    pub fn enable(&mut self) {
        if !self.enabled {
            info!("Drive enabled");
        }
        self.enabled = true;
    }

    /// Send neutral to every motor, then close the gate.
    ///
    /// Every motor is attempted even if the sink fails on one of them, and
    /// the drivetrain ends up disabled either way. The first sink error is
    /// returned. No-op when already disabled.
    pub fn disable(&mut self) -> Result<(), PulseSinkError> {
        if !self.enabled {
            return Ok(());
        }

        let mut first_err = None;
        for &wheel in self.topology.wheels() {
            let Ok(motor) = self.calibration.motor(wheel) else {
                continue;
            };
            if let Err(e) = self.sink.send(motor.channel, motor.mid()) {
                warn!("Failed to send neutral to {:?}: {}", wheel, e);
                first_err.get_or_insert(e);
            }
        }

        self.enabled = false;
        info!("Drive disabled");

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn select_speed(&mut self, mode: SpeedMode) {
        self.calibration.select_speed(mode);
    }

    /// Mix a command and send the pulses.
    ///
    /// Returns `Ok(None)` without mixing when the drivetrain is disabled.
    pub fn drive(&mut self, command: DriveCommand) -> Result<Option<WheelPulses>, DriveError> {
        if !self.enabled {
            return Ok(None);
        }

        let matches = matches!(
            (command, self.topology),
            (DriveCommand::Differential { .. }, Topology::Differential)
                | (DriveCommand::Omni { .. }, Topology::Omni)
        );
        if !matches {
            return Err(DriveError::TopologyMismatch {
                command,
                topology: self.topology,
            });
        }

        let pulses = mix(&self.calibration, command)?;
        debug!("mixing {:?} -> {:?}", command, pulses);

        for (wheel, pulse) in pulses.iter() {
            let channel = self.calibration.motor(wheel)?.channel;
            self.send_pulse(channel, pulse)?;
        }
        Ok(Some(pulses))
    }

    /// Send a raw pulse to a channel, dropped while disabled
    pub fn send_pulse(&mut self, channel: u8, pulse_us: u16) -> Result<(), PulseSinkError> {
        if !self.enabled {
            return Ok(());
        }
        self.sink.send(channel, pulse_us)
    }
}

impl Drop for DriveTrain {
    fn drop(&mut self) {
        if let Err(e) = self.disable() {
            warn!("Failed to stop motors on drop: {}", e);
        }
    }
}

/// Lock the shared drivetrain, recovering it if a holder panicked so the
/// motors can still be stopped.
pub fn lock(drivetrain: &SharedDriveTrain) -> MutexGuard<'_, DriveTrain> {
    drivetrain.lock().unwrap_or_else(|poisoned| {
        warn!("Drivetrain lock poisoned, recovering");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::calibration::Wheel;
    use crate::motor::sink::testing::{FailingSink, RecordingSink};

    fn omni_calibration() -> Calibration {
        let mut cal = Calibration::new();
        cal.configure(Wheel::Left, 0, 1000, 1500, 2000).unwrap();
        cal.configure(Wheel::Right, 1, 1000, 1500, 2000).unwrap();
        cal.configure(Wheel::Front, 2, 1000, 1500, 2000).unwrap();
        cal
    }

    fn omni(sink: &RecordingSink) -> DriveTrain {
        DriveTrain::new(Box::new(sink.clone()), omni_calibration(), Topology::Omni).unwrap()
    }

    const FORWARD: DriveCommand = DriveCommand::Omni {
        forward: 0.5,
        side: 0.0,
        rotate: 0.0,
    };

    #[test]
    fn test_starts_disabled() {
        let sink = RecordingSink::default();
        let drivetrain = omni(&sink);
        assert!(!drivetrain.is_enabled());
        assert!(sink.calls().is_empty());
    }

    #[test]
    fn test_disabled_drive_sends_nothing() {
        let sink = RecordingSink::default();
        let mut drivetrain = omni(&sink);
        assert_eq!(drivetrain.drive(FORWARD).unwrap(), None);
        drivetrain.send_pulse(0, 2000).unwrap();
        assert!(sink.calls().is_empty());
    }

    #[test]
    fn test_disabled_drive_skips_mixing() {
        // A mismatched command would error if it were mixed
        let sink = RecordingSink::default();
        let mut drivetrain = omni(&sink);
        let cmd = DriveCommand::Differential {
            throttle: 1.0,
            steering: 0.0,
        };
        assert!(drivetrain.drive(cmd).unwrap().is_none());
    }

    #[test]
    fn test_enabled_drive_sends_each_channel() {
        let sink = RecordingSink::default();
        let mut drivetrain = omni(&sink);
        drivetrain.enable();
        drivetrain.drive(FORWARD).unwrap();
        assert_eq!(sink.calls(), vec![(0, 1285), (1, 1285), (2, 1500)]);
    }

    #[test]
    fn test_disable_sends_neutral_then_gates() {
        let sink = RecordingSink::default();
        let mut drivetrain = omni(&sink);
        drivetrain.enable();
        drivetrain.drive(FORWARD).unwrap();
        sink.clear();

        drivetrain.disable().unwrap();
        assert_eq!(sink.calls(), vec![(0, 1500), (1, 1500), (2, 1500)]);
        assert!(!drivetrain.is_enabled());

        drivetrain.drive(FORWARD).unwrap();
        assert_eq!(sink.calls().len(), 3);
    }

    #[test]
    fn test_disable_when_disabled_is_noop() {
        let sink = RecordingSink::default();
        let mut drivetrain = omni(&sink);
        drivetrain.disable().unwrap();
        assert!(sink.calls().is_empty());
    }

    #[test]
    fn test_disable_completes_despite_sink_failure() {
        let sink = FailingSink {
            fail_channel: 1,
            ..Default::default()
        };
        let record = sink.inner.clone();
        let mut drivetrain =
            DriveTrain::new(Box::new(sink), omni_calibration(), Topology::Omni).unwrap();
        drivetrain.enable();

        assert!(drivetrain.disable().is_err());
        assert!(!drivetrain.is_enabled());
        assert_eq!(record.calls(), vec![(0, 1500), (2, 1500)]);
    }

    #[test]
    fn test_drop_forces_neutral() {
        let sink = RecordingSink::default();
        {
            let mut drivetrain = omni(&sink);
            drivetrain.enable();
        }
        assert_eq!(sink.calls(), vec![(0, 1500), (1, 1500), (2, 1500)]);
    }

    #[test]
    fn test_topology_mismatch() {
        let sink = RecordingSink::default();
        let mut drivetrain = omni(&sink);
        drivetrain.enable();
        let result = drivetrain.drive(DriveCommand::Differential {
            throttle: 0.0,
            steering: 0.0,
        });
        assert!(matches!(result, Err(DriveError::TopologyMismatch { .. })));
        assert!(sink.calls().is_empty());
    }

    #[test]
    fn test_differential_needs_only_two_motors() {
        let sink = RecordingSink::default();
        let mut cal = Calibration::new();
        cal.configure(Wheel::Left, 4, 1000, 1500, 2000).unwrap();
        cal.configure(Wheel::Right, 5, 1000, 1500, 2000).unwrap();
        let mut drivetrain =
            DriveTrain::new(Box::new(sink.clone()), cal, Topology::Differential).unwrap();
        drivetrain.enable();
        drivetrain
            .drive(DriveCommand::Differential {
                throttle: 0.0,
                steering: 1.0,
            })
            .unwrap();
        drivetrain.disable().unwrap();
        assert_eq!(
            sink.calls(),
            vec![(4, 1750), (5, 1250), (4, 1500), (5, 1500)]
        );
    }

    #[test]
    fn test_new_rejects_missing_motor() {
        let mut cal = Calibration::new();
        cal.configure(Wheel::Left, 0, 1000, 1500, 2000).unwrap();
        cal.configure(Wheel::Right, 1, 1000, 1500, 2000).unwrap();
        let result = DriveTrain::new(Box::new(RecordingSink::default()), cal, Topology::Omni);
        assert!(matches!(
            result,
            Err(CalibrationError::UnknownMotor(Wheel::Front))
        ));
    }

    #[test]
    fn test_low_speed_through_drivetrain() {
        let sink = RecordingSink::default();
        let mut drivetrain = omni(&sink);
        drivetrain.select_speed(SpeedMode::Low);
        drivetrain.enable();
        drivetrain
            .drive(DriveCommand::Omni {
                forward: 0.0,
                side: 0.0,
                rotate: -1.0,
            })
            .unwrap();
        assert_eq!(sink.calls(), vec![(0, 1250), (1, 1750), (2, 1750)]);
    }
}
