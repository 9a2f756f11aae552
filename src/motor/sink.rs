// Pulse sink: the boundary to the pulse generation hardware
//
// The runtime only decides pulse lengths. Turning a pulse into register
// writes on the PWM chip is done by whoever consumes these commands.

use tracing::debug;
use zenoh::Wait;
use zenoh::pubsub::Publisher;

use crate::config::{PWM_FREQ_HZ, PWM_RESOLUTION};
use crate::messages::PulseCommand;

#[derive(Debug, thiserror::Error)]
pub enum PulseSinkError {
    #[error("Failed to encode pulse command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to publish pulse for channel {channel}: {reason}")]
    Publish { channel: u8, reason: String },
}

/// Anything that can receive a pulse length for a channel
pub trait PulseSink {
    fn send(&mut self, channel: u8, pulse_us: u16) -> Result<(), PulseSinkError>;
}

/// Convert a pulse length to duty-cycle ticks for a PWM carrier
///
/// e.g. at 50 Hz with 12 bits, one tick is 20000 / 4096 ~= 4.88 us
pub fn pulse_to_ticks(pulse_us: u16, freq_hz: u32, resolution: u32) -> u16 {
    let us_per_tick = 1_000_000.0 / freq_hz as f64 / resolution as f64;
    let ticks = (pulse_us as f64 / us_per_tick) as u32;
    ticks.min(resolution - 1) as u16
}

/// Dry-run sink: logs every pulse and drives nothing
#[derive(Debug, Default)]
pub struct LogPulseSink;

impl PulseSink for LogPulseSink {
    fn send(&mut self, channel: u8, pulse_us: u16) -> Result<(), PulseSinkError> {
        debug!(
            "pulse {} us ({} ticks) - channel {}",
            pulse_us,
            pulse_to_ticks(pulse_us, PWM_FREQ_HZ, PWM_RESOLUTION),
            channel
        );
        Ok(())
    }
}

/// Publishes each pulse as JSON for an external pulse-bus bridge
pub struct ZenohPulseSink {
    publisher: Publisher<'static>,
}

impl ZenohPulseSink {
    pub fn new(publisher: Publisher<'static>) -> Self {
        Self { publisher }
    }
}

impl PulseSink for ZenohPulseSink {
    fn send(&mut self, channel: u8, pulse_us: u16) -> Result<(), PulseSinkError> {
        let cmd = PulseCommand { channel, pulse_us };
        debug!(
            "pulse {} us ({} ticks) - channel {}",
            pulse_us,
            pulse_to_ticks(pulse_us, PWM_FREQ_HZ, PWM_RESOLUTION),
            channel
        );

        let payload = serde_json::to_string(&cmd)?;
        self.publisher
            .put(payload)
            .wait()
            .map_err(|e| PulseSinkError::Publish {
                channel,
                reason: e.to_string(),
            })
    }
}
