// Edge-triggered control signals and the queue the primary loop drains
//
// Producers (zenoh topic, ctrl-c, buttons) push debounced signals onto an
// unbounded channel. Only the primary loop consumes them, one at a time.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zenoh::handlers::FifoChannelHandler;
use zenoh::pubsub::Subscriber;
use zenoh::sample::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    StartSession,
    StopSession,
    ToggleSession,
    SafetyCutout,
    Enable,
    SpeedFull,
    SpeedLow,
    Shutdown,
}

pub type SignalSender = mpsc::UnboundedSender<ControlSignal>;
pub type SignalReceiver = mpsc::UnboundedReceiver<ControlSignal>;

pub fn signal_channel() -> (SignalSender, SignalReceiver) {
    mpsc::unbounded_channel()
}

/// Drops repeats of the same signal inside a time window
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last: HashMap<ControlSignal, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    /// Returns true if the signal should be let through
    pub fn accept(&mut self, signal: ControlSignal, now: Instant) -> bool {
        if let Some(&prev) = self.last.get(&signal) {
            if now.saturating_duration_since(prev) < self.window {
                debug!("Debounced {:?}", signal);
                return false;
            }
        }
        self.last.insert(signal, now);
        true
    }
}

/// Forward signals published on a zenoh topic into the queue until the
/// queue's receiver is dropped or the subscriber closes.
pub async fn forward_signals(
    subscriber: Subscriber<FifoChannelHandler<Sample>>,
    tx: SignalSender,
    window: Duration,
) {
    let mut debouncer = Debouncer::new(window);

    while let Ok(sample) = subscriber.recv_async().await {
        let payload = sample.payload().to_bytes();
        let signal = match serde_json::from_slice::<ControlSignal>(&payload) {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Failed to parse control signal: {}", e);
                continue;
            }
        };

        if !debouncer.accept(signal, Instant::now()) {
            continue;
        }
        if tx.send(signal).is_err() {
            break;
        }
    }
    info!("Signal forwarding stopped");
}
