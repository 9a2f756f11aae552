// Input sources: where normalized axes and buttons come from
//
// The runtime polls an InputSource once per loop tick. A source that has
// nothing usable yet answers NoInputData, which is not an error and not a
// cutout. Lost connections show up as `connected: false`.

use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use zenoh::handlers::FifoChannelHandler;
use zenoh::pubsub::Subscriber;
use zenoh::sample::Sample;

use crate::messages::InputState;
use crate::motor::{DriveCommand, Topology};

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("Could not create connection within {attempts} tries: {last}")]
    Connection { attempts: u32, last: String },

    #[error("Input source failed: {0}")]
    Source(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputReading {
    Sample(InputState),
    /// Source is up but has no usable data (e.g. no peripheral attached)
    NoInputData,
}

pub trait InputSource {
    fn poll(&mut self) -> Result<InputReading, InputError>;
}

/// Input source shared between the primary loop and a control session
pub type SharedInput = Arc<Mutex<dyn InputSource + Send>>;

pub fn lock_input(input: &SharedInput) -> MutexGuard<'_, dyn InputSource + Send + 'static> {
    input.lock().unwrap_or_else(|poisoned| {
        warn!("Input lock poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Which raw axis index feeds each drive axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisMap {
    pub throttle: usize,
    pub steering: usize,
    pub forward: usize,
    pub side: usize,
    pub rotate: usize,
}

impl Default for AxisMap {
    // Left stick: x = 0, y = 1; right stick x = 2
    fn default() -> Self {
        Self {
            throttle: 1,
            steering: 0,
            forward: 1,
            side: 0,
            rotate: 2,
        }
    }
}

impl AxisMap {
    /// Build a drive command, or `None` if the sample lacks a required axis
    pub fn command(&self, topology: Topology, state: &InputState) -> Option<DriveCommand> {
        match topology {
            Topology::Differential => Some(DriveCommand::Differential {
                throttle: state.axis(self.throttle)?,
                steering: state.axis(self.steering)?,
            }),
            Topology::Omni => Some(DriveCommand::Omni {
                forward: state.axis(self.forward)?,
                side: state.axis(self.side)?,
                rotate: state.axis(self.rotate)?,
            }),
        }
    }
}

/// Latest sample plus its age, with the watchdog applied on read
#[derive(Debug)]
struct LatestInput {
    state: Option<InputState>,
    received_at: Instant,
    timeout: Duration,
    stale: bool,
}

impl LatestInput {
    fn new(timeout: Duration) -> Self {
        Self {
            state: None,
            received_at: Instant::now(),
            timeout,
            stale: false,
        }
    }

    fn update(&mut self, state: InputState, now: Instant) {
        self.state = Some(state);
        self.received_at = now;
    }

    fn reading(&mut self, now: Instant) -> InputReading {
        let Some(state) = &self.state else {
            return InputReading::NoInputData;
        };

        let age = now.saturating_duration_since(self.received_at);
        if age > self.timeout {
            if !self.stale {
                warn!("Input stale ({:?} old), reporting disconnected", age);
            }
            self.stale = true;
            return InputReading::Sample(InputState {
                connected: false,
                ..state.clone()
            });
        }
        if self.stale {
            info!("Input fresh again");
        }
        self.stale = false;

        if state.connected && state.axes.is_empty() {
            return InputReading::NoInputData;
        }
        InputReading::Sample(state.clone())
    }
}

/// Input samples published as JSON on a zenoh topic
pub struct ZenohInputSource {
    subscriber: Subscriber<FifoChannelHandler<Sample>>,
    latest: LatestInput,
}

impl ZenohInputSource {
    pub fn new(subscriber: Subscriber<FifoChannelHandler<Sample>>, timeout: Duration) -> Self {
        Self {
            subscriber,
            latest: LatestInput::new(timeout),
        }
    }
}

impl InputSource for ZenohInputSource {
    fn poll(&mut self) -> Result<InputReading, InputError> {
        // Drain all pending samples (non-blocking), keep latest
        loop {
            match self.subscriber.try_recv() {
                Ok(Some(sample)) => {
                    let payload = sample.payload().to_bytes();
                    match serde_json::from_slice::<InputState>(&payload) {
                        Ok(state) => self.latest.update(state, Instant::now()),
                        Err(e) => warn!("Failed to parse input sample: {}", e),
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(InputError::Source(e.to_string())),
            }
        }
        Ok(self.latest.reading(Instant::now()))
    }
}

/// Keep calling `connect` until it succeeds or `max_tries` attempts fail
pub async fn connect_with_retry<T, E, F, Fut>(
    max_tries: u32,
    delay: Duration,
    mut connect: F,
) -> Result<T, InputError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_tries = max_tries.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match connect().await {
            Ok(conn) => return Ok(conn),
            Err(e) if attempt >= max_tries => {
                error!("Cannot create connection: {}", e);
                return Err(InputError::Connection {
                    attempts: attempt,
                    last: e.to_string(),
                });
            }
            Err(e) => {
                warn!("Error opening connection (attempt {}/{}): {}", attempt, max_tries, e);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
