// Background remote-control session
//
// At most one session runs at a time. It owns its task handle and a
// cooperative stop flag, and shares the drivetrain and input source with
// the primary loop, which stops driving while a session is active.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};

use crate::input::{AxisMap, InputReading, SharedInput, lock_input};
use crate::messages::SessionOwner;
use crate::motor::{SharedDriveTrain, lock};

/// Why a session's loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// Stop flag was set
    Stopped,
    /// Controller lost or safety button pressed
    Cutout,
    /// Input or drive error; the drivetrain was disabled
    Failed,
}

struct ControlSession {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<SessionExit>,
}

/// What a session needs to drive the base
#[derive(Clone)]
struct SessionContext {
    drivetrain: SharedDriveTrain,
    input: SharedInput,
    axes: AxisMap,
    safety_mask: u32,
    period: Duration,
}

pub struct SessionManager {
    ctx: SessionContext,
    session: Option<ControlSession>,
}

impl SessionManager {
    pub fn new(
        drivetrain: SharedDriveTrain,
        input: SharedInput,
        axes: AxisMap,
        safety_mask: u32,
        period: Duration,
    ) -> Self {
        Self {
            ctx: SessionContext {
                drivetrain,
                input,
                axes,
                safety_mask,
                period,
            },
            session: None,
        }
    }

    /// True while a session task is running
    pub fn is_active(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    pub fn owner(&self) -> SessionOwner {
        if self.is_active() {
            SessionOwner::Rc
        } else {
            SessionOwner::None
        }
    }

    /// Start a session if none is running, otherwise stop the current one
    pub async fn toggle(&mut self) -> Option<SessionExit> {
        self.reap().await;
        if self.session.is_some() {
            self.stop().await
        } else {
            self.start().await;
            None
        }
    }

    /// Start a session unless one is already running. Returns whether a new
    /// one was started.
    pub async fn start(&mut self) -> bool {
        self.reap().await;
        if self.session.is_some() {
            return false;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run_session(self.ctx.clone(), stop.clone()));
        self.session = Some(ControlSession { stop, handle });
        info!("RC session started");
        true
    }

    /// Signal the session to stop and wait for its task to finish
    pub async fn stop(&mut self) -> Option<SessionExit> {
        let session = self.session.take()?;
        session.stop.store(true, Ordering::Release);
        let exit = self.join(session).await;
        info!("RC session stopped ({:?})", exit);
        Some(exit)
    }

    /// Clear a session whose loop already ended on its own
    pub async fn reap(&mut self) -> Option<SessionExit> {
        if !self
            .session
            .as_ref()
            .is_some_and(|s| s.handle.is_finished())
        {
            return None;
        }
        let session = self.session.take()?;
        let exit = self.join(session).await;
        info!("RC session ended ({:?})", exit);
        Some(exit)
    }

    async fn join(&self, session: ControlSession) -> SessionExit {
        match session.handle.await {
            Ok(exit) => exit,
            Err(e) => {
                error!("RC session task failed: {}", e);
                disable(&self.ctx.drivetrain);
                SessionExit::Failed
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.stop.store(true, Ordering::Release);
        }
    }
}

fn disable(drivetrain: &SharedDriveTrain) {
    if let Err(e) = lock(drivetrain).disable() {
        warn!("Neutral command failed during disable: {}", e);
    }
}

async fn run_session(ctx: SessionContext, stop: Arc<AtomicBool>) -> SessionExit {
    let mut tick = interval(ctx.period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tick.tick().await;

        if stop.load(Ordering::Acquire) {
            return SessionExit::Stopped;
        }

        let reading = lock_input(&ctx.input).poll();
        let state = match reading {
            Ok(InputReading::Sample(state)) => state,
            Ok(InputReading::NoInputData) => continue,
            Err(e) => {
                error!("RC session input failed: {}", e);
                disable(&ctx.drivetrain);
                return SessionExit::Failed;
            }
        };

        if state.is_cutout(ctx.safety_mask) {
            warn!("RC session cutout (connected: {})", state.connected);
            disable(&ctx.drivetrain);
            return SessionExit::Cutout;
        }

        let topology = lock(&ctx.drivetrain).topology();
        let Some(command) = ctx.axes.command(topology, &state) else {
            continue;
        };

        let result = lock(&ctx.drivetrain).drive(command);
        if let Err(e) = result {
            error!("RC session drive failed: {}", e);
            disable(&ctx.drivetrain);
            return SessionExit::Failed;
        }
    }
}
