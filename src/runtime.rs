// 20 Hz primary loop with safety interlock
// Note: the loop period is also a rate limit for the pulse bus bridge
//
// Each tick: drain queued control signals, then either leave the motors to
// an active RC session or poll the input source and drive directly.
// Any error ends the loop, and the drivetrain is disabled before returning.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};
use zenoh::pubsub::Publisher;

use crate::config::{
    CONNECT_MAX_TRIES, CONNECT_RETRY_DELAY, DriveConfig, INPUT_TIMEOUT, LOOP_HZ, SIGNAL_DEBOUNCE,
    TOPIC_HEALTH, TOPIC_INPUT, TOPIC_PULSE, TOPIC_SIGNAL,
};
use crate::input::{
    AxisMap, InputError, InputReading, SharedInput, ZenohInputSource, connect_with_retry,
    lock_input,
};
use crate::messages::{DriveHealth, InputStatus};
use crate::motor::{
    DriveError, DriveTrain, LogPulseSink, PulseSink, SharedDriveTrain, SpeedMode, ZenohPulseSink,
    lock,
};
use crate::session::SessionManager;
use crate::signals::{ControlSignal, SignalReceiver, forward_signals, signal_channel};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Drive(#[from] DriveError),
}

pub struct Runtime {
    drivetrain: SharedDriveTrain,
    input: SharedInput,
    sessions: SessionManager,
    axes: AxisMap,
    safety_mask: u32,
    input_status: InputStatus,
    running: bool,
}

impl Runtime {
    pub fn new(
        drivetrain: SharedDriveTrain,
        input: SharedInput,
        axes: AxisMap,
        safety_mask: u32,
        period: Duration,
    ) -> Self {
        let sessions = SessionManager::new(
            drivetrain.clone(),
            input.clone(),
            axes,
            safety_mask,
            period,
        );
        Self {
            drivetrain,
            input,
            sessions,
            axes,
            safety_mask,
            input_status: InputStatus::NoData,
            running: true,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn health(&self) -> DriveHealth {
        let drivetrain = lock(&self.drivetrain);
        DriveHealth {
            enabled: drivetrain.is_enabled(),
            speed: drivetrain.speed(),
            session: self.sessions.owner(),
            input: self.input_status,
        }
    }

    /// Apply one control signal
    pub async fn handle_signal(&mut self, signal: ControlSignal) {
        info!("Signal: {:?}", signal);
        match signal {
            ControlSignal::StartSession => {
                self.sessions.start().await;
            }
            ControlSignal::StopSession => {
                self.sessions.stop().await;
            }
            ControlSignal::ToggleSession => {
                self.sessions.toggle().await;
            }
            ControlSignal::SafetyCutout => {
                warn!("Safety cutout");
                self.disable();
                self.sessions.stop().await;
            }
            ControlSignal::Enable => lock(&self.drivetrain).enable(),
            ControlSignal::SpeedFull => lock(&self.drivetrain).select_speed(SpeedMode::Full),
            ControlSignal::SpeedLow => lock(&self.drivetrain).select_speed(SpeedMode::Low),
            ControlSignal::Shutdown => self.running = false,
        }
    }

    /// One primary loop iteration
    pub async fn step(&mut self) -> Result<(), RuntimeError> {
        self.sessions.reap().await;

        // A running session owns the motors
        if self.sessions.is_active() {
            self.input_status = InputStatus::Suspended;
            return Ok(());
        }

        let reading = lock_input(&self.input).poll();
        let state = match reading {
            Ok(InputReading::Sample(state)) => state,
            Ok(InputReading::NoInputData) => {
                self.input_status = InputStatus::NoData;
                return Ok(());
            }
            Err(e) => {
                self.input_status = InputStatus::Error;
                return Err(e.into());
            }
        };

        if state.is_cutout(self.safety_mask) {
            if self.input_status != InputStatus::Cutout {
                warn!("Input cutout (connected: {}), stopping motors", state.connected);
            }
            self.input_status = InputStatus::Cutout;
            self.disable();
            return Ok(());
        }

        let topology = lock(&self.drivetrain).topology();
        let Some(command) = self.axes.command(topology, &state) else {
            self.input_status = InputStatus::NoData;
            return Ok(());
        };

        self.input_status = InputStatus::Ok;
        lock(&self.drivetrain).drive(command)?;
        Ok(())
    }

    /// Stop any session and force the drivetrain to neutral
    pub async fn shutdown(&mut self) {
        self.disable();
        self.sessions.stop().await;
        self.running = false;
        info!("Runtime stopped, drive disabled");
    }

    fn disable(&self) {
        if let Err(e) = lock(&self.drivetrain).disable() {
            error!("Neutral command failed: {}", e);
        }
    }

    async fn run_loop(
        &mut self,
        signals: &mut SignalReceiver,
        pub_health: &Publisher<'_>,
        period: Duration,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.running {
            tick.tick().await;

            // 1. Drain queued signals, in order
            while let Ok(signal) = signals.try_recv() {
                self.handle_signal(signal).await;
                if !self.running {
                    return Ok(());
                }
            }

            // 2. Poll and drive (or leave it to the session)
            self.step().await?;

            // 3. Publish health
            let health_json = serde_json::to_string(&self.health())?;
            pub_health.put(health_json).await?;
        }
        Ok(())
    }
}

pub async fn run(
    config: DriveConfig,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let calibration = config.calibration()?;

    info!("Opening Zenoh session...");
    let session = connect_with_retry(CONNECT_MAX_TRIES, CONNECT_RETRY_DELAY, || async {
        zenoh::open(zenoh::Config::default()).await
    })
    .await?;

    info!("Setting up publishers and subscribers...");
    let sink: Box<dyn PulseSink + Send> = if dry_run {
        info!("Dry run: pulses are only logged");
        Box::new(LogPulseSink)
    } else {
        Box::new(ZenohPulseSink::new(
            session.declare_publisher(TOPIC_PULSE).await?,
        ))
    };
    let drivetrain = DriveTrain::new(sink, calibration, config.topology)?.into_shared();

    let input_sub = session.declare_subscriber(TOPIC_INPUT).await?;
    let input: SharedInput = Arc::new(Mutex::new(ZenohInputSource::new(input_sub, INPUT_TIMEOUT)));
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let (tx, mut rx) = signal_channel();
    let signal_sub = session.declare_subscriber(TOPIC_SIGNAL).await?;
    tokio::spawn(forward_signals(signal_sub, tx.clone(), SIGNAL_DEBOUNCE));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(ControlSignal::Shutdown);
        }
    });

    let period = Duration::from_millis(1000 / LOOP_HZ);
    let mut runtime = Runtime::new(
        drivetrain,
        input,
        config.axes,
        config.safety_button_mask,
        period,
    );

    info!(
        "Runtime started: {}Hz loop, {}ms input watchdog, {:?} drivetrain",
        LOOP_HZ,
        INPUT_TIMEOUT.as_millis(),
        config.topology
    );
    info!("Subscribed to: {}, {}", TOPIC_INPUT, TOPIC_SIGNAL);
    info!("Publishing to: {}, {}", TOPIC_PULSE, TOPIC_HEALTH);

    let result = runtime.run_loop(&mut rx, &pub_health, period).await;
    if let Err(e) = &result {
        error!("Runtime loop failed: {}", e);
    }
    runtime.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputSource;
    use crate::input::testing::ScriptedInput;
    use crate::messages::{InputState, SessionOwner};
    use crate::motor::sink::testing::RecordingSink;
    use crate::motor::{Calibration, Topology, Wheel};

    const PERIOD: Duration = Duration::from_millis(5);

    struct BrokenInput;

    impl InputSource for BrokenInput {
        fn poll(&mut self) -> Result<InputReading, InputError> {
            Err(InputError::Source("device unplugged".to_string()))
        }
    }

    fn drivetrain(sink: &RecordingSink) -> SharedDriveTrain {
        let mut cal = Calibration::new();
        cal.configure(Wheel::Left, 0, 1000, 1500, 2000).unwrap();
        cal.configure(Wheel::Right, 1, 1000, 1500, 2000).unwrap();
        cal.configure(Wheel::Front, 2, 1000, 1500, 2000).unwrap();
        DriveTrain::new(Box::new(sink.clone()), cal, Topology::Omni)
            .unwrap()
            .into_shared()
    }

    fn runtime(sink: &RecordingSink, input: impl InputSource + Send + 'static) -> Runtime {
        Runtime::new(
            drivetrain(sink),
            Arc::new(Mutex::new(input)),
            AxisMap::default(),
            0x0080,
            PERIOD,
        )
    }

    fn sample(axes: Vec<f32>, buttons: u32, connected: bool) -> InputReading {
        InputReading::Sample(InputState {
            axes,
            buttons,
            connected,
        })
    }

    #[tokio::test]
    async fn test_disabled_step_sends_nothing() {
        let sink = RecordingSink::default();
        let mut rt = runtime(&sink, ScriptedInput::steady(vec![0.0, 0.5, 0.0]));
        rt.step().await.unwrap();
        assert!(sink.calls().is_empty());
        assert_eq!(rt.health().input, InputStatus::Ok);
        assert!(!rt.health().enabled);
    }

    #[tokio::test]
    async fn test_enable_then_step_drives() {
        let sink = RecordingSink::default();
        let mut rt = runtime(&sink, ScriptedInput::steady(vec![0.0, 0.5, 0.0]));
        rt.handle_signal(ControlSignal::Enable).await;
        rt.step().await.unwrap();
        assert_eq!(sink.calls(), vec![(0, 1285), (1, 1285), (2, 1500)]);
    }

    #[tokio::test]
    async fn test_speed_signals() {
        let sink = RecordingSink::default();
        let mut rt = runtime(&sink, ScriptedInput::steady(vec![0.0, 0.0, 1.0]));
        rt.handle_signal(ControlSignal::SpeedLow).await;
        assert_eq!(rt.health().speed, SpeedMode::Low);
        rt.handle_signal(ControlSignal::Enable).await;
        rt.step().await.unwrap();
        assert_eq!(sink.calls(), vec![(0, 1750), (1, 1250), (2, 1250)]);

        rt.handle_signal(ControlSignal::SpeedFull).await;
        assert_eq!(rt.health().speed, SpeedMode::Full);
    }

    #[tokio::test]
    async fn test_safety_cutout_signal_stops_everything() {
        let sink = RecordingSink::default();
        let mut rt = runtime(&sink, ScriptedInput::steady(vec![0.0, 0.0, 0.0]));
        rt.handle_signal(ControlSignal::Enable).await;
        rt.handle_signal(ControlSignal::StartSession).await;
        assert_eq!(rt.health().session, SessionOwner::Rc);

        rt.handle_signal(ControlSignal::SafetyCutout).await;
        let health = rt.health();
        assert!(!health.enabled);
        assert_eq!(health.session, SessionOwner::None);
        assert!(sink.calls().ends_with(&[(0, 1500), (1, 1500), (2, 1500)]));
    }

    #[tokio::test]
    async fn test_input_cutout_disables() {
        let sink = RecordingSink::default();
        let input = ScriptedInput::new(vec![
            sample(vec![0.0, 0.5, 0.0], 0, true),
            sample(vec![0.0, 0.5, 0.0], 0x0080, true),
            sample(vec![0.0, 0.5, 0.0], 0, false),
        ]);
        let mut rt = runtime(&sink, input);
        rt.handle_signal(ControlSignal::Enable).await;

        rt.step().await.unwrap();
        rt.step().await.unwrap();
        assert_eq!(rt.health().input, InputStatus::Cutout);
        assert!(!rt.health().enabled);
        assert_eq!(
            sink.calls(),
            vec![(0, 1285), (1, 1285), (2, 1500), (0, 1500), (1, 1500), (2, 1500)]
        );

        // Stays disabled until re-enabled
        rt.step().await.unwrap();
        assert_eq!(sink.calls().len(), 6);
    }

    #[tokio::test]
    async fn test_no_input_data_is_not_a_cutout() {
        let sink = RecordingSink::default();
        let mut rt = runtime(&sink, ScriptedInput::new(vec![InputReading::NoInputData]));
        rt.handle_signal(ControlSignal::Enable).await;
        rt.step().await.unwrap();
        let health = rt.health();
        assert_eq!(health.input, InputStatus::NoData);
        assert!(health.enabled);
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_axis_is_no_data() {
        let sink = RecordingSink::default();
        let mut rt = runtime(&sink, ScriptedInput::steady(vec![0.5, 0.5]));
        rt.handle_signal(ControlSignal::Enable).await;
        rt.step().await.unwrap();
        assert_eq!(rt.health().input, InputStatus::NoData);
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_primary_loop_suspends_while_session_active() {
        let sink = RecordingSink::default();
        let input = ScriptedInput::steady(vec![0.0, 0.5, 0.0]);
        let polls = input.polls.clone();
        let mut rt = runtime(&sink, input);

        rt.handle_signal(ControlSignal::ToggleSession).await;
        let before = polls.load(std::sync::atomic::Ordering::SeqCst);
        rt.step().await.unwrap();
        assert_eq!(rt.health().input, InputStatus::Suspended);
        // The step itself did not poll; only the session may have
        assert!(polls.load(std::sync::atomic::Ordering::SeqCst) <= before + 1);

        rt.handle_signal(ControlSignal::ToggleSession).await;
        assert_eq!(rt.health().session, SessionOwner::None);
        rt.step().await.unwrap();
        assert_eq!(rt.health().input, InputStatus::Ok);
    }

    #[tokio::test]
    async fn test_step_error_propagates() {
        let sink = RecordingSink::default();
        let mut rt = runtime(&sink, BrokenInput);
        rt.handle_signal(ControlSignal::Enable).await;
        assert!(matches!(rt.step().await, Err(RuntimeError::Input(_))));
        assert_eq!(rt.health().input, InputStatus::Error);

        rt.shutdown().await;
        assert!(!rt.health().enabled);
        assert_eq!(sink.calls(), vec![(0, 1500), (1, 1500), (2, 1500)]);
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let sink = RecordingSink::default();
        let mut rt = runtime(&sink, ScriptedInput::steady(vec![0.0; 3]));
        rt.handle_signal(ControlSignal::Enable).await;
        rt.handle_signal(ControlSignal::StartSession).await;
        rt.handle_signal(ControlSignal::Shutdown).await;
        assert!(!rt.is_running());

        rt.shutdown().await;
        let health = rt.health();
        assert!(!health.enabled);
        assert_eq!(health.session, SessionOwner::None);
    }
}
