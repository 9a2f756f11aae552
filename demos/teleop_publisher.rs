// Keyboard teleop: WASD move, Z/X rotate, E enable, T toggle RC session,
// Space safety cutout, R/F full/low speed, Q quit
//
// Publishes InputState samples (axes [side, forward, rotate]) and control
// signals for the drivetrain runtime.
//
// Usage: cargo run --example teleop_publisher
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use drivetrain_runtime::config::{TOPIC_INPUT, TOPIC_SIGNAL};
use drivetrain_runtime::messages::InputState;
use drivetrain_runtime::signals::ControlSignal;
use std::time::{Duration, Instant};
use tracing::info;

const AXIS_STEP: f32 = 1.0;
const INPUT_TIMEOUT_MS: u64 = 100; // Reset axes after this much time with no input

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let pub_input = session.declare_publisher(TOPIC_INPUT).await?;
    let pub_signal = session.declare_publisher(TOPIC_SIGNAL).await?;

    info!("Controls: WASD=move, Z/X=rotate, E=enable, T=session, Space=cutout, R/F=speed, Q=quit");

    enable_raw_mode()?;
    let result = run_teleop(&pub_input, &pub_signal).await;
    disable_raw_mode()?;

    result
}

async fn run_teleop(
    pub_input: &zenoh::pubsub::Publisher<'_>,
    pub_signal: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Persistent axis state: [side, forward, rotate]
    let mut axes = [0.0f32; 3];
    let mut last_movement_input = Instant::now();

    loop {
        let mut signal = None;

        // Poll for key with 20ms timeout (50Hz effective rate)
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;
                let mut moved = true;

                match code {
                    KeyCode::Char('w') if pressed => axes[1] = AXIS_STEP,
                    KeyCode::Char('s') if pressed => axes[1] = -AXIS_STEP,
                    KeyCode::Char('a') if pressed => axes[0] = -AXIS_STEP,
                    KeyCode::Char('d') if pressed => axes[0] = AXIS_STEP,
                    KeyCode::Char('z') if pressed => axes[2] = -AXIS_STEP,
                    KeyCode::Char('x') if pressed => axes[2] = AXIS_STEP,
                    _ => moved = false,
                }
                if moved {
                    last_movement_input = Instant::now();
                }

                // Edge signals only fire on the initial press
                if kind == KeyEventKind::Press {
                    signal = match code {
                        KeyCode::Char('e') => Some(ControlSignal::Enable),
                        KeyCode::Char('t') => Some(ControlSignal::ToggleSession),
                        KeyCode::Char(' ') => Some(ControlSignal::SafetyCutout),
                        KeyCode::Char('r') => Some(ControlSignal::SpeedFull),
                        KeyCode::Char('f') => Some(ControlSignal::SpeedLow),
                        KeyCode::Char('q') | KeyCode::Esc => break,
                        _ => None,
                    };
                }
            }
        }

        if let Some(signal) = signal {
            info!("Signal: {:?}", signal);
            pub_signal.put(serde_json::to_string(&signal)?).await?;
        }

        // Reset axes if no movement input for INPUT_TIMEOUT_MS
        if last_movement_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            axes = [0.0; 3];
        }

        // Always publish at ~50Hz
        let state = InputState {
            axes: axes.to_vec(),
            buttons: 0,
            connected: true,
        };
        pub_input.put(serde_json::to_string(&state)?).await?;
    }

    // Leave the runtime with a stopped base
    pub_signal
        .put(serde_json::to_string(&ControlSignal::SafetyCutout)?)
        .await?;
    Ok(())
}
