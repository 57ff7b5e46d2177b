//! Console front end: stdin command loop and event printer

use crate::commands;
use crate::config::Config;
use crate::controller::{InputMode, SessionController, SessionEvent};
use crate::session::ActivityKind;
use crate::transport::{LocalRelay, SyncTransport};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// State shared by command handlers
pub struct ConsoleState {
    pub config: Arc<Config>,
    pub controller: SessionController,
}

/// Log breath cycles and session events as they happen
fn spawn_event_printer(controller: &SessionController) -> JoinHandle<()> {
    let mut breaths = controller.subscribe_breath_cycles();
    let mut events = controller.subscribe_session_events();
    let controller = controller.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                breath = breaths.recv() => match breath {
                    Ok(event) => info!(
                        "Breath #{} ({}) at {}ms, synchrony {:.2}",
                        event.seq,
                        event.source.as_str(),
                        event.timestamp_ms,
                        controller.synchrony_level()
                    ),
                    Err(RecvError::Lagged(n)) => warn!("Missed {} breath notification(s)", n),
                    Err(RecvError::Closed) => break,
                },
                event = events.recv() => match event {
                    Ok(SessionEvent::ParticipantJoined(p)) => info!("{} joined", p.display_name),
                    Ok(SessionEvent::ParticipantLeft(id)) => info!("Participant {} left", id),
                    Ok(SessionEvent::Started) => info!("Exercise started"),
                    Ok(SessionEvent::Ended(summary)) => info!(
                        "[{}] Ended with best synchrony {:.2}",
                        summary.code, summary.best_synchrony
                    ),
                    Ok(SessionEvent::DeviceUnavailable(e)) => {
                        warn!("No microphone ({}); use `press` and `release` to breathe", e)
                    }
                    Err(RecvError::Lagged(n)) => warn!("Missed {} session event(s)", n),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

/// Dispatch one console line; returns false on `quit`
async fn dispatch(state: &ConsoleState, line: &str) -> bool {
    let Some((name, args)) = commands::parse(line) else {
        return true;
    };
    let controller = &state.controller;

    let result = match name.as_str() {
        "create" => commands::session::handle_create(controller, &state.config.display_name, &args).await,
        "start" => commands::session::handle_start(controller).await,
        "status" => commands::session::handle_status(controller),
        "end" => commands::session::handle_end(controller).await,
        "press" => commands::breath::handle_press(controller).await,
        "release" => commands::breath::handle_release(controller).await,
        "devices" => commands::breath::handle_devices(),
        "help" => {
            println!("{}", commands::help_text());
            Ok(())
        }
        "quit" | "exit" => return false,
        other => {
            println!("Unknown command `{}`. Type `help` for a list.", other);
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("Command error: {}", e);
        println!("Error: {}", e);
    }
    true
}

/// Open a solo session on an in-process relay and run the command loop
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Arc::new(config);

    let relay: Arc<dyn SyncTransport> = Arc::new(LocalRelay::new(config.max_participants));
    let controller = SessionController::new((*config).clone(), relay);
    let printer = spawn_event_printer(&controller);

    let code = controller
        .create_session(ActivityKind::default(), &config.display_name)
        .await?;
    info!("[{}] Session open as {}", code, config.display_name);

    match controller.enable_microphone().await {
        InputMode::Microphone => info!("Breathe into the microphone once the exercise starts"),
        _ => info!("Touch input: `press` while breathing in, `release` when done"),
    }
    println!("Session {} ready. Type `start` to begin, `help` for commands.", code);

    let state = ConsoleState { config, controller };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !dispatch(&state, &line).await {
            break;
        }
    }

    // An exercise still running is ended so its summary gets printed
    commands::session::handle_end(&state.controller).await?;
    state.controller.shutdown().await;
    printer.abort();

    info!("Goodbye");
    Ok(())
}
