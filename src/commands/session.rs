//! Session commands: create, start, status, end

use super::CommandInfo;
use crate::controller::SessionController;
use crate::session::{ActivityKind, SessionState};
use tracing::info;

type CommandResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Register session commands
pub fn register() -> Vec<CommandInfo> {
    vec![
        CommandInfo::new("create", "Open a new session lobby [group_breathing|balloon_race|campfire]"),
        CommandInfo::new("start", "Start the exercise (host only)"),
        CommandInfo::new("status", "Show session state and synchrony"),
        CommandInfo::new("end", "End the session and print the summary (host only)"),
    ]
}

/// Handle `create [kind]`
pub async fn handle_create(controller: &SessionController, name: &str, args: &[&str]) -> CommandResult {
    let kind = match args.first() {
        Some(raw) => ActivityKind::from_str(raw).ok_or_else(|| format!("Unknown activity: {}", raw))?,
        None => ActivityKind::default(),
    };

    let code = controller.create_session(kind, name).await?;
    // Ending a session releases the microphone, so pick input again
    let input = controller.enable_microphone().await;
    respond(&format!(
        "Session {} open ({}, {} input). Type `start` to begin.",
        code,
        kind.as_str(),
        input.as_str()
    ));
    Ok(())
}

/// Handle `start`
pub async fn handle_start(controller: &SessionController) -> CommandResult {
    controller.start_session().await?;
    respond("Exercise started. Breathe together!");
    Ok(())
}

/// Handle `status`
pub fn handle_status(controller: &SessionController) -> CommandResult {
    let state = match controller.session_state() {
        Some(state) => state,
        None => {
            respond(&format!(
                "No session. Input: {}. Type `create` to open one.",
                controller.input_mode().as_str()
            ));
            return Ok(());
        }
    };

    let code = controller
        .session_code()
        .map(|c| c.to_string())
        .unwrap_or_default();
    let names: Vec<String> = controller
        .participants()
        .into_iter()
        .map(|p| {
            if p.is_host {
                format!("{} (host)", p.display_name)
            } else {
                p.display_name
            }
        })
        .collect();

    respond(&format!(
        "Session {} [{}] input={} synchrony={:.2} best={:.2}\nParticipants: {} ({} breathing now)",
        code,
        state,
        controller.input_mode().as_str(),
        controller.synchrony_level(),
        controller.best_synchrony(),
        names.join(", "),
        controller.active_participants().len()
    ));
    Ok(())
}

/// Handle `end`
pub async fn handle_end(controller: &SessionController) -> CommandResult {
    if controller.session_state() != Some(SessionState::Active) {
        respond("No active session to end.");
        return Ok(());
    }

    controller.end_session().await?;
    if let Some(summary) = controller.last_summary() {
        respond(&serde_json::to_string_pretty(&summary)?);
        info!("[{}] Summary printed", summary.code);
    }
    Ok(())
}

/// Console output
fn respond(content: &str) {
    println!("{}", content);
}
