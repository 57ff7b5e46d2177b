//! Breath input commands: press, release, devices

use super::CommandInfo;
use crate::audio::list_input_devices;
use crate::controller::SessionController;

type CommandResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Register breath commands
pub fn register() -> Vec<CommandInfo> {
    vec![
        CommandInfo::new("press", "Begin a breath (touch input)"),
        CommandInfo::new("release", "Finish the breath (touch input)"),
        CommandInfo::new("devices", "List microphones (set INPUT_DEVICE to pick one)"),
    ]
}

/// Handle `press`
pub async fn handle_press(controller: &SessionController) -> CommandResult {
    if !controller.press().await {
        println!("Already breathing in; `release` to finish.");
    }
    Ok(())
}

/// Handle `release`
pub async fn handle_release(controller: &SessionController) -> CommandResult {
    if controller.release().await.is_none() {
        println!("Nothing to release; `press` first.");
    }
    Ok(())
}

/// Handle `devices`
pub fn handle_devices() -> CommandResult {
    let devices = list_input_devices();
    if devices.is_empty() {
        println!("No input devices found.");
    } else {
        for name in devices {
            println!("  {}", name);
        }
    }
    Ok(())
}
