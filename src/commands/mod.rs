//! Console commands

pub mod breath;
pub mod session;

/// A command the console accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandInfo {
    pub name: &'static str,
    pub description: &'static str,
}

impl CommandInfo {
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self { name, description }
    }
}

/// Every console command, in help order
pub fn register() -> Vec<CommandInfo> {
    vec![
        session::register(),
        breath::register(),
        vec![
            CommandInfo::new("help", "List commands"),
            CommandInfo::new("quit", "End the session and exit"),
        ],
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Help text for `help`
pub fn help_text() -> String {
    let commands = register();
    let width = commands.iter().map(|c| c.name.len()).max().unwrap_or(0);
    commands
        .iter()
        .map(|c| format!("  {:width$}  {}", c.name, c.description, width = width))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split a console line into a lower-cased command name and its arguments
pub fn parse(line: &str) -> Option<(String, Vec<&str>)> {
    let mut words = line.split_whitespace();
    let name = words.next()?.to_lowercase();
    Some((name, words.collect()))
}
