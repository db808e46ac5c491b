/// Operator commands read from the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Quit,
    Status,
    Next,
    TogglePause,
    StreamInfo,
    Help,
}

impl Command {
    /// Parse one input line (case-insensitive). Accepts the single-letter
    /// keys and their long names.
    pub fn parse(line: &str) -> Option<Command> {
        match line.trim().to_lowercase().as_str() {
            "q" | "quit" | "exit" => Some(Command::Quit),
            "s" | "status" => Some(Command::Status),
            "n" | "next" | "skip" => Some(Command::Next),
            "p" | "pause" => Some(Command::TogglePause),
            "i" | "info" => Some(Command::StreamInfo),
            "h" | "help" | "?" => Some(Command::Help),
            _ => None,
        }
    }
}

pub const HELP: &str = "\
Commands:
  q  quit
  s  playback status
  n  next track
  p  pause / resume
  i  stream info
  h  this help";
