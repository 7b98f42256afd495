// --- Operator console (stdin) ---------------------------------------------
//
// One command per line:
//   list | index | current | output | next | prev | add <path> | remove <path> | quit

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use crate::supervisor::Supervisor;

const HELP: &str = "commands: list, index, current, output, next, prev, add <path>, remove <path>, quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    List,
    Index,
    Current,
    Output,
    Next,
    Prev,
    Add(String),
    Remove(String),
    Quit,
    Help,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((w, r)) => (w, r.trim()),
            None => (line, ""),
        };
        let cmd = match (word, rest.is_empty()) {
            ("list", true) => ConsoleCommand::List,
            ("index", true) => ConsoleCommand::Index,
            ("current", true) => ConsoleCommand::Current,
            ("output", true) => ConsoleCommand::Output,
            ("next", true) => ConsoleCommand::Next,
            ("prev", true) => ConsoleCommand::Prev,
            ("quit", true) => ConsoleCommand::Quit,
            ("add", false) => ConsoleCommand::Add(rest.to_string()),
            ("remove", false) => ConsoleCommand::Remove(rest.to_string()),
            _ => ConsoleCommand::Help,
        };
        Some(cmd)
    }
}

/// Run one command and return the text to print (possibly empty).
pub async fn execute(sup: &Supervisor, cmd: ConsoleCommand) -> String {
    match cmd {
        ConsoleCommand::List => format!("{:?}", sup.playlist_paths()),
        ConsoleCommand::Index => sup.current_index().to_string(),
        ConsoleCommand::Current => sup
            .current_video_path()
            .unwrap_or_else(|| "no video streaming".to_string()),
        ConsoleCommand::Output => sup.recent_output(),
        ConsoleCommand::Next => {
            sup.next().await;
            String::new()
        }
        ConsoleCommand::Prev => {
            sup.prev().await;
            String::new()
        }
        ConsoleCommand::Add(path) => {
            sup.add(path);
            String::new()
        }
        ConsoleCommand::Remove(path) => {
            if sup.remove(&path).await {
                String::new()
            } else {
                format!("not in playlist: {path}")
            }
        }
        ConsoleCommand::Quit => {
            info!("quit requested from console");
            sup.close().await;
            String::new()
        }
        ConsoleCommand::Help => HELP.to_string(),
    }
}

/// Read commands from stdin until EOF or `quit`.
pub async fn run(sup: Arc<Supervisor>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = sup.closed() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("stdin closed, console stopped");
                break;
            }
            Err(e) => {
                debug!("stdin read failed, console stopped: {e}");
                break;
            }
        };
        let Some(cmd) = ConsoleCommand::parse(&line) else {
            continue;
        };
        let quit = cmd == ConsoleCommand::Quit;
        let out = execute(&sup, cmd).await;
        if !out.is_empty() {
            println!("{out}");
        }
        if quit {
            break;
        }
    }
}
