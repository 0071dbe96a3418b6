use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use ticktrack_ipc::{
    connect, decode_server_message, encode_line, ClientMessage, ServerMessage, TaskRef,
    TaskUpdate, DEFAULT_SOCKET_PATH,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::OwnedReadHalf;
use tokio::time::{timeout_at, Instant};

/// How long to wait for the broadcast that follows a command
const REPLY_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "ticktrackctl")]
#[command(about = "Control the ticktrack timer", long_about = None)]
struct Cli {
    /// Socket the daemon listens on
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start or resume the timer on the selected task
    Start,
    /// Pause the timer
    Pause,
    /// Stop the timer and reset the selected task
    Stop,
    /// Replace the tracked task list, keeping time for known ids.
    /// With no ids the list is cleared.
    Tasks { ids: Vec<String> },
    /// Select the task that accrues time
    Select { id: String },
    /// Show the current timer state
    Status,
    /// Print every update until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let watch = matches!(cli.command, Commands::Watch);

    let command = match cli.command {
        Commands::Start => Some(ClientMessage::StartTimer),
        Commands::Pause => Some(ClientMessage::PauseTimer),
        Commands::Stop => Some(ClientMessage::StopTimer),
        Commands::Tasks { ids } => Some(ClientMessage::UpdateTasks(
            ids.into_iter().map(TaskRef::new).collect(),
        )),
        Commands::Select { id } => Some(ClientMessage::SetActiveTask(TaskRef::new(id))),
        Commands::Status | Commands::Watch => None,
    };

    let stream = connect(&cli.socket).await?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    if let Some(command) = command {
        writer.write_all(&encode_line(&command)?).await?;
    }

    if watch {
        while let Some(update) = next_update(&mut lines).await? {
            println!("{}", format_update(&update));
        }
        return Ok(());
    }

    // Keep the newest update that arrives within the reply window.
    let deadline = Instant::now() + REPLY_TIMEOUT;
    let mut latest = None;
    while let Ok(next) = timeout_at(deadline, next_update(&mut lines)).await {
        match next? {
            Some(update) => latest = Some(update),
            None => break,
        }
    }

    match latest {
        Some(update) => println!("{}", format_update(&update)),
        None => println!("No active task"),
    }

    Ok(())
}

async fn next_update(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Result<Option<TaskUpdate>> {
    while let Some(line) = lines.next_line().await? {
        if let Ok(ServerMessage::TaskUpdate(update)) = decode_server_message(&line) {
            return Ok(Some(update));
        }
    }
    Ok(None)
}

fn format_update(update: &TaskUpdate) -> String {
    format!(
        "{} {} {} total {}",
        update.id.as_deref().unwrap_or("-"),
        format_seconds(update.timer),
        update.run_state,
        format_seconds(update.total_worked)
    )
}

fn format_seconds(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}
