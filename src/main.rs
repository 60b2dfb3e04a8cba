use anyhow::Result;
use chrono::Local;
use clap::Parser;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, Level};
use tracing_subscriber::{fmt, EnvFilter};

mod collection;
mod config;
mod dispatcher;
mod error;
mod events;
mod machine;
mod macros;
mod repl;
mod session;
#[cfg(test)]
mod testutil;

use config::ConfigManager;
use events::{AppEvent, EventBus};
use repl::App;
use session::ProcessTransport;

#[derive(Parser)]
#[command(
    name = "remac",
    version,
    about = "Manage remote build machines and run command macros over SSH"
)]
struct Cli {
    /// Use this configuration directory instead of the platform default
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Directory log files are written to
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    if !cli.log_dir.exists() {
        std::fs::create_dir_all(&cli.log_dir)?;
    }
    let log_file = format!(
        "{}/remac_{}.log",
        cli.log_dir.display(),
        Local::now().format("%Y%m%d_%H%M%S")
    );
    let file = File::create(&log_file)?;

    fmt()
        .with_max_level(Level::DEBUG)
        .with_env_filter(EnvFilter::from_default_env().add_directive("remac=debug".parse()?))
        .with_ansi(false)
        .with_writer(file)
        .init();

    debug!("Starting remac");

    let (events, rx) = EventBus::new();
    let config_manager = ConfigManager::new(cli.config_dir)?;
    let config = config_manager.load_config()?;
    let transport = Arc::new(ProcessTransport::new(
        events.clone(),
        Duration::from_secs(config.connect_timeout_secs),
    ));

    let mut app = App::new(config_manager, config, transport, events)?;
    let res = run_app(&mut app, rx).await;
    app.shutdown().await;

    if let Err(err) = res {
        eprintln!("Error: {}", err);
    }

    Ok(())
}

async fn run_app(app: &mut App, mut rx: UnboundedReceiver<AppEvent>) -> Result<()> {
    println!("remac (type `help` for commands)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        app.handle_line(line.trim()).await;
                        if app.should_quit {
                            return Ok(());
                        }
                    }
                    // stdin closed
                    None => return Ok(()),
                }
            }
            event = rx.recv() => {
                match event {
                    Some(event) => render_event(app, event).await,
                    None => return Ok(()),
                }
            }
        }
    }
}

/// The display sink: status changes and streamed output are printed here and
/// nowhere else.
async fn render_event(app: &mut App, event: AppEvent) {
    match event {
        AppEvent::MachineStatus { name, status } => println!("* {} is {}", name, status),
        AppEvent::SessionOutput { label, line } => println!("[{}] {}", label, line),
        AppEvent::SessionClosed { label } => {
            println!("* session {} ended", label);
            app.machines.session_closed(&label).await;
        }
        AppEvent::HostCommand(id) => app.run_host_command(&id).await,
        AppEvent::Notice(message) => println!("{}", message),
        AppEvent::Warning(message) => eprintln!("! {}", message),
    }
}
