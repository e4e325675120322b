mod alias;
mod observer;
mod shell;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use pronto_core::ConsoleConfig;
use tracing::{error, info};

use crate::observer::OperatorObserver;
use crate::shell::{Flow, Interrupt, Shell};

const PROMPT: &str = "PC> ";

#[derive(Parser, Debug)]
#[command(author, version, about = "Interactive console for RepRap-style 3D printers", long_about = None)]
struct Args {
    /// Printer device node (e.g. /dev/ttyUSB0); connects on startup
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            ConsoleConfig::load_from_file(path)?
        }
        None => ConsoleConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = Some(port);
    }
    if let Some(baud) = args.baud {
        config.baud = baud;
    }

    let interrupt = Interrupt::install()?;
    let startup = config.startup_commands.clone();
    let autoconnect = config.port.is_some();
    let mut shell = Shell::new(config, Arc::new(OperatorObserver), interrupt, io::stdout());

    if autoconnect && shell.execute("connect") == Flow::Exit {
        return Ok(());
    }
    for command in &startup {
        if shell.execute(command) == Flow::Exit {
            return Ok(());
        }
    }

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("{}", PROMPT);
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            // EOF behaves like exit.
            println!();
            shell.execute("exit");
            break;
        };
        if shell.execute(&line?) == Flow::Exit {
            break;
        }
    }
    Ok(())
}
