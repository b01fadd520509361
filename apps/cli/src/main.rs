use std::io::{Read, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dut_core::artifact::{ArtifactOptions, BuildArtifact};
use dut_core::session::{DutConfig, DutSession};
use dut_core::transport::Transport;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "ESP-IDF device-under-test tool", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// TOML session config
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a build directory and print what was found
    Inspect {
        /// Application directory (containing build/)
        app_path: PathBuf,

        /// Partition table tool (defaults to $IDF_PATH/components/partition_table/gen_esp32part.py)
        #[arg(long)]
        part_tool: Option<PathBuf>,
    },
    /// Open a session and stream the merged log to stdout
    Monitor {
        /// Serial device or socket://host:port
        #[arg(short, long)]
        port: Option<String>,

        #[arg(short, long)]
        baud: Option<u32>,

        /// Application directory (containing build/)
        #[arg(long)]
        app: Option<PathBuf>,

        /// Stop after this many seconds (default: run until killed)
        #[arg(long)]
        duration_secs: Option<u64>,

        /// Also copy the merged log to this file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
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
        Some(path) => DutConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => DutConfig::default(),
    };

    match args.command {
        Command::Inspect {
            app_path,
            part_tool,
        } => {
            let options = ArtifactOptions {
                part_tool: part_tool.or_else(|| config.part_tool.clone()),
                ..config.artifact_options()
            };
            inspect(&BuildArtifact::resolve_with(&app_path, &options)?);
            Ok(())
        }
        Command::Monitor {
            port,
            baud,
            app,
            duration_secs,
            log_file,
        } => {
            config.port = port.or(config.port);
            config.baud = baud.unwrap_or(config.baud);
            config.app_path = app.or(config.app_path);
            config.log_file = log_file.or(config.log_file);
            monitor(&config, duration_secs.map(Duration::from_secs))
        }
    }
}

fn inspect(artifact: &BuildArtifact) {
    println!("App:      {}", artifact.app_path().display());
    match artifact.binary_dir() {
        Some(dir) => println!("Build:    {}", dir.display()),
        None => println!("Build:    (missing)"),
    }
    println!("Target:   {}", artifact.target());
    if let Some(elf) = artifact.elf_file() {
        println!("ELF:      {}", elf.display());
    }
    if let Some(tool) = artifact.part_tool() {
        println!("Tool:     {}", tool.path().display());
    }
    println!("Encrypt:  {}", artifact.is_encrypted());

    if let Some(segments) = artifact.flash_files() {
        println!("\nFlash segments:");
        for seg in segments {
            let marker = if seg.encrypted { " (encrypted)" } else { "" };
            println!("  {:#010x}  {}{}", seg.offset, seg.file_path.display(), marker);
        }
    }
    if let Some(settings) = artifact.flash_settings() {
        println!("\nFlash settings:");
        for (key, value) in &settings.values {
            println!("  {key} = {value}");
        }
    }
    match artifact.partition_table() {
        Some(table) => print!("\nPartition table:\n{table}"),
        None => println!("\nPartition table: (not decoded)"),
    }
}

fn monitor(config: &DutConfig, duration: Option<Duration>) -> Result<()> {
    let session = DutSession::open(config)?;
    info!(transport = session.transport().kind(), "Monitoring, Ctrl-C to stop");

    let mut reader = session.reader();
    let printer = thread::spawn(move || -> std::io::Result<()> {
        let mut stdout = std::io::stdout();
        let mut buf = [0u8; 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            stdout.write_all(&buf[..n])?;
            stdout.flush()?;
        }
    });

    match duration {
        Some(d) => thread::sleep(d),
        None => loop {
            thread::park();
        },
    }

    let result = session.finish(Ok(()));
    if let Ok(Err(e)) = printer.join() {
        error!(error = %e, "Writing log to stdout failed");
    }
    result
}
