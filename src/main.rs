use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hogtail::config::Config;
use hogtail::exporter::json;
use hogtail::runtime::{compile_file, program_files};
use hogtail::{Error, Server, observability};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "hogtail")]
#[command(about = "Extract metrics from application logs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile programs and report errors without running them
    Compile {
        /// Program file or directory of programs
        prog: PathBuf,

        /// Print the bytecode of every program
        #[arg(long)]
        dump: bool,
    },

    /// Tail logs and run programs against every line
    Run {
        /// Program file or directory of programs
        #[arg(long)]
        progs: Option<PathBuf>,

        /// Log paths, globs, `-` for stdin, or unix://, unixgram://, tcp://, udp:// URLs
        #[arg(long, num_args = 1..)]
        logs: Vec<String>,

        /// Read every log once, print the metrics as JSON and exit
        #[arg(long)]
        one_shot: bool,

        /// JSON configuration file; flags override its values
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn compile(prog: PathBuf, dump: bool) -> Result<()> {
    let config = Config::default();
    let options = config.compile_options();
    let mut failed = 0;

    for path in program_files(&prog)? {
        match compile_file(&path, &options) {
            Ok(object) => {
                if dump {
                    println!("{}", object.disassemble());
                }
                info!(path = %path.display(), "compiled");
            }
            Err(Error::Compile(errors)) => {
                eprintln!("{}", errors.format_with_source());
                failed += 1;
            }
            Err(err) => {
                error!(path = %path.display(), error = %err, "cannot compile");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{} program(s) failed to compile", failed);
    }
    Ok(())
}

async fn run(progs: Option<PathBuf>, logs: Vec<String>, one_shot: bool, config: Option<PathBuf>) -> Result<()> {
    let mut config = match config {
        Some(path) => Config::load(&path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(progs) = progs {
        config.progs = progs;
    }
    if !logs.is_empty() {
        config.logs = logs;
    }
    config.one_shot |= one_shot;

    let server = Server::new(config.clone())?;
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            on_signal.cancel();
        }
    });

    server.run(cancel).await?;

    if config.one_shot {
        println!("{}", json::to_json(server.store(), config.emit_prog_label)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init().map_err(|err| anyhow::anyhow!("failed to initialise logging: {}", err))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile { prog, dump } => compile(prog, dump),
        Commands::Run {
            progs,
            logs,
            one_shot,
            config,
        } => run(progs, logs, one_shot, config).await,
    }
}
