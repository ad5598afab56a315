use clap::Parser;

mod commands;

use commands::Commands;

#[derive(Parser)]
#[command(name = "isorun")]
#[command(about = "Runs one isolated task and reports a structured result", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level unless RUST_LOG or ISORUN_LOG say otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    isorun_utils::tracing::init(level).map_err(|e| eyre::eyre!("failed to initialize logging: {e}"))?;

    // Everything the command owns is dropped before exiting, so caches
    // persist their state
    let code = cli.command.execute().await?;
    std::process::exit(code)
}
