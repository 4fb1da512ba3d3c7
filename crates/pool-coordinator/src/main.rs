use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use pool_coordinator::allocation::name_sequencer;
use pool_coordinator::app::ApplicationBuilder;
use pool_coordinator::config::Cli;
use pool_coordinator::config::Commands;
use pool_coordinator::config::NextSuffixArgs;
use pool_coordinator::config::ServeArgs;
use utils::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(serve_args) => run_serve(*serve_args).await,
        Commands::NextSuffix(args) => run_next_suffix(&args),
    }
}

async fn run_serve(serve_args: ServeArgs) -> Result<()> {
    let _guard = logging::init(logging::log_dir(serve_args.log_path.clone()))
        .context("failed to initialize logging")?;

    tracing::info!("Starting pool coordinator {}", &**version::VERSION);

    let app = ApplicationBuilder::new(serve_args).build().await?;

    app.run().await?;
    app.shutdown().await?;

    Ok(())
}

fn run_next_suffix(args: &NextSuffixArgs) -> Result<()> {
    let next = name_sequencer::next(&args.current, args.max_segments)
        .map_err(|report| anyhow::anyhow!("{report:?}"))?;
    println!("{next}");
    Ok(())
}
