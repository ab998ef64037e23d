use clap::Parser;
use jald::config::Config;
use std::path::PathBuf;
use std::process::ExitCode;

/// JALoP store-and-forward daemon: accepts records from local producers,
/// persists them, and republishes them to authorised peers.
#[derive(Parser, Debug)]
#[command(name = "jald", about, version)]
struct Args {
    /// Path to the daemon's TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Stay attached to the controlling terminal instead of daemonising.
    #[arg(long)]
    foreground: bool,

    /// Force debug-level logging regardless of the config file's `debug` flag.
    #[arg(long)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let filter = if debug {
        tracing_subscriber::EnvFilter::new("jald=debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("jald=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("jald: failed to load configuration {}: {e}", args.config.display());
            return ExitCode::from(1);
        }
    };

    init_logging(args.debug || config.debug);

    if config.daemonise && !args.foreground {
        tracing::warn!(
            target: "jald",
            "daemonise=true requires a process supervisor (fork/setsid is outside this \
             crate's scope); running attached to the foreground"
        );
    }

    match jald::daemon::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("jald: {e}");
            ExitCode::from(2)
        }
    }
}
