//! Kiln server
//!
//! Serves the compile/run endpoint over HTTP, backed by an Isolate box pool.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiln::{BoxPool, Config, EXAMPLE_CONFIG, Orchestrator, Sandbox, prepare_cgroup};
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::routes::AppState;

mod routes;
mod telemetry;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Compile and run C programs in an Isolate sandbox over HTTP")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (default)
    Serve {
        /// Address to bind, overriding `server.bind`
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Write the example configuration file
    Init {
        /// Output path
        #[arg(short, long, default_value = "kiln.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Show the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command.unwrap_or(Commands::Serve { bind: None }) {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::ShowConfig => {
            let config = load_config(cli.config.as_deref())?;
            show_config(&config);
            Ok(())
        }
        Commands::Serve { bind } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            serve(config).await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => info!(?path, "loading configuration"),
        None => debug!("using default configuration"),
    }
    Config::load(path).context("failed to load configuration")
}

async fn serve(mut config: Config) -> Result<()> {
    // Set up cgroup hierarchy if cgroup mode is enabled
    if config.cgroup {
        match prepare_cgroup(&config.cg_root) {
            Ok(true) => debug!("cgroup hierarchy ready"),
            Ok(false) => {
                warn!(
                    "cgroup support unavailable (memory controller not found), falling back to RLIMIT_AS"
                );
                config.cgroup = false;
            }
            Err(e) => {
                warn!("cgroup setup failed: {e}, falling back to RLIMIT_AS memory limiting");
                config.cgroup = false;
            }
        }
    }

    let prometheus = telemetry::install().context("failed to install metrics recorder")?;

    let pool = Arc::new(BoxPool::new(&config, config.cgroup));
    let sandbox: Arc<dyn Sandbox> = pool.clone();
    let orchestrator =
        Arc::new(Orchestrator::new(&config, sandbox).context("invalid configuration")?);

    let app = routes::router(
        AppState {
            orchestrator: Arc::clone(&orchestrator),
            prometheus: Some(prometheus),
        },
        &config.server,
    );

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    info!(
        addr = %listener.local_addr()?,
        path = %config.server.path,
        pool_size = config.sandbox.pool_size,
        cgroup = config.cgroup,
        "listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("shutting down");
    orchestrator.admission().close();
    pool.close();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

fn show_config(config: &Config) {
    let limits = config.effective_limits(None);
    println!("Execution limits:");
    println!("  CPU time: {:?} ms", limits.cpu_time_ms);
    println!("  Wall time: {:?} ms", limits.wall_time_ms);
    println!("  Memory: {:?} bytes", limits.memory_bytes);
    println!("  Stack: {:?} bytes", limits.stack_bytes);
    println!("  Max processes: {:?}", limits.max_processes);
    println!("  Output per stream: {:?} bytes", limits.max_output_bytes);
    println!("  Network denied: {:?}", limits.no_network);
    println!();

    let compile = config.compiler.effective_limits();
    println!("Compiler: {}", config.compiler.invocation().join(" "));
    println!("  CPU time: {:?} ms", compile.cpu_time_ms);
    println!("  Wall time: {:?} ms", compile.wall_time_ms);
    println!("  Memory: {:?} bytes", compile.memory_bytes);
    println!();

    println!(
        "Admission: {} running, {} per caller, {} queued ({} ms wait)",
        config.admission.max_concurrent_jobs,
        config.admission.max_jobs_per_caller,
        config.admission.max_queued_jobs,
        config.admission.queue_timeout_ms
    );
    println!(
        "Sandbox: {} boxes from id {}, cgroup {}",
        config.sandbox.pool_size, config.sandbox.first_box_id, config.cgroup
    );
    println!("Isolate binary: {}", config.isolate_binary().display());
    println!("Endpoint: POST {} on {}", config.server.path, config.server.bind);
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
