use clap::{Parser, Subcommand};
use parlor::config::Backend;
use parlor::conversation::PollPolicy;
use parlor::server::{self, ServerConfig};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "parlor", about = "Browser control panel for hosted assistants")]
struct Cli {
    /// Log filter, e.g. `info` or `parlor=debug,reqwest=warn`.
    #[arg(long, env = "PARLOR_LOG", default_value = "info", global = true)]
    log: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the control panel.
    Serve(ServeArgs),
}

#[derive(clap::Args)]
struct ServeArgs {
    #[arg(long, env = "PARLOR_LISTEN", default_value = "127.0.0.1:8501")]
    listen: String,

    /// Provider preselected for new sessions: `direct` or `tenant`.
    #[arg(long, env = "PARLOR_BACKEND", default_value = "direct")]
    backend: Backend,

    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Give up on a run after this long; 0 waits forever.
    #[arg(long, default_value_t = 600)]
    run_timeout_secs: u64,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8501".to_string(),
            backend: Backend::default(),
            poll_interval_ms: 1000,
            run_timeout_secs: 600,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let Command::Serve(args) = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    let policy = PollPolicy {
        interval: Duration::from_millis(args.poll_interval_ms.max(1)),
        timeout: (args.run_timeout_secs > 0).then(|| Duration::from_secs(args.run_timeout_secs)),
    };

    server::run(ServerConfig {
        listen: args.listen,
        default_backend: args.backend,
        policy,
    })
    .await
}
