use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use job_frame::config::WorkerConfig;
use job_frame::container::Container;
use job_frame::error::display_error;
use job_frame::queue::amqp::AmqpBroker;
use job_frame::{app, logging, ToError};

/// Runs the job consumers, or talks to their queues.
#[derive(Parser)]
#[command(name = "job-worker", version)]
struct Cli {
    /// TOML file layered over the built-in defaults.
    #[arg(long, env = "JOB_FRAME_CONFIG")]
    config: Option<PathBuf>,

    /// Log one JSON object per line.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Consume every configured queue until the broker fails (default).
    Work,
    /// Publish one job message to a configured queue.
    Enqueue {
        /// Queue name, `<domain>.<action>`.
        queue: String,
        /// JSON envelope, e.g. '{"type":"warm_cache","keys":["product:1"]}'.
        body: String,
    },
    /// Print the queues each job class uses.
    Topology,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.json_logs);
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", display_error(&e));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = WorkerConfig::load(cli.config.as_deref())?;
    match cli.command.unwrap_or(Command::Work) {
        Command::Work => {
            let broker = Arc::new(AmqpBroker::connect(&config.broker.url).await?);
            let container = Container::new(app::registry(&config));
            Err(app::run_worker(&config, broker, container).await.to_error())
        }
        Command::Enqueue { queue, body } => {
            let broker = Arc::new(AmqpBroker::connect(&config.broker.url).await?);
            app::enqueue(&config, broker.clone(), &queue, &body).await?;
            broker.close().await
        }
        Command::Topology => {
            for class in config.job_classes() {
                let topology = class.topology();
                println!(
                    "{class}: retry {} after {:?}, dead-letter {}, max retries {}",
                    topology.retry, topology.retry_delay, topology.dead_letter, class.max_retries
                );
            }
            Ok(())
        }
    }
}
