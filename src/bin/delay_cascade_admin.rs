//! delay-cascade-admin: operator tool for the delay cascade
//!
//! Builds and tears down cascade generations on RabbitMQ, runs the startup
//! check against the configured flags, and migrates parked messages from an
//! old generation into the configured one.
//!
//! ## Configuration
//! - `--config` or DELAY_CASCADE_CONFIG: YAML file
//! - DELAY_CASCADE__AMQP__URL: broker URL (default: amqp://localhost:5672)
//! - DELAY_CASCADE__GENERATION__NAME_PREFIX: generation prefix
//! - DELAY_CASCADE_LOG: log filter (default: info)

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};

use delay_cascade::broker::AmqpBroker;
use delay_cascade::config::DelayCascadeConfig;
use delay_cascade::delay::{encode, validate};
use delay_cascade::migration::Migrator;
use delay_cascade::startup::StartupCheck;
use delay_cascade::topology::{QueueKind, TopologyBuilder, TopologyGeneration};
use delay_cascade::utils::bootstrap::{connect_with_retry, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "delay-cascade-admin")]
#[command(version)]
#[command(about = "Provision, check and migrate the delay cascade", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum KindArg {
    Classic,
    Lazy,
    Quorum,
}

impl From<KindArg> for QueueKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Classic => QueueKind::Classic { lazy: false },
            KindArg::Lazy => QueueKind::Classic { lazy: true },
            KindArg::Quorum => QueueKind::Quorum,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the configured generation of the cascade
    Create {
        /// Route released messages for ADDRESS into QUEUE (as QUEUE=ADDRESS)
        #[arg(long = "bind", value_parser = parse_binding)]
        bindings: Vec<(String, String)>,
    },

    /// Delete every exchange and queue of the configured generation
    Teardown,

    /// Run the startup check against the configured flags
    Check,

    /// Move parked messages from an old generation into the configured one
    ///
    /// The configured generation is built and its destinations bound first;
    /// messages already due are delivered straight away and need a binding.
    Migrate {
        /// Name prefix of the generation to drain
        #[arg(long, default_value = "")]
        from_prefix: String,

        /// Queue kind the old generation was built with
        #[arg(long, value_enum, default_value = "classic")]
        from_kind: KindArg,

        /// Tear the old generation down once it has drained cleanly
        #[arg(long)]
        tear_down_old: bool,

        /// Route released messages for ADDRESS into QUEUE (as QUEUE=ADDRESS)
        #[arg(long = "bind", value_parser = parse_binding)]
        bindings: Vec<(String, String)>,
    },

    /// Print the routing key and starting level for a delay
    Encode { seconds: i64, address: String },
}

fn parse_binding(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((queue, address)) if !queue.is_empty() => {
            Ok((queue.to_string(), address.to_string()))
        }
        _ => Err(format!("expected QUEUE=ADDRESS, got '{}'", value)),
    }
}

async fn connect(config: &DelayCascadeConfig) -> Result<AmqpBroker, Box<dyn std::error::Error>> {
    let broker = connect_with_retry("rabbitmq", &config.amqp.url, || {
        AmqpBroker::connect(&config.amqp.url, config.amqp.pool_size)
    })
    .await?;
    Ok(broker)
}

/// Build a generation and bind its destinations.
async fn provision(
    broker: &AmqpBroker,
    generation: &TopologyGeneration,
    bindings: &[(String, String)],
) -> Result<(), Box<dyn std::error::Error>> {
    let builder = TopologyBuilder::new(broker, generation);
    builder.build().await?;
    for (queue, address) in bindings {
        builder.bind_destination(queue, address).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli = Cli::parse();
    let config = DelayCascadeConfig::load(cli.config.as_deref())?;
    let generation = config.generation.topology();

    match cli.command {
        Commands::Encode { seconds, address } => {
            validate(seconds)?;
            let (routing_key, level) = encode(seconds, &address);
            println!("exchange:    {}", generation.level_name(level));
            println!("routing key: {}", routing_key);
        }

        Commands::Check => match config.startup.check() {
            StartupCheck::Success => info!("Startup check passed"),
            StartupCheck::Failure { reason } => {
                error!(reason = %reason, "Startup check failed");
                return Err(reason.into());
            }
        },

        Commands::Create { bindings } => {
            if let StartupCheck::Failure { reason } = config.startup.check() {
                return Err(reason.into());
            }
            let broker = connect(&config).await?;
            provision(&broker, &generation, &bindings).await?;
        }

        Commands::Teardown => {
            let broker = connect(&config).await?;
            TopologyBuilder::new(&broker, &generation)
                .tear_down()
                .await?;
        }

        Commands::Migrate {
            from_prefix,
            from_kind,
            tear_down_old,
            bindings,
        } => {
            if let StartupCheck::Failure { reason } = config.startup.check() {
                return Err(reason.into());
            }
            let from = TopologyGeneration::new(from_prefix, from_kind.into());

            let broker = connect(&config).await?;
            provision(&broker, &generation, &bindings).await?;
            let report = Migrator::new(&broker, &broker, &from, &generation)
                .run(Utc::now())
                .await?;

            for failure in &report.failures {
                error!(
                    queue = %failure.queue,
                    routing_key = %failure.routing_key,
                    state = failure.state,
                    error = %failure.error,
                    "Message left in old generation"
                );
            }

            if !report.is_clean() {
                return Err(format!(
                    "{} message(s) could not be migrated",
                    report.failures.len()
                )
                .into());
            }

            if tear_down_old {
                TopologyBuilder::new(&broker, &from).tear_down().await?;
            } else {
                warn!(prefix = %from.name_prefix, "Old generation left in place");
            }
        }
    }

    Ok(())
}
