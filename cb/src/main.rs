//! Crewbus CLI
//!
//! Runs a scripted crew session against the bus and store, or prints the configuration.

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use serde_json::{Value, json};
use tracing::{debug, info};

use crewbus::bus::{LogFilter, Message, MessageBus, MessageType};
use crewbus::cli::{Cli, Command};
use crewbus::config::Config;
use crewbus::context::{Channel, ContextStore, NewTest, TestStatus};
use crewbus::coordinator::{Coordinator, Worker};
use crewbus::participant::Participant;

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

    debug!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(
        "crewbus loaded config: max-log-entries={}, request-timeout-ms={}",
        config.bus.max_log_entries, config.bus.request_timeout_ms
    );

    match cli.command {
        Command::Demo { fail } => cmd_demo(&config, fail.as_deref()).await,
        Command::Config => cmd_config(&config),
    }
}

fn cmd_config(config: &Config) -> Result<()> {
    print!("{}", config.to_yaml()?);
    Ok(())
}

/// Worker that echoes its task back, or fails every task when `failing`
struct EchoWorker {
    participant: Participant,
    failing: bool,
}

#[async_trait]
impl Worker for EchoWorker {
    fn participant(&self) -> Participant {
        self.participant
    }

    async fn execute(&self, task: Value) -> Result<Value> {
        debug!(participant = %self.participant, "EchoWorker::execute: called");
        if self.failing {
            return Err(eyre!("{} could not complete the task", self.participant));
        }
        Ok(json!({ "handled-by": self.participant, "task": task }))
    }

    async fn on_event(&self, message: &Message) -> Result<()> {
        info!(participant = %self.participant, event = %message.message_type, "Event received");
        Ok(())
    }
}

async fn cmd_demo(config: &Config, fail: Option<&str>) -> Result<()> {
    let failing = fail
        .map(|name| name.parse::<Participant>())
        .transpose()
        .context("Invalid --fail participant")?;
    if let Some(p) = failing
        && !p.is_worker()
    {
        return Err(eyre!("--fail expects a worker participant, got {}", p));
    }

    let bus = MessageBus::new(config.bus.clone());
    let store = ContextStore::new();
    let _listener = store.subscribe(Channel::All, |channel, ctx| {
        debug!(%channel, metadata = ctx.metadata.len(), "Context changed");
        Ok(())
    });

    let mut coordinator = Coordinator::new(bus.clone(), store.clone());
    for participant in Participant::ALL.into_iter().filter(Participant::is_worker) {
        coordinator.register_worker(Arc::new(EchoWorker {
            participant,
            failing: failing == Some(participant),
        }))?;
    }

    store.start_test(NewTest::new(
        "https://shop.example.test/cart",
        "tests/cart.spec.ts",
        "adds an item to the cart",
    ));
    store.set_metadata("browser", json!("chromium"));

    let tasks = [
        (Participant::Analyst, json!({"task": "analyze-page", "url": "https://shop.example.test/cart"})),
        (Participant::TestAuthor, json!({"task": "write-test", "file": "tests/cart.spec.ts"})),
        (Participant::Documenter, json!({"task": "document-test", "file": "tests/cart.spec.ts"})),
    ];

    let mut first_error = None;
    for (to, task) in tasks {
        match coordinator.dispatch(to, task).await {
            Ok(_) => println!("{} {} completed its task", "✓".green(), to.to_string().cyan()),
            Err(e) => {
                println!("{} {} failed: {}", "✗".red(), to.to_string().cyan(), e);
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
    }

    store.add_dom_snapshot("dom-0001");
    store.add_screenshot("screenshots/cart.png");
    coordinator
        .announce(MessageType::DomChanged, json!({"selector": "#cart-count"}))
        .await;

    let (status, event) = match &first_error {
        Some(_) => (TestStatus::Failed, MessageType::TestFailed),
        None => (TestStatus::Passed, MessageType::TestPassed),
    };
    store.finish_test(status, first_error);
    coordinator.announce(event, json!({"name": "adds an item to the cart"})).await;
    coordinator.shutdown();

    println!();
    println!("{}", "Message log".bold());
    for message in bus.get_message_log(&LogFilter::new()) {
        print_message(&message);
    }

    println!();
    println!("{}", "Context".bold());
    print!("{}", serde_yaml::to_string(&store.get_context()).context("Failed to render context")?);

    println!();
    println!("{}", "Bus metrics".bold());
    print!("{}", serde_yaml::to_string(&bus.metrics()).context("Failed to render metrics")?);

    Ok(())
}

fn print_message(message: &Message) {
    let kind = match message.message_type {
        MessageType::TaskError | MessageType::TestFailed => message.message_type.to_string().red(),
        MessageType::TaskResponse | MessageType::TestPassed => message.message_type.to_string().green(),
        _ => message.message_type.to_string().yellow(),
    };
    println!(
        "  {} {:<12} -> {:<12} {:<20} {}",
        message.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
        message.from.to_string(),
        message.to.to_string(),
        kind,
        message.payload
    );
}
