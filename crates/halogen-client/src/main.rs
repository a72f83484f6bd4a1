use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use halogen_client::{ClientConfig, HalogenInterface};
use halogen_protocol::{Chain, Event, EventBody};
use tokio::time::{Instant, timeout_at};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "halogen-cli", about = "Run a command on a halogen core")]
struct Cli {
    /// Module namespace, e.g. `core` or `fs`
    module: String,

    /// Command name within the module
    command: String,

    /// Arguments passed to the command
    args: Vec<String>,

    /// Gateway address (overrides the client config file)
    #[arg(long, env = "HALOGEN_ADDR")]
    addr: Option<String>,

    /// Seconds to wait for the result
    #[arg(long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = ClientConfig::load()?;
    if let Some(addr) = cli.addr {
        config.server.address = Some(addr);
    }
    let wait = Duration::from_secs(cli.timeout.unwrap_or_else(|| config.timeout_secs()));

    let mut interface = HalogenInterface::from_config(config).await?;
    let outcome = run(&mut interface, &cli.module, &cli.command, cli.args, wait).await;
    interface.end().await;

    let (success, output) = outcome?;
    if success {
        println!("{}", output.green());
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("{}", output.red());
        Ok(ExitCode::FAILURE)
    }
}

async fn run(
    interface: &mut HalogenInterface,
    module: &str,
    command: &str,
    args: Vec<String>,
    wait: Duration,
) -> anyhow::Result<(bool, String)> {
    if !interface.is_connected() {
        // Surface whatever the client raised while connecting.
        if let Some(event) = interface.check_event(None).await? {
            return Ok((false, describe(&event)));
        }
        return Ok((false, "Not connected to a halogen server.".to_string()));
    }

    let chain = interface.send_command(module, command, args)?;
    let deadline = Instant::now() + wait;
    loop {
        let event = match timeout_at(deadline, interface.receive_event()).await {
            Ok(event) => event?,
            Err(_) => {
                return Ok((false, format!("Timed out waiting for {module}::{command}")));
            }
        };
        let Some(event) = event else {
            return Ok((false, "Connection closed before the command finished.".to_string()));
        };
        if let Some(result) = result_for(&event, chain) {
            return Ok(result);
        }
        tracing::debug!(%event, "ignoring unrelated event");
    }
}

/// Result of the command sent on `chain`, if `event` carries it.
fn result_for(event: &Event, chain: Chain) -> Option<(bool, String)> {
    match &event.body {
        EventBody::CommandExecuted {
            success, output, ..
        } if event.chain == chain => Some((*success, output.clone())),
        EventBody::Error { message } if event.chain == chain || event.chain.is_process() => {
            Some((false, message.clone()))
        }
        _ => None,
    }
}

fn describe(event: &Event) -> String {
    match &event.body {
        EventBody::Error { message } => message.clone(),
        _ => event.to_string(),
    }
}
