//! fleet-agent command line.
//!
//! `fleet-agent daemon` runs the agent; the other subcommands talk to it
//! through the local control surface.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use fleet_agent::{
    AgentStatus, AgentSupervisor, ControlClient, DaemonReply, Dataplane, HostFactory,
    ManagerLinks, ShellHost, StartParams, StopParams, control, open_executor, open_store,
};
use fleet_agent_core::{AgentContext, Request, context::DEFAULT_CONFIG_FILE};
use fleet_agent_transport::identity::clear_failure;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stopping joins the session and may run dataplane commands.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(name = "fleet-agent", about = "Keeps this device connected to its fleet manager")]
struct Cli {
    /// Agent configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent in the foreground.
    Daemon,
    /// Start the connection loop of a running daemon.
    Start {
        /// Also start the dataplane.
        #[arg(long)]
        dataplane: bool,
    },
    /// Stop the connection loop and the dataplane.
    Stop {
        #[arg(long)]
        keep_dataplane: bool,
        /// Also remove the stored configuration.
        #[arg(long)]
        reset_config: bool,
    },
    /// Remove stored state and reconnect.
    Reset {
        /// Keep the device identity, only clean the stored configuration.
        #[arg(long)]
        soft: bool,
        /// Do not ask for confirmation.
        #[arg(long, short)]
        yes: bool,
    },
    /// Show agent information.
    Show {
        #[arg(long)]
        status: bool,
        /// Print the stored configuration in replay order.
        #[arg(long)]
        config: bool,
        /// Include the operations of each stored request.
        #[arg(long, requires = "config")]
        full: bool,
    },
    /// Execute requests from a JSON file.
    Cli {
        #[arg(long, short)]
        file: PathBuf,
        /// Keep going after a failed request.
        #[arg(long)]
        ignore_errors: bool,
        /// Clean the stored configuration afterwards.
        #[arg(long)]
        clean: bool,
    },
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let context = AgentContext::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    match cli.command {
        Command::Daemon => daemon(context).await,
        Command::Start { dataplane } => start(&context, dataplane).await,
        Command::Stop {
            keep_dataplane,
            reset_config,
        } => stop(&context, !keep_dataplane, reset_config).await,
        Command::Reset { soft, yes } => reset(&context, soft, yes).await,
        Command::Show {
            status,
            config,
            full,
        } => show(&context, status || !config, config, full).await,
        Command::Cli {
            file,
            ignore_errors,
            clean,
        } => run_file(&context, &file, ignore_errors, clean).await,
        Command::Version => {
            println!("fleet-agent {}", context.version);
            Ok(())
        }
    }
}

/// Dataplane control used while no daemon runs.
fn dataplane(context: &AgentContext) -> Arc<dyn Dataplane> {
    ShellHost::default().dataplane(context)
}

fn client(context: &AgentContext) -> anyhow::Result<ControlClient> {
    Ok(ControlClient::new(
        context.config.control_port,
        CONTROL_TIMEOUT,
    )?)
}

fn print_status(status: &AgentStatus) {
    println!(
        "agent: {} ({})\ndataplane: {}",
        if status.active { "running" } else { "stopped" },
        status.state,
        if status.dataplane_running {
            "running"
        } else {
            "stopped"
        },
    );
}

async fn daemon(context: AgentContext) -> anyhow::Result<()> {
    tracing::info!(version = %context.version, "Starting fleet-agent daemon");
    let store = open_store(&context)
        .await
        .context("Failed to open request store")?;
    let port = context.config.control_port;
    let supervisor = Arc::new(AgentSupervisor::new(
        context,
        store,
        Arc::new(ShellHost::default()),
        Arc::new(ManagerLinks),
    ));

    // Configuration problems are fixed by the operator followed by 'start'.
    if let Err(e) = supervisor.start(false, true).await {
        tracing::error!(error = %e, "Agent not started");
    }

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(control::serve(
        Arc::clone(&supervisor),
        port,
        shutdown.clone(),
    ));

    tokio::select! {
        result = shutdown_signal() => result?,
        result = &mut server => {
            supervisor.stop(false).await?;
            result?.context("Control surface failed")?;
            bail!("Control surface exited");
        }
    }
    tracing::info!("Shutting down");
    shutdown.cancel();
    supervisor.stop(false).await?;
    server.await??;
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

async fn start(context: &AgentContext, start_dataplane: bool) -> anyhow::Result<()> {
    let params = StartParams {
        start_dataplane,
        check_system: true,
    };
    match client(context)?.start(params).await? {
        DaemonReply::Done(status) => print_status(&status),
        DaemonReply::NotRunning => bail!("fleet-agent daemon is not running"),
    }
    Ok(())
}

async fn stop(context: &AgentContext, stop_dataplane: bool, reset_config: bool) -> anyhow::Result<()> {
    match client(context)?.stop(StopParams { stop_dataplane }).await? {
        DaemonReply::Done(status) => print_status(&status),
        DaemonReply::NotRunning => {
            println!("fleet-agent daemon is not running");
            if stop_dataplane {
                dataplane(context).stop().await?;
            }
        }
    }
    if reset_config {
        clean_store(context).await?;
    }
    Ok(())
}

async fn clean_store(context: &AgentContext) -> anyhow::Result<()> {
    let executor = open_executor(context).await?;
    executor.store().clean().await?;
    clear_failure(&context.failure_marker_file()).await;
    tracing::info!("Stored configuration removed");
    Ok(())
}

async fn confirm(question: &str) -> anyhow::Result<bool> {
    println!("{question} [y/N]");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

async fn reset(context: &AgentContext, soft: bool, yes: bool) -> anyhow::Result<()> {
    if !soft
        && !yes
        && !confirm("Reset removes the device identity and requires a new registration. Continue?")
            .await?
    {
        println!("Reset cancelled");
        return Ok(());
    }

    let client = client(context)?;
    let running = matches!(
        client.stop(StopParams::default()).await?,
        DaemonReply::Done(_)
    );
    if !running {
        dataplane(context).stop().await?;
    }

    clean_store(context).await?;
    if !soft {
        let identity = context.identity_file();
        match tokio::fs::remove_file(&identity).await {
            Ok(()) => tracing::info!(path = %identity.display(), "Device identity removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("Failed to remove device identity"),
        }
    }

    if running {
        if let DaemonReply::Done(status) = client.start(StartParams::default()).await? {
            print_status(&status);
        }
    }
    println!("Reset done");
    Ok(())
}

async fn show(context: &AgentContext, status: bool, config: bool, full: bool) -> anyhow::Result<()> {
    if status {
        match client(context)?.status().await? {
            DaemonReply::Done(status) => print_status(&status),
            DaemonReply::NotRunning => println!("fleet-agent daemon is not running"),
        }
    }
    if config {
        let executor = open_executor(context).await?;
        let configuration = executor.configuration(full).await?;
        println!("{}", serde_json::to_string_pretty(&configuration)?);
    }
    Ok(())
}

async fn run_file(
    context: &AgentContext,
    file: &std::path::Path,
    ignore_errors: bool,
    clean: bool,
) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let requests: Vec<Request> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a JSON list of requests", file.display()))?;

    let executor = open_executor(context).await?;
    let mut failed = 0usize;
    for request in &requests {
        let reply = executor.execute(request).await;
        if reply.ok {
            println!("{}: ok", request.message);
            continue;
        }
        let message = reply.message.unwrap_or_default();
        println!("{}: failed: {message}", request.message);
        failed += 1;
        if !ignore_errors {
            break;
        }
    }

    if clean {
        executor.store().clean().await?;
    }
    if failed > 0 {
        bail!("{failed} of {} requests failed", requests.len());
    }
    Ok(())
}
