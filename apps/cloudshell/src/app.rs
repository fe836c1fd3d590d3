use std::io::{self, IsTerminal};
use std::sync::Arc;

use exec_channel::adapter::{AdapterOptions, ExecAdapter};
use exec_channel::request::{impersonation_subprotocols, ExecParams};
use exec_channel::session::SessionState;
use exec_channel::transport::Connector;
use exec_channel::workspace::WorkspaceStore;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cli::{Cli, Command, ExecArgs, StartArgs};
use crate::config::ClusterConfig;
use crate::console::{spawn_stdin_forwarder, ConsoleTerminal, InputEvent, RawModeGuard};
use crate::error::CliError;
use crate::telemetry::logging as logctl;

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let cluster = ClusterConfig::resolve(&cli.cluster)?;
    match cli.command {
        Command::Exec(args) => handle_exec(&cluster, args).await,
        Command::Start(args) => handle_start(&cluster, args).await,
    }
}

pub fn exec_params(args: &ExecArgs) -> ExecParams {
    let mut params = ExecParams::new(&args.namespace, &args.pod, &args.container)
        .with_subprotocols(impersonation_subprotocols(
            args.as_user.as_deref(),
            &args.as_groups,
        ));
    if !args.command.is_empty() {
        params = params.with_command(args.command.iter().cloned());
    }
    if let Some(workspace) = &args.workspace {
        params = params.with_workspace(workspace.clone());
    }
    params
}

/// How an attached session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Detached,
    /// The transport gave up and the session went back to idle.
    Ended,
    Failed(String),
}

async fn handle_exec(cluster: &ClusterConfig, args: ExecArgs) -> Result<(), CliError> {
    let params = exec_params(&args);
    params.validate()?;

    let connector: Arc<dyn Connector> = Arc::new(cluster.connector()?);
    let store: Option<Arc<dyn WorkspaceStore>> = match &args.workspace {
        Some(_) => Some(Arc::new(cluster.workspace_client()?) as Arc<dyn WorkspaceStore>),
        None => None,
    };
    let options = AdapterOptions {
        client: args.client.into(),
        reconnect: args.reconnect,
        ..AdapterOptions::default()
    };

    let interactive = io::stdin().is_terminal() && io::stdout().is_terminal();
    let raw_guard = RawModeGuard::new(interactive);

    let adapter = ExecAdapter::spawn(
        connector,
        Box::new(ConsoleTerminal::stdout()),
        store,
        options,
    );
    adapter.open(params)?;

    let (input_tx, input_rx) = mpsc::unbounded_channel();
    spawn_stdin_forwarder(input_tx);

    let outcome = attach(&adapter, input_rx, interactive).await;
    adapter.shutdown().await;
    drop(raw_guard);
    info!(outcome = ?outcome, pod = %args.pod, "exec session finished");

    match outcome {
        Outcome::Detached | Outcome::Ended => Ok(()),
        Outcome::Failed(message) => {
            if let Some(workspace) = &args.workspace {
                eprintln!(
                    "run `cloudshell start -n {} {workspace}` to restart the terminal",
                    args.namespace
                );
            }
            Err(CliError::SessionClosed(message))
        }
    }
}

/// Forwards local input until the user detaches or the session ends. After
/// stdin reaches EOF a non-interactive run keeps streaming output until the
/// session ends.
pub async fn attach(
    adapter: &ExecAdapter,
    mut input: mpsc::UnboundedReceiver<InputEvent>,
    detach_on_eof: bool,
) -> Outcome {
    let mut status = adapter.subscribe();
    let mut input_open = true;
    let mut started = false;
    loop {
        tokio::select! {
            event = input.recv(), if input_open => match event {
                Some(InputEvent::Text(text)) => adapter.send(text),
                Some(InputEvent::Detach) => return Outcome::Detached,
                Some(InputEvent::Eof) | None => {
                    if detach_on_eof {
                        return Outcome::Detached;
                    }
                    debug!(target: "cloudshell::stdin", "stdin closed; waiting for the session to end");
                    input_open = false;
                }
            },
            changed = status.changed() => {
                if changed.is_err() {
                    return Outcome::Ended;
                }
                let current = status.borrow_and_update().clone();
                if let Some(error) = current.error {
                    return Outcome::Failed(error);
                }
                match current.state {
                    SessionState::Idle if started => return Outcome::Ended,
                    SessionState::Idle => {}
                    _ => started = true,
                }
            }
            _ = tokio::signal::ctrl_c() => return Outcome::Detached,
        }
    }
}

async fn handle_start(cluster: &ClusterConfig, args: StartArgs) -> Result<(), CliError> {
    let client = cluster.workspace_client()?;
    let workspace = client.get(&args.workspace, &args.namespace).await?;
    if workspace.is_started() {
        println!(
            "workspace {}/{} is already started",
            args.namespace, args.workspace
        );
        return Ok(());
    }
    client.start(&args.workspace, &args.namespace).await?;
    info!(namespace = %args.namespace, workspace = %args.workspace, "workspace start requested");
    println!("✅ started workspace {}/{}", args.namespace, args.workspace);
    Ok(())
}
