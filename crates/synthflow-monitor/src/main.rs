use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use synthflow_core::signal::{CompletionSignal, NoCompletionSignal};
use synthflow_monitor::config::{load_watch_config, Cli, Command, EnvOverrides, WatchArgs};
use synthflow_monitor::logging::init_logging;
use synthflow_monitor::poller::HttpStatusClient;
use synthflow_monitor::render::summary_line;
use synthflow_monitor::session::{SessionView, WorkflowSession};
use synthflow_storage::SideChannelStore;
use tracing::warn;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();
    let env = EnvOverrides::from_env();

    match &cli.command {
        Command::Watch(watch) => run_watch(&cli, watch, &env).await,
        Command::MarkDistributed { workflow_id } => {
            let store = open_store(&cli, &env)?;
            if store.mark_distribution_completed(workflow_id)? {
                println!("marked distribution completed for {workflow_id}");
            } else {
                println!("distribution already marked for {workflow_id}");
            }
            Ok(())
        }
        Command::ClearDistributed { workflow_id } => {
            let store = open_store(&cli, &env)?;
            if store.clear_distribution_completed(workflow_id)? {
                println!("cleared distribution mark for {workflow_id}");
            } else {
                println!("no distribution mark for {workflow_id}");
            }
            Ok(())
        }
        Command::Signals => {
            let store = open_store(&cli, &env)?;
            for workflow_id in store.completed_distributions()? {
                println!("{workflow_id}");
            }
            Ok(())
        }
    }
}

fn open_store(cli: &Cli, env: &EnvOverrides) -> Result<SideChannelStore> {
    let path = synthflow_monitor::config::resolve_state_db(&cli.state_db, env);
    SideChannelStore::open(&path)
        .with_context(|| format!("failed to open side-channel store at {}", path.display()))
}

async fn run_watch(cli: &Cli, watch: &WatchArgs, env: &EnvOverrides) -> Result<()> {
    let config = load_watch_config(cli, watch, env)?;
    let signal: Arc<dyn CompletionSignal> = match SideChannelStore::open(&config.state_db) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            warn!(
                event = "side_channel_unavailable",
                path = %config.state_db.display(),
                error = %err
            );
            Arc::new(NoCompletionSignal)
        }
    };
    let source = Arc::new(HttpStatusClient::new(
        config.api_url.clone(),
        config.request_timeout,
    )?);

    let session = WorkflowSession::start(
        watch.workflow_id.clone(),
        config.session_config(),
        source,
        signal,
    )
    .await;
    let mut views = session.subscribe();
    print_view(&views.borrow_and_update(), watch.json)?;

    loop {
        if watch.exit_on_terminal && views.borrow().status().is_terminal() {
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                print_view(&view, watch.json)?;
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

fn print_view(view: &SessionView, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(&view.view)?);
    } else {
        println!("{}", summary_line(view));
    }
    Ok(())
}
