use std::path::PathBuf;
use std::sync::Arc;

use ::url::Url;
use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use tempfile::TempDir;

use waymark::config::PlaybackConfig;
use waymark::healing::NoHealer;
use waymark::host::cdp::{
    CdpHost, DebuggerOptions, LaunchOptions, PRIMARY_TAB,
};
use waymark::machine::state::MachineState;
use waymark::runner::{Session, SessionOptions};
use waymark::ui::{ConsoleUi, ErrorChoice};
use waymark::workflow::{FileWorkflowSource, load_workflow_file};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Replay a recorded workflow as a guided walkthrough in a live
    /// browser.
    Replay {
        workflow: PathBuf,
        #[arg(long, default_value_t = false)]
        headless: bool,
        #[arg(long, default_value_t = false)]
        no_sandbox: bool,
        /// Attach to a running browser instead of launching one.
        #[arg(long)]
        remote_debugger: Option<Url>,
        /// Perform each step's recorded action automatically.
        #[arg(long, default_value_t = false)]
        auto: bool,
        /// Directory for the JSONL session trace.
        #[arg(long)]
        trace_dir: Option<PathBuf>,
        /// JSON file overriding timeouts and thresholds.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 1024)]
        width: u32,
        #[arg(long, default_value_t = 768)]
        height: u32,
    },
    /// Print a workflow's steps without opening a browser.
    Inspect { workflow: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .format_target(true)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Replay {
            workflow,
            headless,
            no_sandbox,
            remote_debugger,
            auto,
            trace_dir,
            config,
            width,
            height,
        } => {
            let config = match config {
                Some(path) => PlaybackConfig::load_from(&path)?,
                None => PlaybackConfig::default(),
            };
            let workflow_path = workflow;
            let workflow = load_workflow_file(&workflow_path)?;
            let workflow_id = workflow.id.clone();
            log::info!(
                "replaying \"{}\" ({} steps)",
                workflow.name,
                workflow.steps.len()
            );

            let user_data_directory = TempDir::with_prefix("user_data_")?;
            let debugger_options = match remote_debugger {
                Some(remote_debugger) => {
                    DebuggerOptions::External { remote_debugger }
                }
                None => DebuggerOptions::Managed {
                    launch_options: LaunchOptions {
                        headless,
                        no_sandbox,
                        user_data_directory: user_data_directory
                            .path()
                            .to_path_buf(),
                        width,
                        height,
                    },
                },
            };
            let (host, page) = CdpHost::launch(debugger_options).await?;

            let ui = ConsoleUi {
                confirm_heals: true,
                // An unattended run has nobody to click "retry".
                error_choice: if auto {
                    ErrorChoice::Skip
                } else {
                    ErrorChoice::Exit
                },
            };
            let session = Session::start(
                host.clone(),
                page,
                Arc::new(FileWorkflowSource::new(&workflow_path)),
                Arc::new(NoHealer),
                None,
                Arc::new(ui),
                SessionOptions {
                    config,
                    auto,
                    trace_dir,
                },
            )
            .await?;

            let mut events = session.event_stream();
            session.begin(&workflow_id, PRIMARY_TAB).await?;

            let mut saw_error = false;
            let exit_code = loop {
                match events.next().await {
                    Some(message) => match message.state.machine_state {
                        MachineState::Completed => {
                            log::info!("walkthrough completed");
                            break 0;
                        }
                        MachineState::Error => {
                            saw_error = true;
                        }
                        MachineState::Idle => {
                            break if saw_error { 2 } else { 0 };
                        }
                        _ => {}
                    },
                    None => {
                        eprintln!("event stream closed unexpectedly");
                        break 1;
                    }
                }
            };

            session.shutdown().await;
            host.terminate().await?;

            if exit_code != 0 {
                std::process::exit(exit_code);
            }
            Ok(())
        }
        Command::Inspect { workflow } => {
            let workflow = load_workflow_file(&workflow)?;
            println!("{} ({})", workflow.name, workflow.id);
            println!("starting url: {}", workflow.starting_url);
            for (index, step) in workflow.steps.iter().enumerate() {
                let selector = step
                    .selectors
                    .candidates(step.healed_selector.as_ref())
                    .first()
                    .map(|(_, selector)| selector.clone())
                    .unwrap_or_else(|| "-".to_string());
                let url = step
                    .page_context
                    .as_ref()
                    .map(|context| context.url.as_str())
                    .unwrap_or("-");
                println!(
                    "{:>3}. {:?} {} on {}",
                    index, step.action_type, selector, url
                );
            }
            Ok(())
        }
    }
}
