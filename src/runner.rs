use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::PlaybackConfig;
use crate::controller::{ControllerHandle, PageController};
use crate::coordinator::{Coordinator, CoordinatorHandle, LocalTransport};
use crate::driver::SimulatedUser;
use crate::healing::{AiValidator, Healer};
use crate::host::{Host, PageDriver};
use crate::machine::state::{MachineState, TabId};
use crate::messaging::{StateChanged, WalkthroughCommand};
use crate::navigation::NavigationWatcher;
use crate::tabs::TabManager;
use crate::trace::TraceWriter;
use crate::ui::WalkthroughUi;
use crate::url::urls_match;
use crate::workflow::WorkflowSource;

pub struct SessionOptions {
    pub config: PlaybackConfig,
    /// Let the simulated user perform each step's recorded action.
    pub auto: bool,
    pub trace_dir: Option<PathBuf>,
}

/// Wires one coordinator, its navigation watcher, and a page controller
/// for a single-tab playback session. The library pieces are usable on
/// their own; this is the assembly the CLI and the smoke test share.
pub struct Session {
    handle: CoordinatorHandle,
    controller: Option<ControllerHandle>,
    watcher: tokio::task::JoinHandle<()>,
    driver: Option<tokio::task::JoinHandle<()>>,
    host: Arc<dyn Host>,
}

impl Session {
    pub async fn start(
        host: Arc<dyn Host>,
        page: Arc<dyn PageDriver>,
        source: Arc<dyn WorkflowSource>,
        healer: Arc<dyn Healer>,
        ai: Option<Arc<dyn AiValidator>>,
        ui: Arc<dyn WalkthroughUi>,
        options: SessionOptions,
    ) -> Result<Session> {
        let trace = match &options.trace_dir {
            Some(directory) => {
                Some(TraceWriter::create(directory.clone()).await?)
            }
            None => None,
        };

        let handle = Coordinator::spawn(
            options.config.clone(),
            host.clone(),
            source,
            trace,
        );
        handle.initialize().await?;

        let watcher = NavigationWatcher::new(
            handle.clone(),
            host.clone(),
            options.config.clone(),
        );
        watcher.initialize().await?;
        let watcher = watcher.spawn();

        let tab_id = page.tab_id();
        let transport = Arc::new(LocalTransport::new(handle.clone()));
        let controller = PageController {
            tab_id,
            page: page.clone(),
            transport,
            ui,
            healer,
            ai,
            config: options.config.clone(),
        }
        .spawn(handle.subscribe());

        let driver = options.auto.then(|| {
            SimulatedUser {
                page,
                tab_id,
                jitter: true,
            }
            .spawn(handle.subscribe())
        });

        Ok(Session {
            handle,
            controller: Some(controller),
            watcher,
            driver,
            host,
        })
    }

    pub fn handle(&self) -> &CoordinatorHandle {
        &self.handle
    }

    pub fn tabs(&self) -> TabManager {
        TabManager::new(self.handle.clone())
    }

    pub fn events(&self) -> broadcast::Receiver<StateChanged> {
        self.handle.subscribe()
    }

    /// The broadcast channel as a plain stream; lagged gaps are
    /// dropped.
    pub fn event_stream(
        &self,
    ) -> Pin<Box<dyn Stream<Item = StateChanged> + Send>> {
        Box::pin(
            BroadcastStream::new(self.handle.subscribe())
                .filter_map(async |result| result.ok()),
        )
    }

    /// Starts the walkthrough and, once the workflow is loaded, brings
    /// the primary tab to the starting URL if it isn't there already.
    pub async fn begin(&self, workflow_id: &str, tab_id: TabId) -> Result<()> {
        let mut events = self.handle.subscribe();
        let response = self
            .handle
            .command(WalkthroughCommand::Start {
                workflow_id: workflow_id.to_string(),
                tab_id,
            })
            .await;
        if !response.success {
            bail!(
                "could not start walkthrough: {}",
                response.error.as_deref().unwrap_or("unknown")
            );
        }

        // Wait for INITIALIZING to settle into the first step or fail.
        let state = tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                let message = events
                    .recv()
                    .await
                    .context("coordinator broadcast closed")?;
                match message.state.machine_state {
                    MachineState::ShowingStep => break Ok(message.state),
                    MachineState::Error => bail!(
                        "walkthrough failed to initialize: {}",
                        message
                            .state
                            .error_info
                            .as_ref()
                            .map(|error| error.message.as_str())
                            .unwrap_or("unknown")
                    ),
                    _ => continue,
                }
            }
        })
        .await
        .context("timed out waiting for the workflow to load")??;

        if let Some(starting_url) = &state.starting_url {
            let on_page = match self.host.tab_url(tab_id).await? {
                Some(current) => urls_match(&current, starting_url),
                None => false,
            };
            if !on_page {
                log::info!("bringing tab to {}", starting_url);
                self.host.navigate_tab(tab_id, starting_url).await?;
            }
        }
        Ok(())
    }

    /// Ends the session (if still active) and tears the pieces down.
    pub async fn shutdown(mut self) {
        if self.handle.state().is_active() {
            let _ = self.handle.end_session("shutdown").await;
        }
        if let Some(controller) = self.controller.take() {
            controller.shutdown().await;
        }
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        self.watcher.abort();
    }
}
