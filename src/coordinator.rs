use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json as json;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::PlaybackConfig;
use crate::host::Host;
use crate::machine::state::{
    NAVIGATION_TIMEOUT_ALARM, SESSION_STATE_KEY, TabId,
};
use crate::machine::{
    self, MachineState, SessionEvent, Verdict, WalkthroughState,
};
use crate::messaging::{
    CommandResponse, CoordinatorReply, PageMessage, StateChanged,
    TabReadyResponse, WalkthroughCommand,
};
use crate::router::{self, RoutePlan, RouteRefusal};
use crate::trace::{TraceEntry, TraceWriter};
use crate::workflow::WorkflowSource;

/// Local observer callback. Errors are logged and never interrupt the
/// dispatch that triggered them.
pub type Subscriber = Box<dyn Fn(&StateChanged) -> Result<()> + Send + Sync>;

enum Command {
    Initialize {
        reply: oneshot::Sender<WalkthroughState>,
    },
    Dispatch {
        event: SessionEvent,
        reply: Option<oneshot::Sender<WalkthroughState>>,
    },
    Wire {
        message: PageMessage,
        reply: oneshot::Sender<CoordinatorReply>,
    },
    AddTab {
        tab_id: TabId,
        reply: oneshot::Sender<()>,
    },
    RemoveTab {
        tab_id: TabId,
        reply: oneshot::Sender<()>,
    },
    StateForTab {
        tab_id: TabId,
        reply: oneshot::Sender<Option<WalkthroughState>>,
    },
    Subscribe {
        subscriber: Subscriber,
    },
    TimerFired {
        generation: u64,
    },
}

/// Handle to the single process-wide coordinator worker. Cloneable;
/// every clone talks to the same serialized dispatch queue.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    broadcasts: broadcast::Sender<StateChanged>,
    snapshots: watch::Receiver<WalkthroughState>,
}

impl CoordinatorHandle {
    /// Restores persisted state, clearing it when it has already
    /// expired. Returns the state the coordinator settled on.
    pub async fn initialize(&self) -> Result<WalkthroughState> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Initialize { reply })
            .await
            .map_err(|_| anyhow!("coordinator gone"))?;
        rx.await.context("coordinator dropped initialize reply")
    }

    /// The only mutation entry point. Returns the post-transition state
    /// (unchanged when the event didn't apply).
    pub async fn dispatch(
        &self,
        event: SessionEvent,
    ) -> Result<WalkthroughState> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Dispatch {
                event,
                reply: Some(tx),
            })
            .await
            .map_err(|_| anyhow!("coordinator gone"))?;
        rx.await.context("coordinator dropped dispatch reply")
    }

    /// Full wire surface: commands, reports, and the TAB_READY
    /// handshake.
    pub async fn handle(&self, message: PageMessage) -> CoordinatorReply {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Wire { message, reply })
            .await
            .is_err()
        {
            return CoordinatorReply::Command(CommandResponse {
                success: false,
                state: None,
                error: Some("coordinator gone".into()),
                navigating: None,
            });
        }
        rx.await.unwrap_or(CoordinatorReply::Command(CommandResponse {
            success: false,
            state: None,
            error: Some("coordinator gone".into()),
            navigating: None,
        }))
    }

    pub async fn command(
        &self,
        command: WalkthroughCommand,
    ) -> CommandResponse {
        match self.handle(PageMessage::Command { command }).await {
            CoordinatorReply::Command(response) => response,
            _ => CommandResponse {
                success: false,
                state: None,
                error: Some("unexpected reply".into()),
                navigating: None,
            },
        }
    }

    pub fn state(&self) -> WalkthroughState {
        self.snapshots.borrow().clone()
    }

    pub async fn state_for_tab(
        &self,
        tab_id: TabId,
    ) -> Option<WalkthroughState> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::StateForTab { tab_id, reply })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn add_tab(&self, tab_id: TabId) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::AddTab { tab_id, reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Removing the primary tab ends the session; any other tab just
    /// leaves the membership sets.
    pub async fn remove_tab(&self, tab_id: TabId) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::RemoveTab { tab_id, reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn end_session(&self, reason: &str) -> Result<WalkthroughState> {
        self.dispatch(SessionEvent::Exit {
            reason: Some(reason.to_string()),
        })
        .await
    }

    /// Broadcast stream of every applied mutation, in dispatch order.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChanged> {
        self.broadcasts.subscribe()
    }

    /// In-process callback observer.
    pub async fn subscribe_fn(&self, subscriber: Subscriber) {
        let _ = self.commands.send(Command::Subscribe { subscriber }).await;
    }

    /// Cheap current-state watch for components that only need the
    /// latest snapshot.
    pub fn snapshots(&self) -> watch::Receiver<WalkthroughState> {
        self.snapshots.clone()
    }
}

pub struct Coordinator {
    state: WalkthroughState,
    config: PlaybackConfig,
    host: Arc<dyn Host>,
    source: Arc<dyn WorkflowSource>,
    trace: Option<TraceWriter>,
    subscribers: Vec<Subscriber>,
    broadcasts: broadcast::Sender<StateChanged>,
    snapshots: watch::Sender<WalkthroughState>,
    self_commands: mpsc::Sender<Command>,
    timer_generation: u64,
}

impl Coordinator {
    /// Spawns the worker that owns the state. All mutations funnel into
    /// its queue, which is what serializes concurrent dispatches.
    pub fn spawn(
        config: PlaybackConfig,
        host: Arc<dyn Host>,
        source: Arc<dyn WorkflowSource>,
        trace: Option<TraceWriter>,
    ) -> CoordinatorHandle {
        let (commands_tx, mut commands_rx) = mpsc::channel::<Command>(64);
        let (broadcasts, _) = broadcast::channel(64);
        let (snapshots_tx, snapshots_rx) =
            watch::channel(WalkthroughState::idle());

        let handle = CoordinatorHandle {
            commands: commands_tx.clone(),
            broadcasts: broadcasts.clone(),
            snapshots: snapshots_rx,
        };

        let mut coordinator = Coordinator {
            state: WalkthroughState::idle(),
            config,
            host,
            source,
            trace,
            subscribers: Vec::new(),
            broadcasts,
            snapshots: snapshots_tx,
            self_commands: commands_tx,
            timer_generation: 0,
        };

        tokio::spawn(async move {
            while let Some(command) = commands_rx.recv().await {
                coordinator.handle_command(command).await;
            }
            log::debug!("coordinator queue closed, worker exiting");
        });

        handle
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize { reply } => {
                self.restore_persisted().await;
                let _ = reply.send(self.state.clone());
            }
            Command::Dispatch { event, reply } => {
                self.apply(event).await;
                if let Some(reply) = reply {
                    let _ = reply.send(self.state.clone());
                }
            }
            Command::Wire { message, reply } => {
                let response = self.handle_wire(message).await;
                let _ = reply.send(response);
            }
            Command::AddTab { tab_id, reply } => {
                if self.state.is_active() {
                    let mut next = self.state.clone();
                    next.tabs.add_active(tab_id);
                    if next != self.state {
                        self.commit(next, "ADD_TAB").await;
                    }
                }
                let _ = reply.send(());
            }
            Command::RemoveTab { tab_id, reply } => {
                if self.state.tabs.primary_tab_id == Some(tab_id) {
                    self.apply(SessionEvent::TabClosed { tab_id }).await;
                } else if self.state.tabs.active_tab_ids.contains(&tab_id) {
                    let mut next = self.state.clone();
                    next.tabs.remove(tab_id);
                    self.commit(next, "REMOVE_TAB").await;
                }
                let _ = reply.send(());
            }
            Command::StateForTab { tab_id, reply } => {
                let state = self
                    .state
                    .tabs
                    .active_tab_ids
                    .contains(&tab_id)
                    .then(|| self.state.clone());
                let _ = reply.send(state);
            }
            Command::Subscribe { subscriber } => {
                self.subscribers.push(subscriber);
            }
            Command::TimerFired { generation } => {
                self.handle_timer(generation).await;
            }
        }
    }

    /// Runs one machine dispatch plus the side-effect sequence:
    /// activity refresh, timer, persistence, broadcast, subscribers.
    /// Any error in the effects is logged and isolated so the queue
    /// keeps draining.
    async fn apply(&mut self, event: SessionEvent) {
        let now = self.host.now_ms();
        let result = machine::dispatch(
            self.state.clone(),
            &event,
            now,
            &self.config,
        );
        match result.verdict {
            Verdict::Unhandled => {
                log::warn!(
                    "event {} not handled in {:?}",
                    event.kind(),
                    self.state.machine_state
                );
                return;
            }
            Verdict::Ignored(reason) => {
                log::debug!("event {} ignored: {}", event.kind(), reason);
                return;
            }
            Verdict::Applied => {}
        }

        let was_navigating =
            self.state.machine_state == MachineState::Navigating;
        let mut new_state = result.state;
        if new_state.is_active() {
            new_state.touch(now, self.config.session_timeout_ms);
        }

        if was_navigating
            && new_state.machine_state != MachineState::Navigating
            && let Err(error) =
                self.host.cancel_alarm(NAVIGATION_TIMEOUT_ALARM).await
        {
            log::warn!("failed to cancel navigation alarm: {}", error);
        }

        self.commit(new_state, event.kind()).await;
        self.after_apply(&event).await;
    }

    /// Persist + broadcast + notify for an already-computed state.
    async fn commit(&mut self, new_state: WalkthroughState, trigger: &str) {
        let previous_tabs = self.state.tabs.active_tab_ids.clone();
        let from = self.state.machine_state;

        if self.is_session_over(&new_state) {
            // Invalidate any pending inactivity timer.
            self.timer_generation += 1;
        } else if new_state.is_active() {
            self.restart_inactivity_timer();
        }

        if let Err(error) = self.persist(&new_state).await {
            log::error!("failed to persist session state: {}", error);
        }

        // An IDLE snapshot is addressed to the tabs of the session that
        // just ended, so they know to tear down.
        let recipients = if new_state.machine_state == MachineState::Idle {
            previous_tabs
        } else {
            new_state.tabs.active_tab_ids.clone()
        };
        let message = StateChanged {
            state: new_state.clone(),
            trigger: trigger.to_string(),
            recipients,
        };
        // No receiver just means no tab is listening yet.
        let _ = self.broadcasts.send(message.clone());
        for subscriber in &self.subscribers {
            if let Err(error) = subscriber(&message) {
                log::warn!("state subscriber failed: {}", error);
            }
        }

        if let Some(trace) = self.trace.as_mut() {
            trace
                .append(&TraceEntry::Transition {
                    timestamp_ms: self.host.now_ms(),
                    session_id: new_state.session_id.clone(),
                    trigger: trigger.to_string(),
                    from,
                    to: new_state.machine_state,
                    step_index: new_state.current_step_index,
                })
                .await;
        }

        let _ = self.snapshots.send(new_state.clone());
        self.state = new_state;
    }

    async fn persist(&self, state: &WalkthroughState) -> Result<()> {
        if state.machine_state == MachineState::Idle {
            self.host.store_delete(SESSION_STATE_KEY).await
        } else {
            let value = json::to_value(state)?;
            self.host.store_put(SESSION_STATE_KEY, &value).await
        }
    }

    /// Transition-driven follow-ups that are not part of the machine.
    async fn after_apply(&mut self, event: &SessionEvent) {
        if let SessionEvent::Start { workflow_id, .. } = event
            && self.state.machine_state == MachineState::Initializing
        {
            self.load_workflow(workflow_id.clone());
        }
    }

    fn load_workflow(&self, workflow_id: String) {
        let source = self.source.clone();
        let commands = self.self_commands.clone();
        tokio::spawn(async move {
            let event = match source.fetch(&workflow_id).await {
                Ok(workflow) => SessionEvent::DataLoaded { workflow },
                Err(error) => {
                    log::error!(
                        "loading workflow {} failed: {:#}",
                        workflow_id,
                        error
                    );
                    SessionEvent::InitFailed {
                        message: format!("{:#}", error),
                    }
                }
            };
            let _ = commands
                .send(Command::Dispatch { event, reply: None })
                .await;
        });
    }

    /// IDLE, COMPLETED, and unretryable ERROR stop the inactivity
    /// timer; everything else keeps the session on the clock.
    fn is_session_over(&self, state: &WalkthroughState) -> bool {
        match state.machine_state {
            MachineState::Idle | MachineState::Completed => true,
            MachineState::Error => state.total_steps == 0,
            _ => false,
        }
    }

    fn restart_inactivity_timer(&mut self) {
        self.timer_generation += 1;
        let generation = self.timer_generation;
        let commands = self.self_commands.clone();
        let timeout = self.config.session_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = commands.send(Command::TimerFired { generation }).await;
        });
    }

    async fn handle_timer(&mut self, generation: u64) {
        if generation != self.timer_generation {
            return;
        }
        if !self.state.is_active() {
            return;
        }
        let now = self.host.now_ms();
        if now < self.state.timing.expires_at {
            // Clock and timer disagree (activity refreshed the expiry
            // through a non-dispatch path); re-arm for the remainder.
            let remaining = self.state.timing.expires_at - now;
            let generation = {
                self.timer_generation += 1;
                self.timer_generation
            };
            let commands = self.self_commands.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(remaining)).await;
                let _ =
                    commands.send(Command::TimerFired { generation }).await;
            });
            return;
        }
        log::info!("session inactive past deadline, ending");
        self.apply(SessionEvent::Exit {
            reason: Some("timeout".into()),
        })
        .await;
    }

    async fn restore_persisted(&mut self) {
        let restored: Option<WalkthroughState> =
            match self.host.store_get(SESSION_STATE_KEY).await {
                Ok(Some(value)) => match json::from_value(value) {
                    Ok(state) => Some(state),
                    Err(error) => {
                        log::warn!(
                            "persisted session state unreadable, discarding: {}",
                            error
                        );
                        None
                    }
                },
                Ok(None) => None,
                Err(error) => {
                    log::error!("session store read failed: {}", error);
                    None
                }
            };

        let Some(state) = restored else {
            let _ = self.host.store_delete(SESSION_STATE_KEY).await;
            return;
        };

        let now = self.host.now_ms();
        if !state.is_active() || now > state.timing.expires_at {
            log::info!("persisted session expired, clearing");
            let _ = self.host.store_delete(SESSION_STATE_KEY).await;
            return;
        }

        log::info!(
            "restoring session {:?} in {:?}",
            state.session_id,
            state.machine_state
        );
        self.state = state.clone();
        let _ = self.snapshots.send(state);
        self.restart_inactivity_timer();
    }

    async fn handle_wire(&mut self, message: PageMessage) -> CoordinatorReply {
        match message {
            PageMessage::Command { command } => {
                CoordinatorReply::Command(self.handle_wire_command(command).await)
            }
            PageMessage::ElementStatus {
                step_index,
                found,
                tab_id: _,
            } => {
                let event = if found {
                    SessionEvent::ElementFound { step_index }
                } else {
                    SessionEvent::ElementNotFound { step_index }
                };
                self.apply(event).await;
                CoordinatorReply::Ack
            }
            PageMessage::HealingResult { step_index, result } => {
                let event = if result.success {
                    SessionEvent::HealSuccess {
                        step_index,
                        confidence: result.confidence,
                        healed_selector: result.healed_selector,
                        candidates_evaluated: result.candidates_evaluated,
                    }
                } else {
                    SessionEvent::HealFailed {
                        step_index,
                        reason: result.failure_reason,
                    }
                };
                self.apply(event).await;
                CoordinatorReply::Ack
            }
            PageMessage::ExecutionLog { entry } => {
                if let Some(trace) = self.trace.as_mut() {
                    trace
                        .append(&TraceEntry::Execution {
                            timestamp_ms: self.host.now_ms(),
                            session_id: self.state.session_id.clone(),
                            entry,
                        })
                        .await;
                }
                CoordinatorReply::Ack
            }
            PageMessage::TabReady { tab_id, url } => {
                if self.state.is_active() {
                    self.apply(SessionEvent::TabReady { tab_id, url }).await;
                    CoordinatorReply::TabReady(TabReadyResponse {
                        has_active_session: true,
                        state: Some(self.state.clone()),
                    })
                } else {
                    CoordinatorReply::TabReady(TabReadyResponse {
                        has_active_session: false,
                        state: None,
                    })
                }
            }
        }
    }

    async fn handle_wire_command(
        &mut self,
        command: WalkthroughCommand,
    ) -> CommandResponse {
        match command {
            WalkthroughCommand::Start { workflow_id, tab_id } => {
                if self.state.is_active() {
                    return refuse("session already in progress");
                }
                let session_id =
                    format!("ws-{:016x}", rand::random::<u64>());
                self.apply(SessionEvent::Start {
                    session_id,
                    workflow_id,
                    tab_id,
                })
                .await;
                self.ok()
            }
            WalkthroughCommand::Next => {
                match self.state.machine_state {
                    MachineState::Transitioning
                    | MachineState::Navigating => {
                        self.apply(SessionEvent::NextStep).await;
                        self.ok()
                    }
                    _ => {
                        let target = self.state.current_step_index + 1;
                        self.route_jump(target).await
                    }
                }
            }
            WalkthroughCommand::Prev => {
                if self.state.machine_state == MachineState::Transitioning {
                    self.apply(SessionEvent::PrevStep).await;
                    return self.ok();
                }
                if self.state.current_step_index == 0 {
                    return self.refuse_route(RouteRefusal::InvalidIndex);
                }
                let target = self.state.current_step_index - 1;
                self.route_jump(target).await
            }
            WalkthroughCommand::JumpTo { index } => {
                self.route_jump(index).await
            }
            WalkthroughCommand::Retry => {
                self.apply(SessionEvent::Retry).await;
                self.ok()
            }
            WalkthroughCommand::Skip => {
                self.apply(SessionEvent::SkipStep).await;
                if self.state.machine_state == MachineState::Transitioning {
                    // Surface the step the skip landed on.
                    self.apply(SessionEvent::NextStep).await;
                }
                self.ok()
            }
            WalkthroughCommand::Exit => {
                self.apply(SessionEvent::Exit {
                    reason: Some("user".into()),
                })
                .await;
                self.ok()
            }
            WalkthroughCommand::GetState => self.ok(),
            WalkthroughCommand::ReportAction {
                step_index,
                action_type,
                value,
                valid,
                reason,
                tab_id: _,
            } => {
                if !self.state.is_active() {
                    return refuse("no active session");
                }
                if !valid {
                    self.apply(SessionEvent::ActionInvalid {
                        step_index,
                        reason: reason
                            .unwrap_or_else(|| "invalid_action".into()),
                    })
                    .await;
                    return self.ok();
                }
                let expected = self
                    .state
                    .steps
                    .get(step_index)
                    .map(|step| step.action_type);
                if expected != Some(action_type) {
                    self.apply(SessionEvent::ActionInvalid {
                        step_index,
                        reason: "wrong_action".into(),
                    })
                    .await;
                    return self.ok();
                }
                self.apply(SessionEvent::ActionDetected {
                    step_index,
                    action_type,
                    value,
                })
                .await;
                self.ok()
            }
        }
    }

    /// Dispatches the jump before any navigation so the index is right
    /// by the time URL_CHANGED / PAGE_LOADED land; no intermediate step
    /// ever flashes in the UI.
    async fn route_jump(&mut self, index: usize) -> CommandResponse {
        let primary = self.state.tabs.primary_tab_id;
        let current_url = match primary {
            Some(tab_id) => match self.host.tab_url(tab_id).await {
                Ok(url) => url,
                Err(error) => {
                    log::warn!("tab url lookup failed: {}", error);
                    None
                }
            },
            None => None,
        };

        match router::plan_jump(&self.state, index, current_url.as_deref()) {
            RoutePlan::Refuse(refusal) => self.refuse_route(refusal),
            RoutePlan::Jump { index, navigate_to } => {
                self.apply(SessionEvent::JumpToStep { index }).await;
                if self.state.current_step_index != index {
                    // Guard failed inside the machine (e.g. jump from a
                    // terminal state); report it as an invalid index.
                    return self.refuse_route(RouteRefusal::InvalidIndex);
                }
                let Some(target) = navigate_to else {
                    let mut response = self.ok();
                    response.navigating = Some(false);
                    return response;
                };
                let Some(tab_id) = primary else {
                    return self.refuse_route(RouteRefusal::NavigationFailed);
                };
                if let Err(error) =
                    self.host.navigate_tab(tab_id, &target).await
                {
                    log::error!("navigation to {} failed: {}", target, error);
                    return self.refuse_route(RouteRefusal::NavigationFailed);
                }
                let mut response = self.ok();
                response.navigating = Some(true);
                response
            }
        }
    }

    fn ok(&self) -> CommandResponse {
        CommandResponse {
            success: true,
            state: Some(self.state.clone()),
            error: None,
            navigating: None,
        }
    }

    fn refuse_route(&self, refusal: RouteRefusal) -> CommandResponse {
        CommandResponse {
            success: false,
            state: Some(self.state.clone()),
            error: Some(refusal.code().to_string()),
            navigating: None,
        }
    }
}

fn refuse(message: &str) -> CommandResponse {
    CommandResponse {
        success: false,
        state: None,
        error: Some(message.to_string()),
        navigating: None,
    }
}

/// In-process page→coordinator transport. The only transport failure it
/// can produce is the coordinator being gone, reported with the same
/// message the extension runtime would use.
pub struct LocalTransport {
    handle: CoordinatorHandle,
}

impl LocalTransport {
    pub fn new(handle: CoordinatorHandle) -> Self {
        LocalTransport { handle }
    }
}

#[async_trait::async_trait]
impl crate::messaging::Transport for LocalTransport {
    async fn send(
        &self,
        message: PageMessage,
    ) -> Result<CoordinatorReply, crate::messaging::SendError> {
        let (reply, rx) = oneshot::channel();
        self.handle
            .commands
            .send(Command::Wire { message, reply })
            .await
            .map_err(|_| {
                crate::messaging::SendError::classify(
                    "could not establish connection: coordinator gone",
                )
            })?;
        rx.await.map_err(|_| {
            crate::messaging::SendError::classify(
                "could not establish connection: coordinator gone",
            )
        })
    }
}
