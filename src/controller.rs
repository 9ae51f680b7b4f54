use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::time::{Instant, sleep};

use crate::config::PlaybackConfig;
use crate::controller::detector::{ActionDetector, Observation, ValidationFailure};
use crate::controller::interceptor::ClickInterceptor;
use crate::healing::{AiValidator, HealContext, Healer};
use crate::host::{
    CaptureSpec, ClipboardKind, DomEvent, ElementHandle, PageDriver,
};
use crate::machine::state::{MachineState, TabId};
use crate::machine::WalkthroughState;
use crate::messaging::{
    CoordinatorReply, HealingReport, PageMessage, SendError, StateChanged,
    Transport, WalkthroughCommand, send_log, send_with_retry,
};
use crate::ui::{ErrorChoice, WalkthroughUi};
use crate::url::urls_match;
use crate::workflow::{ActionType, Step};

pub mod detector;
pub mod interceptor;

/// Per-tab agent. Consumes state broadcasts, finds step targets, drives
/// the UI, runs the action pipeline, and reports back over the command
/// channel. Element handles live here and never enter session state.
pub struct PageController {
    pub tab_id: TabId,
    pub page: Arc<dyn PageDriver>,
    pub transport: Arc<dyn Transport>,
    pub ui: Arc<dyn WalkthroughUi>,
    pub healer: Arc<dyn Healer>,
    pub ai: Option<Arc<dyn AiValidator>>,
    pub config: PlaybackConfig,
}

pub struct ControllerHandle {
    shutdown: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ControllerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.join.await;
    }
}

impl PageController {
    pub fn spawn(
        self,
        broadcasts: broadcast::Receiver<StateChanged>,
    ) -> ControllerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(async move {
            let mut runtime = ControllerRuntime::new(self);
            runtime.run(broadcasts, shutdown_rx).await;
        });
        ControllerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

/// Everything a spawned step/heal worker needs, cloneable into tasks.
#[derive(Clone)]
struct WorkerCtx {
    tab_id: TabId,
    page: Arc<dyn PageDriver>,
    transport: Arc<dyn Transport>,
    ui: Arc<dyn WalkthroughUi>,
    healer: Arc<dyn Healer>,
    ai: Option<Arc<dyn AiValidator>>,
    config: PlaybackConfig,
    interceptor: Arc<Mutex<ClickInterceptor>>,
    healed: Arc<StdMutex<Option<(usize, ElementHandle)>>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum WorkerKind {
    Step,
    Heal,
    Error,
}

struct Worker {
    step_index: usize,
    kind: WorkerKind,
    handle: tokio::task::JoinHandle<()>,
}

struct ControllerRuntime {
    ctx: WorkerCtx,
    worker: Option<Worker>,
}

impl ControllerRuntime {
    fn new(controller: PageController) -> Self {
        let interceptor = Arc::new(Mutex::new(ClickInterceptor::new(
            controller.page.clone(),
        )));
        ControllerRuntime {
            ctx: WorkerCtx {
                tab_id: controller.tab_id,
                page: controller.page,
                transport: controller.transport,
                ui: controller.ui,
                healer: controller.healer,
                ai: controller.ai,
                config: controller.config,
                interceptor,
                healed: Arc::new(StdMutex::new(None)),
            },
            worker: None,
        }
    }

    async fn run(
        &mut self,
        mut broadcasts: broadcast::Receiver<StateChanged>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        self.handshake().await;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::debug!("tab {}: controller shutting down", self.ctx.tab_id);
                    self.teardown().await;
                    break;
                }
                message = broadcasts.recv() => match message {
                    Ok(message) => {
                        if !message.recipients.contains(&self.ctx.tab_id) {
                            continue;
                        }
                        self.on_state(message.state, &message.trigger).await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!(
                            "tab {}: lagged {} broadcasts, resyncing",
                            self.ctx.tab_id,
                            missed
                        );
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => {
                        self.teardown().await;
                        break;
                    }
                }
            }
        }
    }

    /// TAB_READY handshake: announce ourselves and restore UI state if
    /// a session is already in flight (post-navigation reload).
    async fn handshake(&mut self) {
        let url = match self.ctx.page.current_url().await {
            Ok(url) => url,
            Err(error) => {
                log::warn!("tab {}: no current url: {}", self.ctx.tab_id, error);
                String::new()
            }
        };
        let reply = send_with_retry(
            self.ctx.transport.as_ref(),
            PageMessage::TabReady {
                tab_id: self.ctx.tab_id,
                url,
            },
            &self.ctx.config,
        )
        .await;
        match reply {
            Ok(CoordinatorReply::TabReady(response)) => {
                if response.has_active_session
                    && let Some(state) = response.state
                {
                    self.on_state(state, "TAB_READY").await;
                }
            }
            Ok(_) => {}
            Err(error) => {
                log::warn!(
                    "tab {}: handshake failed: {}",
                    self.ctx.tab_id,
                    error
                );
            }
        }
    }

    async fn resync(&mut self) {
        let reply = self
            .ctx
            .transport
            .send(PageMessage::Command {
                command: WalkthroughCommand::GetState,
            })
            .await;
        if let Ok(CoordinatorReply::Command(response)) = reply
            && let Some(state) = response.state
        {
            self.on_state(state, "RESYNC").await;
        }
    }

    async fn on_state(&mut self, state: WalkthroughState, trigger: &str) {
        log::debug!(
            "tab {}: {:?} (trigger {})",
            self.ctx.tab_id,
            state.machine_state,
            trigger
        );
        match state.machine_state {
            MachineState::ShowingStep => self.on_showing(&state).await,
            MachineState::WaitingAction => self.on_waiting(&state).await,
            MachineState::Healing => self.on_healing(&state).await,
            MachineState::Transitioning | MachineState::Initializing => {}
            MachineState::Navigating => {
                // Listeners die with the old document anyway; drop our
                // side eagerly so a stale commit can't slip through.
                self.stop_worker().await;
            }
            MachineState::Error => self.on_error(&state).await,
            MachineState::Completed => {
                self.stop_worker().await;
                let _ = self.ctx.page.end_capture().await;
                {
                    let mut interceptor = self.ctx.interceptor.lock().await;
                    let _ = interceptor.clear_target().await;
                }
                self.ctx.ui.show_completed().await;
            }
            MachineState::Idle => self.teardown().await,
        }
    }

    async fn on_showing(&mut self, state: &WalkthroughState) {
        let Some(step) = state.current_step().cloned() else {
            return;
        };
        let index = state.current_step_index;

        // Only the tab whose document can contain the target runs the
        // finder; everyone else waits for their page to come up.
        if let Some(context) = &step.page_context
            && let Ok(current) = self.ctx.page.current_url().await
            && !urls_match(&current, &context.url)
        {
            log::debug!(
                "tab {}: step {} belongs to {}, not {}",
                self.ctx.tab_id,
                index,
                context.url,
                current
            );
            self.stop_worker().await;
            return;
        }

        if let Some(worker) = &self.worker
            && worker.kind == WorkerKind::Step
            && worker.step_index == index
            && !worker.handle.is_finished()
        {
            return;
        }
        self.stop_worker().await;

        let ctx = self.ctx.clone();
        let handle = tokio::spawn(async move {
            run_step(ctx, step, index, None).await;
        });
        self.worker = Some(Worker {
            step_index: index,
            kind: WorkerKind::Step,
            handle,
        });
    }

    async fn on_waiting(&mut self, state: &WalkthroughState) {
        let index = state.current_step_index;
        if let Some(worker) = &self.worker
            && worker.step_index == index
            && worker.kind == WorkerKind::Step
            && !worker.handle.is_finished()
        {
            // The step worker that reported ELEMENT_FOUND is already
            // listening.
            return;
        }
        let Some(step) = state.current_step().cloned() else {
            return;
        };
        self.stop_worker().await;

        // After a heal the candidate element is the new target; after a
        // coordinator restart we re-find silently.
        let healed = {
            let slot = self.ctx.healed.lock().unwrap();
            slot.as_ref()
                .filter(|(healed_index, _)| *healed_index == index)
                .map(|(_, element)| element.clone())
        };
        let ctx = self.ctx.clone();
        let handle = tokio::spawn(async move {
            run_step(ctx, step, index, Some(healed)).await;
        });
        self.worker = Some(Worker {
            step_index: index,
            kind: WorkerKind::Step,
            handle,
        });
    }

    async fn on_healing(&mut self, state: &WalkthroughState) {
        let index = state.current_step_index;
        if let Some(worker) = &self.worker
            && worker.kind == WorkerKind::Heal
            && worker.step_index == index
            && !worker.handle.is_finished()
        {
            return;
        }
        let Some(step) = state.current_step().cloned() else {
            return;
        };
        self.stop_worker().await;

        let ctx = self.ctx.clone();
        let handle = tokio::spawn(async move {
            run_heal(ctx, step, index).await;
        });
        self.worker = Some(Worker {
            step_index: index,
            kind: WorkerKind::Heal,
            handle,
        });
    }

    async fn on_error(&mut self, state: &WalkthroughState) {
        let index = state.current_step_index;
        if let Some(worker) = &self.worker
            && worker.kind == WorkerKind::Error
            && !worker.handle.is_finished()
        {
            return;
        }
        self.stop_worker().await;
        let Some(error) = state.error_info.clone() else {
            return;
        };
        let can_retry =
            !error.error_type.is_terminal() && state.total_steps > 0;
        let ctx = self.ctx.clone();
        let handle = tokio::spawn(async move {
            let choice = ctx.ui.show_error(&error, can_retry).await;
            let command = match choice {
                ErrorChoice::Retry => Some(WalkthroughCommand::Retry),
                ErrorChoice::Skip => Some(WalkthroughCommand::Skip),
                ErrorChoice::Exit => Some(WalkthroughCommand::Exit),
                ErrorChoice::Dismiss => None,
            };
            if let Some(command) = command {
                send_command(&ctx, command).await;
            }
        });
        self.worker = Some(Worker {
            step_index: index,
            kind: WorkerKind::Error,
            handle,
        });
    }

    async fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.handle.abort();
            let _ = self.ctx.page.end_capture().await;
            let mut interceptor = self.ctx.interceptor.lock().await;
            let _ = interceptor.clear_target().await;
        }
    }

    /// IDLE broadcast or shutdown: the session is over for this tab.
    async fn teardown(&mut self) {
        self.stop_worker().await;
        let _ = self.ctx.page.end_capture().await;
        {
            let mut interceptor = self.ctx.interceptor.lock().await;
            let _ = interceptor.disable().await;
        }
        self.ctx.healed.lock().unwrap().take();
        self.ctx.ui.destroy().await;
    }
}

/// One step's page-side lifecycle: find (or adopt) the target, show the
/// UI, arm the detector, wait for a valid action, report, advance.
///
/// The detector is armed *before* ELEMENT_FOUND goes out: anything the
/// user does after the coaching UI appears must be observable, and the
/// baseline has to predate their first keystroke.
async fn run_step(
    ctx: WorkerCtx,
    step: Step,
    index: usize,
    known_target: Option<Option<ElementHandle>>,
) {
    if step.action_type == ActionType::Navigate {
        // No target element; the user navigating to the recorded page
        // is the action, observed through URL events.
        log::debug!("step {}: waiting for the recorded navigation", index);
        return;
    }

    let (target, announce) = match known_target {
        // Healed candidate (the coordinator already knows about it) or
        // restore-time re-find.
        Some(Some(element)) => (Some(element), false),
        Some(None) => (find_target(&ctx, &step).await, false),
        None => (find_target(&ctx, &step).await, true),
    };

    let Some(target) = target else {
        if announce {
            report_element_status(&ctx, index, false).await;
        } else {
            log::warn!("step {}: target vanished before attach", index);
        }
        return;
    };

    {
        let mut interceptor = ctx.interceptor.lock().await;
        if let Err(error) = interceptor.set_target(&target).await {
            log::warn!("step {}: interceptor target failed: {}", index, error);
        }
    }
    ctx.ui.show_step(&target, &step).await;

    wait_for_action(&ctx, &step, index, target, announce).await;
}

async fn find_target(ctx: &WorkerCtx, step: &Step) -> Option<ElementHandle> {
    let candidates = step.selectors.candidates(step.healed_selector.as_ref());
    if candidates.is_empty() {
        return None;
    }
    let attempts = ctx.config.max_element_find_retries.max(1);
    for attempt in 0..attempts {
        let deadline = Instant::now() + ctx.config.element_find_timeout();
        while Instant::now() < deadline {
            for (kind, selector) in &candidates {
                match ctx.page.query(*kind, selector).await {
                    Ok(Some(element)) => return Some(element),
                    Ok(None) => {}
                    Err(error) => {
                        log::debug!("query {} failed: {}", selector, error);
                    }
                }
            }
            sleep(Duration::from_millis(200)).await;
        }
        if attempt + 1 < attempts {
            log::debug!(
                "step {}: not found, search attempt {}",
                step.step_number,
                attempt + 2
            );
        }
    }
    None
}

async fn wait_for_action(
    ctx: &WorkerCtx,
    step: &Step,
    index: usize,
    target: ElementHandle,
    announce: bool,
) {
    // Subscribe before anything else so no event can be lost between
    // the announcement and the first recv.
    let mut events = ctx.page.dom_events();

    // Attach-time baseline; the user may already be focused inside the
    // target when the step appears.
    let baseline = match ctx.page.focused_value_within(&target).await {
        Ok(Some(value)) => value,
        _ => ctx
            .page
            .read_value(&target)
            .await
            .unwrap_or_default(),
    };

    let form = match ctx.page.form_ancestor(&target).await {
        Ok(form) => form,
        Err(error) => {
            log::debug!("form lookup failed: {}", error);
            None
        }
    };

    let spec = match step.action_type {
        ActionType::Click => Some(CaptureSpec::Click),
        ActionType::InputCommit => Some(CaptureSpec::InputCommit),
        ActionType::SelectChange => Some(CaptureSpec::SelectChange),
        ActionType::Submit => form
            .clone()
            .map(|form| CaptureSpec::Submit { form }),
        ActionType::Copy => {
            Some(CaptureSpec::Clipboard(ClipboardKind::Copy))
        }
        ActionType::Cut => Some(CaptureSpec::Clipboard(ClipboardKind::Cut)),
        ActionType::Paste => {
            Some(CaptureSpec::Clipboard(ClipboardKind::Paste))
        }
        // Filtered out before the worker attaches anything.
        ActionType::Navigate => None,
    };

    let attached = match &spec {
        Some(spec) => match ctx.page.begin_capture(&target, spec).await {
            Ok(attached) => attached,
            Err(error) => {
                log::error!("step {}: attach failed: {}", index, error);
                false
            }
        },
        // Submit step without a form: nothing to listen on.
        None => false,
    };

    if announce {
        report_element_status(ctx, index, true).await;
    }
    if !attached {
        report_action(
            ctx,
            index,
            step.action_type,
            None,
            false,
            Some(ValidationFailure::InvalidTarget.code()),
        )
        .await;
        return;
    }

    let mut detector =
        ActionDetector::new(step, target.clone(), form, baseline);

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                log::warn!("step {}: {} DOM events dropped", index, missed);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if let DomEvent::ClickBlocked { .. } = event {
            {
                let interceptor = ctx.interceptor.lock().await;
                let _ = interceptor.on_blocked_click().await;
            }
            ctx.ui.notify_click_blocked().await;
            continue;
        }

        match detector.observe(&event) {
            Observation::Ignored => {}
            Observation::Invalid { reason } => {
                log::debug!(
                    "step {}: invalid action ({})",
                    index,
                    reason.code()
                );
                report_action(
                    ctx,
                    index,
                    step.action_type,
                    None,
                    false,
                    Some(reason.code()),
                )
                .await;
            }
            Observation::Detected { value } => {
                report_action(
                    ctx,
                    index,
                    step.action_type,
                    value.clone(),
                    true,
                    None,
                )
                .await;
                // Fire-and-forget analytics, never retried.
                send_log(
                    ctx.transport.as_ref(),
                    serde_json::json!({
                        "event": "action_detected",
                        "stepIndex": index,
                        "actionType": step.action_type,
                        "hasValue": value.is_some(),
                    }),
                )
                .await;
                // Leave the confirmation visible briefly before the UI
                // moves on.
                sleep(advance_delay(&ctx.config, step.action_type)).await;
                let _ = ctx.page.end_capture().await;
                {
                    let mut interceptor = ctx.interceptor.lock().await;
                    let _ = interceptor.clear_target().await;
                }
                send_command(ctx, WalkthroughCommand::Next).await;
                break;
            }
        }
    }
}

async fn run_heal(ctx: WorkerCtx, step: Step, index: usize) {
    ctx.ui.show_healing().await;

    let context = HealContext {
        config: &ctx.config,
        ai: ctx.ai.as_deref(),
        ui: ctx.ui.as_ref(),
    };
    let report = match ctx
        .healer
        .heal_element(ctx.page.as_ref(), &step, context)
        .await
    {
        Ok(result) => {
            for line in &result.healing_log {
                log::debug!("heal step {}: {}", index, line);
            }
            if result.success
                && let Some(element) = &result.element
            {
                *ctx.healed.lock().unwrap() =
                    Some((index, element.clone()));
            }
            HealingReport {
                success: result.success,
                confidence: result.confidence,
                ai_validated: result.resolution
                    == crate::healing::Resolution::HealedAi,
                healed_selector: result.healed_selector,
                failure_reason: result.failure_reason,
                candidates_evaluated: result.candidates_evaluated,
            }
        }
        Err(error) => {
            log::error!("step {}: healer failed: {:#}", index, error);
            HealingReport {
                success: false,
                confidence: 0.0,
                ai_validated: false,
                healed_selector: None,
                failure_reason: Some(format!("{:#}", error)),
                candidates_evaluated: 0,
            }
        }
    };

    let message = PageMessage::HealingResult {
        step_index: index,
        result: report,
    };
    if let Err(error) =
        send_with_retry(ctx.transport.as_ref(), message, &ctx.config).await
    {
        log::error!("step {}: healing report lost: {}", index, error);
    }
}

fn advance_delay(config: &PlaybackConfig, action: ActionType) -> Duration {
    let millis = match action {
        ActionType::Click => config.advance_delays.click_ms,
        ActionType::SelectChange => config.advance_delays.select_ms,
        ActionType::InputCommit => config.advance_delays.input_ms,
        _ => config.advance_delays.other_ms,
    };
    Duration::from_millis(millis)
}

async fn report_element_status(ctx: &WorkerCtx, index: usize, found: bool) {
    let message = PageMessage::ElementStatus {
        step_index: index,
        found,
        tab_id: ctx.tab_id,
    };
    if let Err(error) =
        send_with_retry(ctx.transport.as_ref(), message, &ctx.config).await
    {
        log::error!("element status report lost: {}", error);
    }
}

async fn report_action(
    ctx: &WorkerCtx,
    index: usize,
    action_type: ActionType,
    value: Option<String>,
    valid: bool,
    reason: Option<&str>,
) {
    let message = PageMessage::Command {
        command: WalkthroughCommand::ReportAction {
            step_index: index,
            action_type,
            value,
            valid,
            reason: reason.map(|reason| reason.to_string()),
            tab_id: ctx.tab_id,
        },
    };
    if let Err(error) =
        send_with_retry(ctx.transport.as_ref(), message, &ctx.config).await
    {
        log::error!("action report lost: {}", error);
    }
}

async fn send_command(ctx: &WorkerCtx, command: WalkthroughCommand) {
    let message = PageMessage::Command { command };
    match send_with_retry(ctx.transport.as_ref(), message, &ctx.config).await
    {
        Ok(CoordinatorReply::Command(response)) if !response.success => {
            log::debug!(
                "command refused: {}",
                response.error.as_deref().unwrap_or("unknown")
            );
        }
        Ok(_) => {}
        Err(SendError::Transport(error)) => {
            log::error!("command lost to transport: {}", error);
        }
        Err(SendError::Business(error)) => {
            log::debug!("command refused: {}", error);
        }
    }
}
