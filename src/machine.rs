use crate::config::PlaybackConfig;
use crate::url::urls_match;
use crate::workflow::{ActionData, ActionType, Step};

pub mod event;
pub mod state;

pub use event::SessionEvent;
pub use state::{
    ErrorInfo, ErrorKind, HealingInfo, MachineState, NavigationInfo, TabSet,
    Timing, WalkthroughState,
};

/// Result of one dispatch. `Applied` means the returned state replaced
/// the old one; the other verdicts mean the input state came back
/// untouched and the caller must produce no side effects for it.
#[derive(Debug)]
pub struct Dispatch {
    pub state: WalkthroughState,
    pub verdict: Verdict,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Applied,
    /// Accepted as a deliberate no-op (race protection rows).
    Ignored(&'static str),
    /// No matching row or a failed guard. Logged by the caller, never
    /// fatal.
    Unhandled,
}

impl Dispatch {
    fn applied(state: WalkthroughState) -> Self {
        Dispatch {
            state,
            verdict: Verdict::Applied,
        }
    }

    fn ignored(state: WalkthroughState, reason: &'static str) -> Self {
        Dispatch {
            state,
            verdict: Verdict::Ignored(reason),
        }
    }

    fn unhandled(state: WalkthroughState) -> Self {
        Dispatch {
            state,
            verdict: Verdict::Unhandled,
        }
    }
}

/// The session machine. A total function: any event in any state yields
/// a state, and unknown pairs return the input unchanged. No I/O; `now`
/// is the only time source.
pub fn dispatch(
    state: WalkthroughState,
    event: &SessionEvent,
    now: u64,
    config: &PlaybackConfig,
) -> Dispatch {
    use MachineState::*;

    // Global rows come first; first match wins.
    match event {
        SessionEvent::Exit { .. } => {
            if state.machine_state == Idle {
                return Dispatch::ignored(state, "already idle");
            }
            return Dispatch::applied(state.reset_keeping_session_id());
        }
        SessionEvent::TabClosed { tab_id } => {
            if state.is_active()
                && state.tabs.primary_tab_id == Some(*tab_id)
            {
                return Dispatch::applied(state.reset_keeping_session_id());
            }
            return Dispatch::unhandled(state);
        }
        SessionEvent::TabReady { tab_id, .. } => {
            if !state.is_active() {
                return Dispatch::unhandled(state);
            }
            if state.tabs.ready_tab_ids.contains(tab_id) {
                return Dispatch::ignored(state, "tab already ready");
            }
            let mut next = state;
            next.tabs.add_ready(*tab_id);
            return Dispatch::applied(next);
        }
        _ => {}
    }

    match (state.machine_state, event) {
        (Idle, SessionEvent::Start { session_id, workflow_id, tab_id }) => {
            let mut next = WalkthroughState::idle();
            next.session_id = Some(session_id.clone());
            next.workflow_id = Some(workflow_id.clone());
            next.tabs.primary_tab_id = Some(*tab_id);
            next.tabs.add_ready(*tab_id);
            next.timing = Timing {
                session_started_at: now,
                last_activity_at: now,
                expires_at: now,
            };
            next.previous_state = Idle;
            next.machine_state = Initializing;
            Dispatch::applied(next)
        }

        (Initializing, SessionEvent::DataLoaded { workflow }) => {
            if workflow.steps.is_empty() {
                return Dispatch::applied(enter_error(
                    state,
                    ErrorKind::ApiError,
                    "workflow has no steps".to_string(),
                    None,
                ));
            }
            let mut next = state;
            next.workflow_id = Some(workflow.id.clone());
            next.workflow_name = Some(workflow.name.clone());
            next.starting_url = Some(workflow.starting_url.clone());
            next.total_steps = workflow.steps.len();
            next.steps = workflow.steps.clone();
            next.current_step_index = 0;
            Dispatch::applied(transition(next, ShowingStep))
        }

        (Initializing, SessionEvent::InitFailed { message }) => {
            Dispatch::applied(enter_error(
                state,
                ErrorKind::ApiError,
                message.clone(),
                None,
            ))
        }

        (ShowingStep, SessionEvent::ElementFound { step_index }) => {
            if *step_index != state.current_step_index {
                return Dispatch::ignored(state, "stale element report");
            }
            Dispatch::applied(transition(state, WaitingAction))
        }

        (ShowingStep, SessionEvent::ElementNotFound { step_index }) => {
            if *step_index != state.current_step_index {
                return Dispatch::ignored(state, "stale element report");
            }
            let mut next = state;
            next.healing_info = Some(HealingInfo {
                in_progress: true,
                candidate_count: 0,
                best_score: 0.0,
                ai_validation_requested: false,
            });
            Dispatch::applied(transition(next, Healing))
        }

        (
            ShowingStep | WaitingAction | Transitioning,
            SessionEvent::UrlChanged { tab_id, url },
        ) => Dispatch::applied(begin_navigation(state, *tab_id, url, now)),

        (
            ShowingStep | WaitingAction | Transitioning | Healing | Error,
            SessionEvent::JumpToStep { index },
        ) => jump_to(state, *index),

        (WaitingAction, SessionEvent::ActionDetected { step_index, .. }) => {
            if *step_index != state.current_step_index {
                return Dispatch::ignored(state, "stale action report");
            }
            let mut next = state;
            let index = next.current_step_index;
            next.mark_step_completed(index);
            next.reset_retries(index);
            Dispatch::applied(transition(next, Transitioning))
        }

        (WaitingAction, SessionEvent::ActionInvalid { step_index, reason }) => {
            if *step_index != state.current_step_index {
                return Dispatch::ignored(state, "stale action report");
            }
            let mut next = state;
            let index = next.current_step_index;
            let retries = next.bump_retries(index);
            if retries >= config.max_action_retries {
                let mut errored = enter_error(
                    next,
                    ErrorKind::ActionInvalid,
                    reason.clone(),
                    Some(index),
                );
                if let Some(info) = errored.error_info.as_mut() {
                    info.retry_count = retries;
                }
                return Dispatch::applied(errored);
            }
            // Stays in WAITING_ACTION; still an applied transition so the
            // bumped retry count is persisted and broadcast.
            Dispatch::applied(transition(next, WaitingAction))
        }

        (Healing, SessionEvent::HealingStarted { step_index, ai_validation_requested }) => {
            if *step_index != state.current_step_index {
                return Dispatch::ignored(state, "stale healing report");
            }
            let mut next = state;
            next.healing_info = Some(HealingInfo {
                in_progress: true,
                candidate_count: 0,
                best_score: 0.0,
                ai_validation_requested: *ai_validation_requested,
            });
            Dispatch::applied(next)
        }

        (
            Healing,
            SessionEvent::HealSuccess {
                step_index,
                confidence,
                healed_selector,
                candidates_evaluated,
            },
        ) => {
            if *step_index != state.current_step_index {
                return Dispatch::ignored(state, "stale healing report");
            }
            let mut next = state;
            let ai_validation_requested = next
                .healing_info
                .as_ref()
                .is_some_and(|healing| healing.ai_validation_requested);
            next.healing_info = Some(HealingInfo {
                in_progress: false,
                candidate_count: *candidates_evaluated,
                best_score: *confidence,
                ai_validation_requested,
            });
            let index = next.current_step_index;
            if let Some(selector) = healed_selector
                && let Some(step) = next.steps.get_mut(index)
            {
                step.healed_selector = Some(selector.clone());
            }
            Dispatch::applied(transition(next, WaitingAction))
        }

        (Healing, SessionEvent::HealFailed { step_index, reason }) => {
            if *step_index != state.current_step_index {
                return Dispatch::ignored(state, "stale healing report");
            }
            let mut next = state;
            if let Some(info) = next.healing_info.as_mut() {
                info.in_progress = false;
            }
            let index = next.current_step_index;
            Dispatch::applied(enter_error(
                next,
                ErrorKind::HealingFailed,
                reason
                    .clone()
                    .unwrap_or_else(|| "no candidate accepted".to_string()),
                Some(index),
            ))
        }

        (Transitioning, SessionEvent::NextStep) => {
            // A skip already advanced the index on its way here; showing
            // the current step is the advance in that case.
            if state.previous_state == Error {
                return Dispatch::applied(transition(state, ShowingStep));
            }
            if state.has_next_step() {
                let mut next = state;
                next.current_step_index += 1;
                Dispatch::applied(transition(next, ShowingStep))
            } else {
                Dispatch::applied(transition(state, Completed))
            }
        }

        (Transitioning, SessionEvent::PrevStep) => {
            if !state.has_prev_step() {
                return Dispatch::unhandled(state);
            }
            let mut next = state;
            next.current_step_index -= 1;
            Dispatch::applied(transition(next, ShowingStep))
        }

        (Navigating, SessionEvent::PageLoaded { tab_id }) => {
            if state.navigation.tab_id != Some(*tab_id) {
                return Dispatch::ignored(state, "load for unrelated tab");
            }
            let mut next = state;
            next.navigation.in_progress = false;
            Dispatch::applied(transition(next, ShowingStep))
        }

        (Navigating, SessionEvent::UrlChanged { tab_id, url }) => {
            // Redirect chain: stay in NAVIGATING, track the newest target
            // and restart the deadline clock.
            let mut next = state;
            next.navigation.tab_id = Some(*tab_id);
            next.navigation.target_url = Some(url.clone());
            next.navigation.started_at = Some(now);
            Dispatch::applied(transition(next, Navigating))
        }

        (Navigating, SessionEvent::ActionDetected { .. }) => {
            Dispatch::ignored(state, "action during navigation")
        }

        // A valid action can start a page load before the controller's
        // NEXT_STEP arrives; let the advance happen mid-navigation so
        // the loaded page shows the right step.
        (Navigating, SessionEvent::NextStep) => {
            if !state
                .completed_step_indexes
                .contains(&state.current_step_index)
            {
                return Dispatch::unhandled(state);
            }
            if state.has_next_step() {
                let mut next = state;
                next.current_step_index += 1;
                Dispatch::applied(transition(next, Navigating))
            } else {
                let mut next = state;
                next.navigation.in_progress = false;
                Dispatch::applied(transition(next, Completed))
            }
        }

        (Navigating, SessionEvent::NavigationTimeout) => {
            let mut next = state;
            next.navigation.in_progress = false;
            let index = next.current_step_index;
            Dispatch::applied(enter_error(
                next,
                ErrorKind::NavigationTimeout,
                "page did not load in time".to_string(),
                Some(index),
            ))
        }

        (Navigating, SessionEvent::JumpToStep { index }) => {
            let mut next = state;
            next.navigation.in_progress = false;
            jump_to(next, *index)
        }

        (Error, SessionEvent::Retry) => {
            if state.total_steps == 0 {
                // api_error before any steps loaded; nothing to re-show.
                return Dispatch::unhandled(state);
            }
            let mut next = state;
            next.error_info = None;
            Dispatch::applied(transition(next, ShowingStep))
        }

        (Error, SessionEvent::SkipStep) => {
            let mut next = state;
            next.error_info = None;
            if next.has_next_step() {
                next.current_step_index += 1;
                Dispatch::applied(transition(next, Transitioning))
            } else {
                Dispatch::applied(transition(next, Completed))
            }
        }

        _ => Dispatch::unhandled(state),
    }
}

fn transition(
    mut state: WalkthroughState,
    to: MachineState,
) -> WalkthroughState {
    state.previous_state = state.machine_state;
    state.machine_state = to;
    state
}

fn enter_error(
    state: WalkthroughState,
    kind: ErrorKind,
    message: String,
    step_index: Option<usize>,
) -> WalkthroughState {
    let mut next = state;
    next.error_info = Some(ErrorInfo {
        error_type: kind,
        message,
        step_index,
        retry_count: 0,
    });
    transition(next, MachineState::Error)
}

fn jump_to(state: WalkthroughState, index: usize) -> Dispatch {
    if index >= state.total_steps {
        return Dispatch::unhandled(state);
    }
    let mut next = state;
    next.current_step_index = index;
    next.error_info = None;
    next.healing_info = None;
    Dispatch::applied(transition(next, MachineState::ShowingStep))
}

/// URL_CHANGED from an active step state. If the current step is a
/// navigate step and the new URL satisfies its recorded destination, the
/// navigation *is* the action: the step completes and the index advances
/// before the NAVIGATING transition applies.
fn begin_navigation(
    state: WalkthroughState,
    tab_id: state::TabId,
    url: &str,
    now: u64,
) -> WalkthroughState {
    let mut next = state;

    let completes_navigate_step = match next.current_step() {
        Some(step) if step.action_type == ActionType::Navigate => {
            expected_navigate_url(step)
                .map(|expected| urls_match(url, &expected))
                .unwrap_or(false)
        }
        _ => false,
    };
    if completes_navigate_step {
        let index = next.current_step_index;
        next.mark_step_completed(index);
        next.reset_retries(index);
        if next.has_next_step() {
            next.current_step_index += 1;
        } else {
            // Last step was the navigation itself.
            return transition(next, MachineState::Completed);
        }
    }

    let source_url = next
        .navigation
        .target_url
        .take()
        .or_else(|| next.starting_url.clone());
    next.navigation = NavigationInfo {
        in_progress: true,
        tab_id: Some(tab_id),
        source_url,
        target_url: Some(url.to_string()),
        started_at: Some(now),
    };
    transition(next, MachineState::Navigating)
}

fn expected_navigate_url(step: &Step) -> Option<String> {
    if let Some(ActionData::Navigate {
        target_url: Some(url),
    }) = &step.action_data
    {
        return Some(url.clone());
    }
    step.page_context
        .as_ref()
        .map(|context| context.url.clone())
}
