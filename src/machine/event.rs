use serde::{Deserialize, Serialize};

use crate::machine::state::TabId;
use crate::workflow::{ActionType, Workflow};

/// Everything that can drive the session machine. Events carry plain
/// data only; they are serializable so the trigger of every broadcast
/// and trace entry can be named on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEvent {
    Start {
        session_id: String,
        workflow_id: String,
        tab_id: TabId,
    },
    DataLoaded {
        workflow: Workflow,
    },
    InitFailed {
        message: String,
    },
    Exit {
        #[serde(default)]
        reason: Option<String>,
    },

    NextStep,
    PrevStep,
    JumpToStep {
        index: usize,
    },
    Retry,
    SkipStep,

    ElementFound {
        step_index: usize,
    },
    ElementNotFound {
        step_index: usize,
    },

    ActionDetected {
        step_index: usize,
        action_type: ActionType,
        #[serde(default)]
        value: Option<String>,
    },
    ActionInvalid {
        step_index: usize,
        reason: String,
    },

    HealingStarted {
        step_index: usize,
        #[serde(default)]
        ai_validation_requested: bool,
    },
    HealSuccess {
        step_index: usize,
        confidence: f64,
        #[serde(default)]
        healed_selector: Option<String>,
        #[serde(default)]
        candidates_evaluated: u32,
    },
    HealFailed {
        step_index: usize,
        #[serde(default)]
        reason: Option<String>,
    },

    UrlChanged {
        tab_id: TabId,
        url: String,
    },
    PageLoaded {
        tab_id: TabId,
    },
    NavigationTimeout,

    TabReady {
        tab_id: TabId,
        url: String,
    },
    TabClosed {
        tab_id: TabId,
    },
}

impl SessionEvent {
    /// Wire name of the event, used as the `trigger` of broadcasts and
    /// in trace entries.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Start { .. } => "START",
            SessionEvent::DataLoaded { .. } => "DATA_LOADED",
            SessionEvent::InitFailed { .. } => "INIT_FAILED",
            SessionEvent::Exit { .. } => "EXIT",
            SessionEvent::NextStep => "NEXT_STEP",
            SessionEvent::PrevStep => "PREV_STEP",
            SessionEvent::JumpToStep { .. } => "JUMP_TO_STEP",
            SessionEvent::Retry => "RETRY",
            SessionEvent::SkipStep => "SKIP_STEP",
            SessionEvent::ElementFound { .. } => "ELEMENT_FOUND",
            SessionEvent::ElementNotFound { .. } => "ELEMENT_NOT_FOUND",
            SessionEvent::ActionDetected { .. } => "ACTION_DETECTED",
            SessionEvent::ActionInvalid { .. } => "ACTION_INVALID",
            SessionEvent::HealingStarted { .. } => "HEALING_STARTED",
            SessionEvent::HealSuccess { .. } => "HEAL_SUCCESS",
            SessionEvent::HealFailed { .. } => "HEAL_FAILED",
            SessionEvent::UrlChanged { .. } => "URL_CHANGED",
            SessionEvent::PageLoaded { .. } => "PAGE_LOADED",
            SessionEvent::NavigationTimeout => "NAVIGATION_TIMEOUT",
            SessionEvent::TabReady { .. } => "TAB_READY",
            SessionEvent::TabClosed { .. } => "TAB_CLOSED",
        }
    }
}
