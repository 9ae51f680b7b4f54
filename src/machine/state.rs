use serde::{Deserialize, Serialize};

use crate::workflow::Step;

pub type TabId = u32;

/// Key under which the coordinator persists the session state. Presence
/// of the key means a session is in flight; absence means IDLE.
pub const SESSION_STATE_KEY: &str = "walkthrough_session_v2";

/// Name of the host alarm backing the navigation deadline.
pub const NAVIGATION_TIMEOUT_ALARM: &str = "walkthrough-navigation-timeout";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineState {
    Idle,
    Initializing,
    Navigating,
    ShowingStep,
    WaitingAction,
    Healing,
    Transitioning,
    Error,
    Completed,
}

impl MachineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MachineState::Idle | MachineState::Completed)
    }
}

/// The single mutable entity of a walkthrough session. Owned by the
/// coordinator, serialized to the session store after every change, and
/// broadcast to page controllers as an immutable snapshot.
///
/// Everything in here is plain data; element handles stay in the page
/// controller and never enter this object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkthroughState {
    pub session_id: Option<String>,
    pub machine_state: MachineState,
    pub previous_state: MachineState,

    pub workflow_id: Option<String>,
    pub workflow_name: Option<String>,
    pub starting_url: Option<String>,
    pub steps: Vec<Step>,
    pub total_steps: usize,

    pub current_step_index: usize,
    /// Ordered, duplicate-free. Set semantics enforced on insert.
    pub completed_step_indexes: Vec<usize>,

    pub error_info: Option<ErrorInfo>,
    pub healing_info: Option<HealingInfo>,
    pub navigation: NavigationInfo,
    pub tabs: TabSet,
    pub timing: Timing,
    /// Per-step user-action retry counts, keyed by step index. Lives in
    /// state so it survives coordinator restart.
    #[serde(default)]
    pub step_retries: Vec<(usize, u32)>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub error_type: ErrorKind,
    pub message: String,
    pub step_index: Option<usize>,
    pub retry_count: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ElementNotFound,
    NavigationTimeout,
    HealingFailed,
    ApiError,
    ActionInvalid,
}

impl ErrorKind {
    /// api_error during INITIALIZING cannot be retried; the only offer
    /// to the user is EXIT.
    pub fn is_terminal(self) -> bool {
        matches!(self, ErrorKind::ApiError)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingInfo {
    pub in_progress: bool,
    pub candidate_count: u32,
    pub best_score: f64,
    pub ai_validation_requested: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationInfo {
    pub in_progress: bool,
    pub tab_id: Option<TabId>,
    pub source_url: Option<String>,
    pub target_url: Option<String>,
    pub started_at: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabSet {
    pub primary_tab_id: Option<TabId>,
    pub active_tab_ids: Vec<TabId>,
    pub ready_tab_ids: Vec<TabId>,
}

impl TabSet {
    pub fn add_active(&mut self, tab_id: TabId) {
        if !self.active_tab_ids.contains(&tab_id) {
            self.active_tab_ids.push(tab_id);
        }
    }

    pub fn add_ready(&mut self, tab_id: TabId) {
        self.add_active(tab_id);
        if !self.ready_tab_ids.contains(&tab_id) {
            self.ready_tab_ids.push(tab_id);
        }
    }

    pub fn remove(&mut self, tab_id: TabId) {
        self.active_tab_ids.retain(|id| *id != tab_id);
        self.ready_tab_ids.retain(|id| *id != tab_id);
    }
}

/// Epoch-millisecond timestamps. Zero means not started.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    pub session_started_at: u64,
    pub last_activity_at: u64,
    pub expires_at: u64,
}

impl Default for WalkthroughState {
    fn default() -> Self {
        WalkthroughState::idle()
    }
}

impl WalkthroughState {
    pub fn idle() -> Self {
        WalkthroughState {
            session_id: None,
            machine_state: MachineState::Idle,
            previous_state: MachineState::Idle,
            workflow_id: None,
            workflow_name: None,
            starting_url: None,
            steps: Vec::new(),
            total_steps: 0,
            current_step_index: 0,
            completed_step_indexes: Vec::new(),
            error_info: None,
            healing_info: None,
            navigation: NavigationInfo::default(),
            tabs: TabSet::default(),
            timing: Timing::default(),
            step_retries: Vec::new(),
        }
    }

    /// Factory reset, keeping the session id around for the final log
    /// entry of the session that just ended.
    pub fn reset_keeping_session_id(&self) -> Self {
        WalkthroughState {
            session_id: self.session_id.clone(),
            previous_state: self.machine_state,
            ..WalkthroughState::idle()
        }
    }

    pub fn is_active(&self) -> bool {
        self.machine_state != MachineState::Idle
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.current_step_index)
    }

    pub fn has_next_step(&self) -> bool {
        self.total_steps > 0 && self.current_step_index + 1 < self.total_steps
    }

    pub fn has_prev_step(&self) -> bool {
        self.current_step_index > 0
    }

    pub fn mark_step_completed(&mut self, index: usize) {
        if index < self.total_steps
            && !self.completed_step_indexes.contains(&index)
        {
            self.completed_step_indexes.push(index);
        }
    }

    pub fn retries_for(&self, index: usize) -> u32 {
        self.step_retries
            .iter()
            .find(|(step, _)| *step == index)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    pub fn bump_retries(&mut self, index: usize) -> u32 {
        for (step, count) in &mut self.step_retries {
            if *step == index {
                *count += 1;
                return *count;
            }
        }
        self.step_retries.push((index, 1));
        1
    }

    pub fn reset_retries(&mut self, index: usize) {
        self.step_retries.retain(|(step, _)| *step != index);
    }

    pub fn touch(&mut self, now: u64, session_timeout_ms: u64) {
        self.timing.last_activity_at = now;
        self.timing.expires_at = now + session_timeout_ms;
    }

    /// Checks the structural invariants that must hold after every
    /// transition. Used by tests and debug assertions, not control flow.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.machine_state == MachineState::Idle {
            if self.total_steps != 0
                || !self.steps.is_empty()
                || self.workflow_id.is_some()
                || self.navigation.in_progress
                || self.tabs.primary_tab_id.is_some()
            {
                return Err("IDLE state carries session data".into());
            }
        }
        if self.total_steps > 0 && self.current_step_index >= self.total_steps
        {
            return Err(format!(
                "step index {} out of range 0..{}",
                self.current_step_index, self.total_steps
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for index in &self.completed_step_indexes {
            if *index >= self.total_steps {
                return Err(format!("completed index {} out of range", index));
            }
            if !seen.insert(index) {
                return Err(format!("duplicate completed index {}", index));
            }
        }
        for ready in &self.tabs.ready_tab_ids {
            if !self.tabs.active_tab_ids.contains(ready) {
                return Err(format!("ready tab {} not active", ready));
            }
        }
        if self.is_active()
            && let Some(primary) = self.tabs.primary_tab_id
            && !self.tabs.active_tab_ids.contains(&primary)
        {
            return Err(format!("primary tab {} not active", primary));
        }
        if self.navigation.in_progress {
            if self.machine_state != MachineState::Navigating {
                return Err("navigation in progress outside NAVIGATING".into());
            }
            if self.navigation.tab_id.is_none()
                || self.navigation.target_url.is_none()
                || self.navigation.started_at.is_none()
            {
                return Err("navigation in progress with null fields".into());
            }
        }
        if self.machine_state == MachineState::Healing
            && !self.healing_info.as_ref().is_some_and(|h| h.in_progress)
        {
            return Err("HEALING without healingInfo.inProgress".into());
        }
        if self.timing.expires_at < self.timing.last_activity_at {
            return Err("expiresAt before lastActivityAt".into());
        }
        Ok(())
    }
}
