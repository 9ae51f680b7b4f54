use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json as json;
use tokio::sync::broadcast;

use crate::machine::state::TabId;
use crate::workflow::SelectorKind;

pub mod cdp;
pub mod memory;

/// Browser-level happenings the coordinator side consumes. One merged
/// stream keeps the watcher loop a single `select!` arm.
#[derive(Clone, Debug)]
pub enum HostEvent {
    NavigationStarted {
        tab_id: TabId,
        url: String,
        main_frame: bool,
    },
    NavigationCompleted {
        tab_id: TabId,
    },
    NavigationFailed {
        tab_id: TabId,
        error: String,
    },
    TabClosed {
        tab_id: TabId,
    },
    AlarmFired {
        name: String,
    },
}

/// The coordinator-context surface of the browser host: session-scoped
/// storage, restart-surviving alarms, tab navigation, and the browser
/// event stream. No DOM access here.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    fn now_ms(&self) -> u64;

    async fn store_get(&self, key: &str) -> Result<Option<json::Value>>;
    async fn store_put(&self, key: &str, value: &json::Value) -> Result<()>;
    async fn store_delete(&self, key: &str) -> Result<()>;

    async fn arm_alarm(&self, name: &str, delay: Duration) -> Result<()>;
    async fn cancel_alarm(&self, name: &str) -> Result<()>;

    async fn navigate_tab(&self, tab_id: TabId, url: &str) -> Result<()>;
    async fn tab_url(&self, tab_id: TabId) -> Result<Option<String>>;

    fn host_events(&self) -> broadcast::Receiver<HostEvent>;
}

/// Page-context handle to an element. Everything in here is plain data;
/// the host keeps whatever live reference it needs behind `node_id`.
/// These never enter the persisted session state.
#[derive(Clone, Debug, PartialEq)]
pub struct ElementHandle {
    pub node_id: String,
    pub tag: String,
    pub text: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClipboardKind {
    Copy,
    Cut,
    Paste,
}

/// What the page should listen for while a step waits for the user.
#[derive(Clone, Debug, PartialEq)]
pub enum CaptureSpec {
    Click,
    InputCommit,
    SelectChange,
    /// Listener goes on the form, not the triggering control.
    Submit { form: ElementHandle },
    Clipboard(ClipboardKind),
}

/// User events as the page context observed them, already reduced to
/// plain data. `composed_path` is outermost-last and shadow-DOM safe.
#[derive(Clone, Debug)]
pub enum DomEvent {
    Click {
        node_id: String,
        composed_path: Vec<String>,
    },
    FocusIn {
        node_id: String,
        value: String,
    },
    FocusOut {
        node_id: String,
        value: String,
    },
    KeyDown {
        node_id: String,
        key: String,
        shift_key: bool,
        value: String,
        in_textarea: bool,
    },
    Change {
        node_id: String,
        value: String,
    },
    Submit {
        form_node_id: String,
    },
    Clipboard {
        kind: ClipboardKind,
        clipboard: Option<String>,
        selection: Option<String>,
    },
    /// The interceptor swallowed an off-target click.
    ClickBlocked {
        node_id: String,
    },
}

/// Recorded action replayed by the simulated-user driver.
#[derive(Clone, Debug)]
pub enum SimulatedAction {
    Click {
        element: ElementHandle,
    },
    TypeText {
        element: ElementHandle,
        text: String,
        press_enter: bool,
    },
    SelectOption {
        element: ElementHandle,
        value: String,
    },
    SubmitForm {
        form: ElementHandle,
    },
    Clipboard {
        element: ElementHandle,
        kind: ClipboardKind,
    },
    Navigate {
        url: String,
    },
}

/// The page-context surface: one implementation per participating tab.
#[async_trait]
pub trait PageDriver: Send + Sync + 'static {
    fn tab_id(&self) -> TabId;

    async fn current_url(&self) -> Result<String>;

    /// First match that is visible and interactable, or None. Multiple
    /// or hidden matches count as no match.
    async fn query(
        &self,
        kind: SelectorKind,
        selector: &str,
    ) -> Result<Option<ElementHandle>>;

    async fn form_ancestor(
        &self,
        element: &ElementHandle,
    ) -> Result<Option<ElementHandle>>;

    /// Current editable value: input/textarea value, or innerText for
    /// content-editable elements.
    async fn read_value(&self, element: &ElementHandle) -> Result<String>;

    /// Value of the focused editable descendant, if the user is already
    /// in the element when the step attaches.
    async fn focused_value_within(
        &self,
        element: &ElementHandle,
    ) -> Result<Option<String>>;

    /// Wires the page-side listeners for the capture spec. Returns false
    /// when nothing could be attached (submit step without a form).
    async fn begin_capture(
        &self,
        target: &ElementHandle,
        spec: &CaptureSpec,
    ) -> Result<bool>;

    async fn end_capture(&self) -> Result<()>;

    fn dom_events(&self) -> broadcast::Receiver<DomEvent>;

    /// Turns capture-phase click interception on or off. Interception
    /// stays on for the whole session, across step boundaries.
    async fn set_intercept_enabled(&self, enabled: bool) -> Result<()>;

    /// Updates the click interceptor's allowed target. None means no
    /// target is allowed right now (between steps); allow-marked
    /// elements always pass.
    async fn set_intercept_target(
        &self,
        element: Option<&ElementHandle>,
    ) -> Result<()>;

    /// Brief visual pulse on the target after a blocked click.
    async fn pulse(&self, element: &ElementHandle) -> Result<()>;

    async fn perform(&self, action: &SimulatedAction) -> Result<()>;
}

impl ClipboardKind {
    pub fn event_name(self) -> &'static str {
        match self {
            ClipboardKind::Copy => "copy",
            ClipboardKind::Cut => "cut",
            ClipboardKind::Paste => "paste",
        }
    }
}
