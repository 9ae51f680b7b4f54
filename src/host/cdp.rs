use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chromiumoxide::browser::{BrowserConfig, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::{input, page, target};
use chromiumoxide::Page;
use futures::{StreamExt, stream};
use include_dir::{Dir, include_dir};
use serde::Deserialize;
use serde_json as json;
use tokio::sync::broadcast;
use tokio::time::sleep;
use url::Url;

use crate::host::{
    CaptureSpec, ClipboardKind, DomEvent, ElementHandle, Host, HostEvent,
    PageDriver, SimulatedAction,
};
use crate::machine::state::TabId;
use crate::workflow::SelectorKind;

static SCRIPTS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/scripts");

/// The CLI drives a single tab; the browser-side id for it.
pub const PRIMARY_TAB: TabId = 1;

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(150);

#[derive(Clone)]
pub struct LaunchOptions {
    pub headless: bool,
    pub no_sandbox: bool,
    pub user_data_directory: PathBuf,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone)]
pub enum DebuggerOptions {
    /// Attach to an already-running browser over its devtools socket.
    External { remote_debugger: Url },
    Managed { launch_options: LaunchOptions },
}

/// Coordinator-context host over a live Chromium. Session storage and
/// alarms are process-local: the browser session and this process live
/// and die together in the CLI.
pub struct CdpHost {
    page: Arc<Page>,
    browser: StdMutex<Option<chromiumoxide::Browser>>,
    store: StdMutex<HashMap<String, json::Value>>,
    /// name → generation; a sleep task only fires if its generation is
    /// still the armed one.
    alarms: Arc<StdMutex<HashMap<String, u64>>>,
    alarm_seq: StdMutex<u64>,
    events: broadcast::Sender<HostEvent>,
}

impl CdpHost {
    /// Launches (or attaches to) a browser and wires its event streams
    /// into the host event channel. Returns the host and the page
    /// driver for the primary tab.
    pub async fn launch(
        debugger_options: DebuggerOptions,
    ) -> Result<(Arc<CdpHost>, Arc<CdpPage>)> {
        let (mut browser, mut handler) = match &debugger_options {
            DebuggerOptions::External { remote_debugger } => {
                chromiumoxide::Browser::connect(remote_debugger.as_str())
                    .await?
            }
            DebuggerOptions::Managed { launch_options } => {
                let config = walkthrough_browser_config(launch_options)?;
                chromiumoxide::Browser::launch(config).await?
            }
        };

        tokio::spawn(async move {
            loop {
                if handler.next().await.is_none() {
                    break;
                }
            }
        });

        let page = match &debugger_options {
            DebuggerOptions::Managed { .. } => Arc::new(
                browser
                    .new_page("about:blank")
                    .await
                    .context("could not create page target")?,
            ),
            DebuggerOptions::External { .. } => {
                Arc::new(attach_to_primary_tab(&mut browser).await?)
            }
        };

        let (events, _) = broadcast::channel(256);
        let host = Arc::new(CdpHost {
            page: page.clone(),
            browser: StdMutex::new(Some(browser)),
            store: StdMutex::new(HashMap::new()),
            alarms: Arc::new(StdMutex::new(HashMap::new())),
            alarm_seq: StdMutex::new(0),
            events: events.clone(),
        });

        spawn_event_pump(page.clone(), events.clone()).await?;

        let driver = CdpPage::new(page);
        Ok((host, driver))
    }

    pub async fn terminate(&self) -> Result<()> {
        let browser = self.browser.lock().unwrap().take();
        // Dropping the browser reaps the Chrome process; close() logs a
        // spurious websocket error.
        drop(browser);
        Ok(())
    }
}

#[async_trait]
impl Host for CdpHost {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }

    async fn store_get(&self, key: &str) -> Result<Option<json::Value>> {
        Ok(self.store.lock().unwrap().get(key).cloned())
    }

    async fn store_put(&self, key: &str, value: &json::Value) -> Result<()> {
        self.store
            .lock()
            .unwrap()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn store_delete(&self, key: &str) -> Result<()> {
        self.store.lock().unwrap().remove(key);
        Ok(())
    }

    async fn arm_alarm(&self, name: &str, delay: Duration) -> Result<()> {
        let generation = {
            let mut seq = self.alarm_seq.lock().unwrap();
            *seq += 1;
            *seq
        };
        self.alarms
            .lock()
            .unwrap()
            .insert(name.to_string(), generation);

        let name = name.to_string();
        let events = self.events.clone();
        let alarms = self.alarms.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let still_armed = {
                let mut alarms = alarms.lock().unwrap();
                if alarms.get(&name) == Some(&generation) {
                    alarms.remove(&name);
                    true
                } else {
                    false
                }
            };
            if still_armed {
                let _ = events.send(HostEvent::AlarmFired { name });
            }
        });
        Ok(())
    }

    async fn cancel_alarm(&self, name: &str) -> Result<()> {
        self.alarms.lock().unwrap().remove(name);
        Ok(())
    }

    async fn navigate_tab(&self, tab_id: TabId, url: &str) -> Result<()> {
        if tab_id != PRIMARY_TAB {
            bail!("unknown tab {}", tab_id);
        }
        let page = self.page.clone();
        let url = url.to_string();
        // goto blocks until load; fire it off so navigation events keep
        // flowing through the pump meanwhile.
        tokio::spawn(async move {
            if let Err(error) = page.goto(url.clone()).await {
                log::warn!("goto {} failed: {}", url, error);
            }
        });
        Ok(())
    }

    async fn tab_url(&self, tab_id: TabId) -> Result<Option<String>> {
        if tab_id != PRIMARY_TAB {
            return Ok(None);
        }
        match eval::<String>(&self.page, "window.location.href".to_string())
            .await
        {
            Ok(url) => Ok(Some(url)),
            Err(error) => {
                log::debug!("location lookup failed: {}", error);
                Ok(None)
            }
        }
    }

    fn host_events(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }
}

async fn spawn_event_pump(
    page: Arc<Page>,
    events: broadcast::Sender<HostEvent>,
) -> Result<()> {
    type HostEventStream =
        Pin<Box<dyn stream::Stream<Item = HostEvent> + Send>>;

    let main_frame = page
        .mainframe()
        .await?
        .ok_or_else(|| anyhow!("no main frame available"))?;

    let frame_for_requested = main_frame.clone();
    let events_requested = Box::pin(
        page.event_listener::<page::EventFrameRequestedNavigation>()
            .await?
            .map(move |event| HostEvent::NavigationStarted {
                tab_id: PRIMARY_TAB,
                url: event.url.clone(),
                main_frame: event.frame_id == frame_for_requested,
            }),
    ) as HostEventStream;

    let frame_for_navigated = main_frame.clone();
    let events_navigated = Box::pin(
        page.event_listener::<page::EventFrameNavigated>()
            .await?
            .map(move |event| HostEvent::NavigationStarted {
                tab_id: PRIMARY_TAB,
                url: event.frame.url.clone(),
                main_frame: event.frame.id == frame_for_navigated,
            }),
    ) as HostEventStream;

    let events_loaded = Box::pin(
        page.event_listener::<page::EventLoadEventFired>()
            .await?
            .map(|_| HostEvent::NavigationCompleted {
                tab_id: PRIMARY_TAB,
            }),
    ) as HostEventStream;

    let page_target = page.target_id().clone();
    let events_destroyed = Box::pin(
        page.event_listener::<target::EventTargetDestroyed>()
            .await?
            .filter_map(move |event| {
                let closed = event.target_id == page_target;
                async move {
                    closed.then_some(HostEvent::TabClosed {
                        tab_id: PRIMARY_TAB,
                    })
                }
            }),
    ) as HostEventStream;

    let mut merged = stream::select_all(vec![
        events_requested,
        events_navigated,
        events_loaded,
        events_destroyed,
    ]);

    tokio::spawn(async move {
        while let Some(event) = merged.next().await {
            if events.send(event).is_err() {
                break;
            }
        }
        log::debug!("browser event pump finished");
    });

    Ok(())
}

/// Page driver over the injected agent script: element queries, DOM
/// event capture, interception, and simulated input.
pub struct CdpPage {
    page: Arc<Page>,
    events: broadcast::Sender<DomEvent>,
    poller: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Debug, Deserialize)]
struct AgentElement {
    id: String,
    tag: String,
    text: Option<String>,
}

impl AgentElement {
    fn into_handle(self) -> ElementHandle {
        ElementHandle {
            node_id: self.id,
            tag: self.tag,
            text: self.text,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentEvent {
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
        kind: String,
        clipboard: Option<String>,
        selection: Option<String>,
    },
    ClickBlocked {
        node_id: String,
    },
}

impl AgentEvent {
    fn into_dom_event(self) -> Option<DomEvent> {
        Some(match self {
            AgentEvent::Click {
                node_id,
                composed_path,
            } => DomEvent::Click {
                node_id,
                composed_path,
            },
            AgentEvent::FocusIn { node_id, value } => {
                DomEvent::FocusIn { node_id, value }
            }
            AgentEvent::FocusOut { node_id, value } => {
                DomEvent::FocusOut { node_id, value }
            }
            AgentEvent::KeyDown {
                node_id,
                key,
                shift_key,
                value,
                in_textarea,
            } => DomEvent::KeyDown {
                node_id,
                key,
                shift_key,
                value,
                in_textarea,
            },
            AgentEvent::Change { node_id, value } => {
                DomEvent::Change { node_id, value }
            }
            AgentEvent::Submit { form_node_id } => {
                DomEvent::Submit { form_node_id }
            }
            AgentEvent::Clipboard {
                kind,
                clipboard,
                selection,
            } => DomEvent::Clipboard {
                kind: match kind.as_str() {
                    "copy" => ClipboardKind::Copy,
                    "cut" => ClipboardKind::Cut,
                    "paste" => ClipboardKind::Paste,
                    _ => return None,
                },
                clipboard,
                selection,
            },
            AgentEvent::ClickBlocked { node_id } => {
                DomEvent::ClickBlocked { node_id }
            }
        })
    }
}

impl CdpPage {
    fn new(page: Arc<Page>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let driver = Arc::new(CdpPage {
            page: page.clone(),
            events: events.clone(),
            poller: StdMutex::new(None),
        });

        let poll_page = page;
        let handle = tokio::spawn(async move {
            loop {
                sleep(EVENT_POLL_INTERVAL).await;
                let drained: Result<Vec<AgentEvent>> =
                    eval(&poll_page, agent_call("__waymark.drain()")).await;
                match drained {
                    Ok(drained) => {
                        for event in drained {
                            if let Some(event) = event.into_dom_event() {
                                let _ = events.send(event);
                            }
                        }
                    }
                    Err(error) => {
                        // Navigation teardown makes this routine.
                        log::trace!("drain failed: {}", error);
                    }
                }
            }
        });
        *driver.poller.lock().unwrap() = Some(handle);
        driver
    }
}

impl Drop for CdpPage {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.lock().unwrap().take() {
            poller.abort();
        }
    }
}

fn agent_source() -> &'static str {
    SCRIPTS_DIR
        .get_file("page_agent.js")
        .expect("page_agent.js embedded at build time")
        .contents_utf8()
        .expect("page_agent.js is utf-8")
}

/// Prefixes the agent install (idempotent) so calls survive fresh
/// documents.
fn agent_call(call: &str) -> String {
    format!("{}\n{}", agent_source(), call)
}

async fn eval<Output: serde::de::DeserializeOwned>(
    page: &Page,
    expression: String,
) -> Result<Output> {
    let result = page
        .evaluate_expression(expression)
        .await
        .map_err(|error| anyhow!("evaluate failed: {}", error))?;
    result
        .into_value::<Output>()
        .map_err(|error| anyhow!("evaluate result mismatch: {}", error))
}

async fn eval_unit(page: &Page, expression: String) -> Result<()> {
    page.evaluate_expression(format!("void ({})", expression))
        .await
        .map_err(|error| anyhow!("evaluate failed: {}", error))?;
    Ok(())
}

#[async_trait]
impl PageDriver for CdpPage {
    fn tab_id(&self) -> TabId {
        PRIMARY_TAB
    }

    async fn current_url(&self) -> Result<String> {
        eval(&self.page, "window.location.href".to_string()).await
    }

    async fn query(
        &self,
        kind: SelectorKind,
        selector: &str,
    ) -> Result<Option<ElementHandle>> {
        let kind = match kind {
            SelectorKind::Css => "css",
            SelectorKind::XPath => "xpath",
        };
        let call = agent_call(&format!(
            "__waymark.find({}, {})",
            json::to_string(kind)?,
            json::to_string(selector)?,
        ));
        let found: Option<AgentElement> = eval(&self.page, call).await?;
        Ok(found.map(AgentElement::into_handle))
    }

    async fn form_ancestor(
        &self,
        element: &ElementHandle,
    ) -> Result<Option<ElementHandle>> {
        let call = agent_call(&format!(
            "__waymark.formAncestor({})",
            json::to_string(&element.node_id)?
        ));
        let found: Option<AgentElement> = eval(&self.page, call).await?;
        Ok(found.map(AgentElement::into_handle))
    }

    async fn read_value(&self, element: &ElementHandle) -> Result<String> {
        let call = agent_call(&format!(
            "__waymark.readValue({})",
            json::to_string(&element.node_id)?
        ));
        eval(&self.page, call).await
    }

    async fn focused_value_within(
        &self,
        element: &ElementHandle,
    ) -> Result<Option<String>> {
        let call = agent_call(&format!(
            "__waymark.focusedValueWithin({})",
            json::to_string(&element.node_id)?
        ));
        eval(&self.page, call).await
    }

    async fn begin_capture(
        &self,
        target: &ElementHandle,
        spec: &CaptureSpec,
    ) -> Result<bool> {
        let spec = match spec {
            CaptureSpec::Click => json::json!({"type": "click"}),
            CaptureSpec::InputCommit => json::json!({"type": "input_commit"}),
            CaptureSpec::SelectChange => {
                json::json!({"type": "select_change"})
            }
            CaptureSpec::Submit { form } => {
                json::json!({"type": "submit", "form": form.node_id})
            }
            CaptureSpec::Clipboard(kind) => {
                json::json!({"type": "clipboard", "event": kind.event_name()})
            }
        };
        let call = agent_call(&format!(
            "__waymark.beginCapture({}, {})",
            json::to_string(&target.node_id)?,
            spec,
        ));
        eval(&self.page, call).await
    }

    async fn end_capture(&self) -> Result<()> {
        eval_unit(&self.page, agent_call("__waymark.endCapture()")).await
    }

    fn dom_events(&self) -> broadcast::Receiver<DomEvent> {
        self.events.subscribe()
    }

    async fn set_intercept_enabled(&self, enabled: bool) -> Result<()> {
        let call = agent_call(&format!(
            "__waymark.setInterceptEnabled({})",
            enabled
        ));
        eval_unit(&self.page, call).await
    }

    async fn set_intercept_target(
        &self,
        element: Option<&ElementHandle>,
    ) -> Result<()> {
        let id = match element {
            Some(element) => json::to_string(&element.node_id)?,
            None => "null".to_string(),
        };
        let call =
            agent_call(&format!("__waymark.setInterceptTarget({})", id));
        eval_unit(&self.page, call).await
    }

    async fn pulse(&self, element: &ElementHandle) -> Result<()> {
        let call = agent_call(&format!(
            "__waymark.pulse({})",
            json::to_string(&element.node_id)?
        ));
        eval_unit(&self.page, call).await
    }

    async fn perform(&self, action: &SimulatedAction) -> Result<()> {
        match action {
            SimulatedAction::Click { element } => {
                let call = agent_call(&format!(
                    "__waymark.clickEl({})",
                    json::to_string(&element.node_id)?
                ));
                eval_unit(&self.page, call).await?;
            }
            SimulatedAction::TypeText {
                element,
                text,
                press_enter,
            } => {
                let call = agent_call(&format!(
                    "__waymark.focusEl({})",
                    json::to_string(&element.node_id)?
                ));
                eval_unit(&self.page, call).await?;
                for char in text.chars() {
                    sleep(Duration::from_millis(15)).await;
                    self.page
                        .execute(input::InsertTextParams::new(char))
                        .await?;
                }
                if *press_enter {
                    dispatch_enter(&self.page).await?;
                } else {
                    let call = agent_call(&format!(
                        "__waymark.blurEl({})",
                        json::to_string(&element.node_id)?
                    ));
                    eval_unit(&self.page, call).await?;
                }
            }
            SimulatedAction::SelectOption { element, value } => {
                let call = agent_call(&format!(
                    "__waymark.selectValue({}, {})",
                    json::to_string(&element.node_id)?,
                    json::to_string(value)?,
                ));
                eval_unit(&self.page, call).await?;
            }
            SimulatedAction::SubmitForm { form } => {
                let call = agent_call(&format!(
                    "__waymark.submitForm({})",
                    json::to_string(&form.node_id)?
                ));
                eval_unit(&self.page, call).await?;
            }
            SimulatedAction::Clipboard { element, kind } => {
                let call = agent_call(&format!(
                    "__waymark.clipboardAction({}, {})",
                    json::to_string(&element.node_id)?,
                    json::to_string(kind.event_name())?,
                ));
                eval_unit(&self.page, call).await?;
            }
            SimulatedAction::Navigate { url } => {
                let page = self.page.clone();
                let url = url.clone();
                tokio::spawn(async move {
                    if let Err(error) = page.goto(url.clone()).await {
                        log::warn!("goto {} failed: {}", url, error);
                    }
                });
            }
        }
        Ok(())
    }
}

/// Trusted Enter press for the simulated user. Only the keydown matters
/// to the action detector (and to sites that submit on Enter); the
/// paired keyup keeps the page's own key handlers balanced.
async fn dispatch_enter(page: &Page) -> Result<()> {
    use input::DispatchKeyEventType::{KeyDown, KeyUp};
    for event_type in [KeyDown, KeyUp] {
        let event = input::DispatchKeyEventParams::builder()
            .r#type(event_type)
            .key("Enter")
            .code("Enter")
            .windows_virtual_key_code(13)
            .build()
            .map_err(|error| anyhow!(error))?;
        page.execute(event).await?;
    }
    Ok(())
}

/// Browser configuration for a coached session. Headed unless asked
/// otherwise, and with first-run chrome suppressed so nothing competes
/// with the walkthrough overlay for the user's attention.
fn walkthrough_browser_config(
    launch_options: &LaunchOptions,
) -> Result<BrowserConfig> {
    let headless_mode = if launch_options.headless {
        HeadlessMode::New
    } else {
        HeadlessMode::False
    };
    let mut builder = BrowserConfig::builder()
        .headless_mode(headless_mode)
        .window_size(launch_options.width, launch_options.height)
        .user_data_dir(launch_options.user_data_directory.clone())
        .args(["--no-first-run", "--no-default-browser-check"]);
    if launch_options.no_sandbox {
        builder = builder.no_sandbox();
    }
    builder.build().map_err(|message| anyhow!(message))
}

/// Attach mode. A session coaches exactly one primary tab, so the
/// browser being attached must have exactly one page open.
async fn attach_to_primary_tab(
    browser: &mut chromiumoxide::Browser,
) -> Result<Page> {
    let targets = browser.fetch_targets().await?;
    let mut tabs = targets.iter().filter(|target| target.r#type == "page");
    let tab = tabs
        .next()
        .ok_or_else(|| anyhow!("no open tab to run the walkthrough in"))?;
    if tabs.next().is_some() {
        bail!(
            "several tabs are open; close all but the one the walkthrough \
             should run in"
        );
    }

    // The target listing can run ahead of the page handle becoming
    // available; give it a moment to catch up.
    let mut last_error = None;
    for _ in 0..3 {
        match browser.get_page(tab.target_id.clone()).await {
            Ok(page) => return Ok(page),
            Err(error) => last_error = Some(error),
        }
        sleep(Duration::from_millis(250)).await;
    }
    bail!("tab {} never became attachable: {:?}", tab.url, last_error)
}
