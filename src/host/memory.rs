use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json as json;
use tokio::sync::broadcast;

use crate::host::{
    CaptureSpec, ClipboardKind, DomEvent, ElementHandle, Host, HostEvent,
    PageDriver, SimulatedAction,
};
use crate::machine::state::TabId;
use crate::workflow::SelectorKind;

/// Deterministic in-process host: manual clock, scripted navigations,
/// and a toy DOM per tab. The integration suite drives walkthroughs
/// through it without a browser.
pub struct MemoryHost {
    now_ms: AtomicU64,
    inner: StdMutex<HostInner>,
    events: broadcast::Sender<HostEvent>,
}

struct HostInner {
    store: HashMap<String, json::Value>,
    alarms: HashMap<String, u64>,
    tab_urls: HashMap<TabId, String>,
    /// Navigations to these URLs start but never complete, for
    /// timeout scenarios.
    stalled: HashSet<String>,
    next_tab: TabId,
}

impl MemoryHost {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(MemoryHost {
            now_ms: AtomicU64::new(1_700_000_000_000),
            inner: StdMutex::new(HostInner {
                store: HashMap::new(),
                alarms: HashMap::new(),
                tab_urls: HashMap::new(),
                stalled: HashSet::new(),
                next_tab: 1,
            }),
            events,
        })
    }

    pub fn open_tab(&self, url: &str) -> TabId {
        let mut inner = self.inner.lock().unwrap();
        let tab_id = inner.next_tab;
        inner.next_tab += 1;
        inner.tab_urls.insert(tab_id, url.to_string());
        tab_id
    }

    pub fn close_tab(&self, tab_id: TabId) {
        self.inner.lock().unwrap().tab_urls.remove(&tab_id);
        let _ = self.events.send(HostEvent::TabClosed { tab_id });
    }

    /// Moves the clock forward and fires any alarm whose deadline
    /// passed.
    pub fn advance(&self, delta_ms: u64) {
        let now = self.now_ms.fetch_add(delta_ms, Ordering::SeqCst) + delta_ms;
        let due: Vec<String> = {
            let mut inner = self.inner.lock().unwrap();
            let due: Vec<String> = inner
                .alarms
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &due {
                inner.alarms.remove(name);
            }
            due
        };
        for name in due {
            let _ = self.events.send(HostEvent::AlarmFired { name });
        }
    }

    pub fn set_stalled(&self, url: &str) {
        self.inner.lock().unwrap().stalled.insert(url.to_string());
    }

    /// A user-initiated navigation as the browser would report it:
    /// main-frame start, then completion unless the URL is stalled.
    pub fn user_navigates(&self, tab_id: TabId, url: &str) {
        let _ = self.events.send(HostEvent::NavigationStarted {
            tab_id,
            url: url.to_string(),
            main_frame: true,
        });
        let stalled = self.inner.lock().unwrap().stalled.contains(url);
        if stalled {
            return;
        }
        self.finish_navigation(tab_id, url);
    }

    pub fn finish_navigation(&self, tab_id: TabId, url: &str) {
        self.inner
            .lock()
            .unwrap()
            .tab_urls
            .insert(tab_id, url.to_string());
        let _ = self.events.send(HostEvent::NavigationCompleted { tab_id });
    }

    pub fn fail_navigation(&self, tab_id: TabId, error: &str) {
        let _ = self.events.send(HostEvent::NavigationFailed {
            tab_id,
            error: error.to_string(),
        });
    }

    /// An iframe navigation; the watcher must ignore it.
    pub fn iframe_navigates(&self, tab_id: TabId, url: &str) {
        let _ = self.events.send(HostEvent::NavigationStarted {
            tab_id,
            url: url.to_string(),
            main_frame: false,
        });
    }

    pub fn stored_session(&self) -> Option<json::Value> {
        self.inner
            .lock()
            .unwrap()
            .store
            .get(crate::machine::state::SESSION_STATE_KEY)
            .cloned()
    }

    pub fn armed_alarm(&self, name: &str) -> Option<u64> {
        self.inner.lock().unwrap().alarms.get(name).copied()
    }

    /// Seeds the persisted store directly, for restart scenarios.
    pub fn seed_store(&self, key: &str, value: json::Value) {
        self.inner
            .lock()
            .unwrap()
            .store
            .insert(key.to_string(), value);
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    async fn store_get(&self, key: &str) -> Result<Option<json::Value>> {
        Ok(self.inner.lock().unwrap().store.get(key).cloned())
    }

    async fn store_put(&self, key: &str, value: &json::Value) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .store
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn store_delete(&self, key: &str) -> Result<()> {
        self.inner.lock().unwrap().store.remove(key);
        Ok(())
    }

    async fn arm_alarm(&self, name: &str, delay: Duration) -> Result<()> {
        let deadline = self.now_ms() + delay.as_millis() as u64;
        self.inner
            .lock()
            .unwrap()
            .alarms
            .insert(name.to_string(), deadline);
        Ok(())
    }

    async fn cancel_alarm(&self, name: &str) -> Result<()> {
        self.inner.lock().unwrap().alarms.remove(name);
        Ok(())
    }

    async fn navigate_tab(&self, tab_id: TabId, url: &str) -> Result<()> {
        if !self.inner.lock().unwrap().tab_urls.contains_key(&tab_id) {
            return Err(anyhow!("no such tab {}", tab_id));
        }
        self.user_navigates(tab_id, url);
        Ok(())
    }

    async fn tab_url(&self, tab_id: TabId) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().tab_urls.get(&tab_id).cloned())
    }

    fn host_events(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }
}

/// Scripted element in a [`MemoryPage`] document.
#[derive(Clone, Debug)]
pub struct FakeElement {
    pub node_id: String,
    pub tag: String,
    pub text: Option<String>,
    /// Selector strings this element answers to.
    pub selectors: Vec<String>,
    pub value: String,
    /// Ancestor node ids, innermost first; becomes the composed path.
    pub ancestors: Vec<String>,
    pub form: Option<String>,
    pub visible: bool,
    pub allow_marked: bool,
    pub focused: bool,
    pub textarea: bool,
}

impl FakeElement {
    pub fn new(node_id: &str, tag: &str) -> Self {
        FakeElement {
            node_id: node_id.to_string(),
            tag: tag.to_string(),
            text: None,
            selectors: Vec::new(),
            value: String::new(),
            ancestors: vec!["body".to_string(), "html".to_string()],
            form: None,
            visible: true,
            allow_marked: false,
            focused: false,
            textarea: false,
        }
    }

    pub fn selector(mut self, selector: &str) -> Self {
        self.selectors.push(selector.to_string());
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn value(mut self, value: &str) -> Self {
        self.value = value.to_string();
        self
    }

    pub fn in_form(mut self, form_id: &str) -> Self {
        self.form = Some(form_id.to_string());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn allow_marked(mut self) -> Self {
        self.allow_marked = true;
        self
    }

    pub fn focused(mut self) -> Self {
        self.focused = true;
        self
    }

    fn handle(&self) -> ElementHandle {
        ElementHandle {
            node_id: self.node_id.clone(),
            tag: self.tag.clone(),
            text: self.text.clone(),
        }
    }

    fn composed_path(&self) -> Vec<String> {
        let mut path = vec![self.node_id.clone()];
        path.extend(self.ancestors.iter().cloned());
        path
    }
}

struct PageDom {
    elements: Vec<FakeElement>,
    intercept_enabled: bool,
    intercept_target: Option<String>,
    capture: Option<(String, CaptureSpec)>,
    pulses: Vec<String>,
}

/// Toy document for one tab, implementing the page-context driver and
/// offering `user_*` methods for tests to play the human.
pub struct MemoryPage {
    tab_id: TabId,
    host: Arc<MemoryHost>,
    dom: StdMutex<PageDom>,
    events: broadcast::Sender<DomEvent>,
}

impl MemoryPage {
    pub fn new(host: Arc<MemoryHost>, tab_id: TabId) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(MemoryPage {
            tab_id,
            host,
            dom: StdMutex::new(PageDom {
                elements: Vec::new(),
                intercept_enabled: false,
                intercept_target: None,
                capture: None,
                pulses: Vec::new(),
            }),
            events,
        })
    }

    /// Replaces the document, as a navigation would.
    pub fn install_dom(&self, elements: Vec<FakeElement>) {
        let mut dom = self.dom.lock().unwrap();
        dom.elements = elements;
        dom.capture = None;
    }

    pub fn pulses(&self) -> Vec<String> {
        self.dom.lock().unwrap().pulses.clone()
    }

    pub fn capture_active(&self) -> bool {
        self.dom.lock().unwrap().capture.is_some()
    }

    pub fn intercept_target(&self) -> Option<String> {
        self.dom.lock().unwrap().intercept_target.clone()
    }

    fn element(&self, node_id: &str) -> Option<FakeElement> {
        self.dom
            .lock()
            .unwrap()
            .elements
            .iter()
            .find(|element| element.node_id == node_id)
            .cloned()
    }

    fn emit(&self, event: DomEvent) {
        let _ = self.events.send(event);
    }

    pub fn user_click(&self, node_id: &str) {
        let Some(element) = self.element(node_id) else {
            return;
        };
        let path = element.composed_path();
        let blocked = {
            let dom = self.dom.lock().unwrap();
            if !dom.intercept_enabled {
                false
            } else if element.allow_marked {
                false
            } else {
                match &dom.intercept_target {
                    Some(target) => !path.contains(target),
                    None => true,
                }
            }
        };
        if blocked {
            self.emit(DomEvent::ClickBlocked {
                node_id: node_id.to_string(),
            });
        } else {
            self.emit(DomEvent::Click {
                node_id: node_id.to_string(),
                composed_path: path,
            });
        }
    }

    pub fn user_focus(&self, node_id: &str) {
        let value = {
            let mut dom = self.dom.lock().unwrap();
            let mut value = None;
            for element in &mut dom.elements {
                element.focused = element.node_id == node_id;
                if element.focused {
                    value = Some(element.value.clone());
                }
            }
            value
        };
        if let Some(value) = value {
            self.emit(DomEvent::FocusIn {
                node_id: node_id.to_string(),
                value,
            });
        }
    }

    /// Sets the value without any commit event, as typing does.
    pub fn user_types(&self, node_id: &str, text: &str) {
        let mut dom = self.dom.lock().unwrap();
        for element in &mut dom.elements {
            if element.node_id == node_id {
                element.value = text.to_string();
            }
        }
    }

    pub fn user_blur(&self, node_id: &str) {
        let Some(element) = self.element(node_id) else {
            return;
        };
        {
            let mut dom = self.dom.lock().unwrap();
            for element in &mut dom.elements {
                if element.node_id == node_id {
                    element.focused = false;
                }
            }
        }
        self.emit(DomEvent::FocusOut {
            node_id: node_id.to_string(),
            value: element.value,
        });
    }

    pub fn user_presses_enter(&self, node_id: &str, shift: bool) {
        let Some(element) = self.element(node_id) else {
            return;
        };
        self.emit(DomEvent::KeyDown {
            node_id: node_id.to_string(),
            key: "Enter".to_string(),
            shift_key: shift,
            value: element.value,
            in_textarea: element.textarea,
        });
    }

    pub fn user_selects(&self, node_id: &str, value: &str) {
        {
            let mut dom = self.dom.lock().unwrap();
            for element in &mut dom.elements {
                if element.node_id == node_id {
                    element.value = value.to_string();
                }
            }
        }
        self.emit(DomEvent::Change {
            node_id: node_id.to_string(),
            value: value.to_string(),
        });
    }

    pub fn user_submits(&self, form_node_id: &str) {
        let armed = matches!(
            &self.dom.lock().unwrap().capture,
            Some((_, CaptureSpec::Submit { .. }))
        );
        // Without an armed form listener there is nothing to hear the
        // submission.
        if armed {
            self.emit(DomEvent::Submit {
                form_node_id: form_node_id.to_string(),
            });
        }
    }

    pub fn user_clipboard(
        &self,
        kind: ClipboardKind,
        clipboard: Option<&str>,
        selection: Option<&str>,
    ) {
        self.emit(DomEvent::Clipboard {
            kind,
            clipboard: clipboard.map(|text| text.to_string()),
            selection: selection.map(|text| text.to_string()),
        });
    }
}

#[async_trait]
impl PageDriver for MemoryPage {
    fn tab_id(&self) -> TabId {
        self.tab_id
    }

    async fn current_url(&self) -> Result<String> {
        self.host
            .tab_url(self.tab_id)
            .await?
            .ok_or_else(|| anyhow!("tab {} is gone", self.tab_id))
    }

    async fn query(
        &self,
        _kind: SelectorKind,
        selector: &str,
    ) -> Result<Option<ElementHandle>> {
        let dom = self.dom.lock().unwrap();
        let matches: Vec<&FakeElement> = dom
            .elements
            .iter()
            .filter(|element| {
                element.visible
                    && element.selectors.iter().any(|s| s == selector)
            })
            .collect();
        // A selector only wins when it pins down exactly one visible
        // element.
        match matches.as_slice() {
            [single] => Ok(Some(single.handle())),
            _ => Ok(None),
        }
    }

    async fn form_ancestor(
        &self,
        element: &ElementHandle,
    ) -> Result<Option<ElementHandle>> {
        let form_id = self
            .element(&element.node_id)
            .and_then(|element| element.form);
        Ok(form_id.and_then(|id| self.element(&id)).map(|form| form.handle()))
    }

    async fn read_value(&self, element: &ElementHandle) -> Result<String> {
        Ok(self
            .element(&element.node_id)
            .map(|element| element.value)
            .unwrap_or_default())
    }

    async fn focused_value_within(
        &self,
        element: &ElementHandle,
    ) -> Result<Option<String>> {
        let dom = self.dom.lock().unwrap();
        Ok(dom
            .elements
            .iter()
            .find(|candidate| {
                candidate.focused
                    && (candidate.node_id == element.node_id
                        || candidate
                            .ancestors
                            .contains(&element.node_id))
            })
            .map(|candidate| candidate.value.clone()))
    }

    async fn begin_capture(
        &self,
        target: &ElementHandle,
        spec: &CaptureSpec,
    ) -> Result<bool> {
        if let CaptureSpec::Submit { form } = spec
            && self.element(&form.node_id).is_none()
        {
            return Ok(false);
        }
        self.dom.lock().unwrap().capture =
            Some((target.node_id.clone(), spec.clone()));
        Ok(true)
    }

    async fn end_capture(&self) -> Result<()> {
        self.dom.lock().unwrap().capture = None;
        Ok(())
    }

    fn dom_events(&self) -> broadcast::Receiver<DomEvent> {
        self.events.subscribe()
    }

    async fn set_intercept_enabled(&self, enabled: bool) -> Result<()> {
        self.dom.lock().unwrap().intercept_enabled = enabled;
        Ok(())
    }

    async fn set_intercept_target(
        &self,
        element: Option<&ElementHandle>,
    ) -> Result<()> {
        self.dom.lock().unwrap().intercept_target =
            element.map(|element| element.node_id.clone());
        Ok(())
    }

    async fn pulse(&self, element: &ElementHandle) -> Result<()> {
        self.dom
            .lock()
            .unwrap()
            .pulses
            .push(element.node_id.clone());
        Ok(())
    }

    async fn perform(&self, action: &SimulatedAction) -> Result<()> {
        match action {
            SimulatedAction::Click { element } => {
                self.user_click(&element.node_id);
            }
            SimulatedAction::TypeText {
                element,
                text,
                press_enter,
            } => {
                self.user_focus(&element.node_id);
                self.user_types(&element.node_id, text);
                if *press_enter {
                    self.user_presses_enter(&element.node_id, false);
                } else {
                    self.user_blur(&element.node_id);
                }
            }
            SimulatedAction::SelectOption { element, value } => {
                self.user_selects(&element.node_id, value);
            }
            SimulatedAction::SubmitForm { form } => {
                self.user_submits(&form.node_id);
            }
            SimulatedAction::Clipboard { element, kind } => {
                let value = self.read_value(element).await?;
                self.user_clipboard(*kind, Some(&value), None);
            }
            SimulatedAction::Navigate { url } => {
                self.host.user_navigates(self.tab_id, url);
            }
        }
        Ok(())
    }
}
