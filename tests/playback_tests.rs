use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use indoc::indoc;
use tokio::sync::broadcast;

use waymark::config::PlaybackConfig;
use waymark::coordinator::Coordinator;
use waymark::healing::{
    HealContext, HealDecision, Healer, HealingResult, NoHealer, Resolution,
    decide,
};
use waymark::host::memory::{FakeElement, MemoryHost, MemoryPage};
use waymark::host::{ElementHandle, Host, PageDriver};
use waymark::machine::state::{
    ErrorKind, MachineState, NAVIGATION_TIMEOUT_ALARM, SESSION_STATE_KEY,
    TabId,
};
use waymark::machine::{SessionEvent, WalkthroughState, dispatch};
use waymark::messaging::StateChanged;
use waymark::navigation::NavigationWatcher;
use waymark::router::StepRouter;
use waymark::runner::{Session, SessionOptions};
use waymark::ui::{
    ErrorChoice, HealConfirmation, WalkthroughUi,
};
use waymark::workflow::{
    StaticWorkflowSource, Step, Workflow, load_workflow_file,
};

const WAIT: Duration = Duration::from_secs(5);

/// UI double: records callbacks, confirms heals, and leaves error
/// handling to the test (Dismiss keeps the machine in ERROR).
struct TestUi {
    calls: Mutex<Vec<String>>,
}

impl TestUi {
    fn new() -> Arc<Self> {
        Arc::new(TestUi {
            calls: Mutex::new(Vec::new()),
        })
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn saw(&self, call: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|seen| seen == call)
    }
}

#[async_trait]
impl WalkthroughUi for TestUi {
    async fn show_step(&self, _element: &ElementHandle, step: &Step) {
        self.record(&format!("step:{}", step.step_number));
    }

    async fn show_healing(&self) {
        self.record("healing");
    }

    async fn show_healed_element(
        &self,
        _candidate: &ElementHandle,
        _confidence: f64,
    ) -> HealConfirmation {
        self.record("healed_prompt");
        HealConfirmation::Confirmed
    }

    async fn show_error(
        &self,
        error: &waymark::machine::state::ErrorInfo,
        _can_retry: bool,
    ) -> ErrorChoice {
        self.record(&format!("error:{:?}", error.error_type));
        ErrorChoice::Dismiss
    }

    async fn show_completed(&self) {
        self.record("completed");
    }

    async fn notify_click_blocked(&self) {
        self.record("click_blocked");
    }

    async fn destroy(&self) {
        self.record("destroy");
    }
}

fn test_config() -> PlaybackConfig {
    PlaybackConfig {
        element_find_timeout_ms: 200,
        max_element_find_retries: 1,
        transport_retry_base_ms: 1,
        ..PlaybackConfig::default()
    }
}

fn click_workflow_json() -> &'static str {
    indoc! {r##"
        {
          "id": "wf-clicks",
          "name": "two clicks",
          "starting_url": "https://a.test/x",
          "steps": [
            {
              "step_number": 1,
              "action_type": "click",
              "selectors": {"primary": "#first"},
              "page_context": {"url": "https://a.test/x"},
              "instruction": "Click the first button"
            },
            {
              "step_number": 2,
              "action_type": "click",
              "selectors": {"primary": "#second"},
              "page_context": {"url": "https://a.test/x"}
            }
          ]
        }
    "##}
}

fn workflow_from_json(json: &str) -> Workflow {
    serde_json::from_str(json).expect("workflow fixture parses")
}

struct Fixture {
    host: Arc<MemoryHost>,
    page: Arc<MemoryPage>,
    session: Session,
    tab: TabId,
    ui: Arc<TestUi>,
    events: broadcast::Receiver<StateChanged>,
}

async fn start_fixture(
    workflow: Workflow,
    healer: Arc<dyn Healer>,
    start_url: &str,
    dom: Vec<FakeElement>,
) -> Fixture {
    let host = MemoryHost::new();
    let tab = host.open_tab(start_url);
    let page = MemoryPage::new(host.clone(), tab);
    page.install_dom(dom);
    let ui = TestUi::new();

    let workflow_id = workflow.id.clone();
    let session = Session::start(
        host.clone(),
        page.clone(),
        Arc::new(StaticWorkflowSource::new(vec![workflow])),
        healer,
        None,
        ui.clone(),
        SessionOptions {
            config: test_config(),
            auto: false,
            trace_dir: None,
        },
    )
    .await
    .expect("session starts");

    let events = session.events();
    session.begin(&workflow_id, tab).await.expect("walkthrough starts");

    Fixture {
        host,
        page,
        session,
        tab,
        ui,
        events,
    }
}

async fn wait_for<F>(
    events: &mut broadcast::Receiver<StateChanged>,
    mut predicate: F,
) -> WalkthroughState
where
    F: FnMut(&WalkthroughState) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let message = events.recv().await.expect("broadcast stream open");
            if predicate(&message.state) {
                return message.state;
            }
        }
    })
    .await
    .expect("state never arrived")
}

fn waiting_on(index: usize) -> impl FnMut(&WalkthroughState) -> bool {
    move |state| {
        state.machine_state == MachineState::WaitingAction
            && state.current_step_index == index
    }
}

// Scenario: two click steps on one page, performed in order, end in
// COMPLETED with both steps recorded.
#[tokio::test]
async fn happy_single_page_walkthrough() {
    let workflow = workflow_from_json(click_workflow_json());
    let mut fixture = start_fixture(
        workflow,
        Arc::new(NoHealer),
        "https://a.test/x",
        vec![
            FakeElement::new("b1", "button").selector("#first").text("One"),
            FakeElement::new("b2", "button").selector("#second").text("Two"),
        ],
    )
    .await;

    // Local subscribers see every mutation too.
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_subscriber = seen.clone();
    fixture
        .session
        .handle()
        .subscribe_fn(Box::new(move |message| {
            seen_by_subscriber
                .lock()
                .unwrap()
                .push(message.trigger.clone());
            Ok(())
        }))
        .await;

    wait_for(&mut fixture.events, waiting_on(0)).await;

    let tabs = fixture.session.tabs();
    assert_eq!(tabs.primary_tab(), Some(fixture.tab));
    assert!(tabs.is_session_tab(fixture.tab));
    assert!(!tabs.is_session_tab(fixture.tab + 99));
    assert!(
        fixture
            .session
            .handle()
            .state_for_tab(fixture.tab)
            .await
            .is_some()
    );
    assert!(
        fixture
            .session
            .handle()
            .state_for_tab(fixture.tab + 99)
            .await
            .is_none()
    );

    fixture.page.user_click("b1");

    wait_for(&mut fixture.events, waiting_on(1)).await;
    fixture.page.user_click("b2");

    let done = wait_for(&mut fixture.events, |state| {
        state.machine_state == MachineState::Completed
    })
    .await;
    assert_eq!(done.completed_step_indexes, vec![0, 1]);
    assert!(fixture.ui.saw("completed"));
    assert!(fixture.ui.saw("step:1"));
    assert!(fixture.ui.saw("step:2"));
    {
        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|trigger| trigger == "ACTION_DETECTED"));
        assert!(seen.iter().any(|trigger| trigger == "NEXT_STEP"));
    }

    fixture.session.shutdown().await;
}

// Scenario: a jump to a step recorded on another page dispatches
// JUMP_TO_STEP before navigating, so the index is already right while
// NAVIGATING and when the new page loads.
#[tokio::test]
async fn cross_page_jump_keeps_index_ahead_of_navigation() {
    let json = indoc! {r##"
        {
          "id": "wf-cross",
          "name": "cross page",
          "starting_url": "https://a.test/x",
          "steps": [
            {
              "step_number": 1,
              "action_type": "click",
              "selectors": {"primary": "#on-x"},
              "page_context": {"url": "https://a.test/x"}
            },
            {
              "step_number": 2,
              "action_type": "click",
              "selectors": {"primary": "#on-y"},
              "page_context": {"url": "https://a.test/y"}
            }
          ]
        }
    "##};
    let mut fixture = start_fixture(
        workflow_from_json(json),
        Arc::new(NoHealer),
        "https://a.test/x",
        vec![
            FakeElement::new("x-btn", "button").selector("#on-x"),
            FakeElement::new("y-btn", "button").selector("#on-y"),
        ],
    )
    .await;

    wait_for(&mut fixture.events, waiting_on(0)).await;

    let router = StepRouter::new(fixture.session.handle().clone());
    let outcome = router.next().await;
    assert!(outcome.success, "jump refused: {:?}", outcome.reason);
    assert!(outcome.navigating);

    // Index is 1 from the moment of the jump, through NAVIGATING, to
    // the step on the new page.
    let state = wait_for(&mut fixture.events, |state| {
        state.machine_state == MachineState::WaitingAction
    })
    .await;
    assert_eq!(state.current_step_index, 1);
    assert_eq!(
        fixture.host.tab_url(fixture.tab).await.unwrap().as_deref(),
        Some("https://a.test/y")
    );

    fixture.session.shutdown().await;
}

// Scenario: a recorded root URL acts as a wildcard within its origin;
// no navigation is initiated.
#[tokio::test]
async fn root_recorded_url_matches_without_navigation() {
    let json = indoc! {r##"
        {
          "id": "wf-root",
          "name": "root wildcard",
          "starting_url": "https://a.test/",
          "steps": [
            {
              "step_number": 1,
              "action_type": "click",
              "selectors": {"primary": "#one"},
              "page_context": {"url": "https://a.test/"}
            },
            {
              "step_number": 2,
              "action_type": "click",
              "selectors": {"primary": "#two"},
              "page_context": {"url": "https://a.test/"}
            }
          ]
        }
    "##};
    let mut fixture = start_fixture(
        workflow_from_json(json),
        Arc::new(NoHealer),
        "https://a.test/search?q=foo",
        vec![
            FakeElement::new("one", "button").selector("#one"),
            FakeElement::new("two", "button").selector("#two"),
        ],
    )
    .await;

    wait_for(&mut fixture.events, waiting_on(0)).await;

    let router = StepRouter::new(fixture.session.handle().clone());
    let outcome = router.jump_to_step(1).await;
    assert!(outcome.success);
    assert!(!outcome.navigating);

    let state = wait_for(&mut fixture.events, waiting_on(1)).await;
    assert!(!state.navigation.in_progress);
    // Still on the search page; the root-recorded step didn't force a
    // same-origin reload.
    assert_eq!(
        fixture.host.tab_url(fixture.tab).await.unwrap().as_deref(),
        Some("https://a.test/search?q=foo")
    );

    fixture.session.shutdown().await;
}

// Scenario: coordinator dies mid-navigation; the revived one restores
// the persisted state, sees the deadline has passed, and lands in
// ERROR(navigation_timeout).
#[tokio::test]
async fn navigation_timeout_recovery_across_restart() {
    let host = MemoryHost::new();
    let tab = host.open_tab("https://a.test/x");
    let config = test_config();

    // Build the persisted mid-navigation state with the pure machine,
    // as the dead coordinator would have left it.
    let now = host.now_ms();
    let workflow = workflow_from_json(click_workflow_json());
    let state = dispatch(
        WalkthroughState::idle(),
        &SessionEvent::Start {
            session_id: "ws-restart".into(),
            workflow_id: workflow.id.clone(),
            tab_id: tab,
        },
        now,
        &config,
    )
    .state;
    let state =
        dispatch(state, &SessionEvent::DataLoaded { workflow }, now, &config)
            .state;
    let mut state = dispatch(
        state,
        &SessionEvent::UrlChanged {
            tab_id: tab,
            url: "https://a.test/y".into(),
        },
        now,
        &config,
    )
    .state;
    assert_eq!(state.machine_state, MachineState::Navigating);
    state.touch(now, config.session_timeout_ms);
    host.seed_store(
        SESSION_STATE_KEY,
        serde_json::to_value(&state).unwrap(),
    );

    // The coordinator comes back 5s after the deadline.
    host.advance(config.navigation_timeout_ms + 5_000);

    let handle = Coordinator::spawn(
        config.clone(),
        host.clone(),
        Arc::new(StaticWorkflowSource::new(vec![])),
        None,
    );
    let restored = handle.initialize().await.unwrap();
    assert_eq!(restored.machine_state, MachineState::Navigating);

    let watcher =
        NavigationWatcher::new(handle.clone(), host.clone(), config);
    watcher.initialize().await.unwrap();

    let state = handle.state();
    assert_eq!(state.machine_state, MachineState::Error);
    assert_eq!(
        state.error_info.as_ref().unwrap().error_type,
        ErrorKind::NavigationTimeout
    );
}

// The sibling case: restarting with time left re-arms the alarm for
// the remaining interval instead of firing.
#[tokio::test]
async fn navigation_deadline_rearmed_when_time_remains() {
    let host = MemoryHost::new();
    let tab = host.open_tab("https://a.test/x");
    let config = test_config();

    let now = host.now_ms();
    let workflow = workflow_from_json(click_workflow_json());
    let state = dispatch(
        WalkthroughState::idle(),
        &SessionEvent::Start {
            session_id: "ws-rearm".into(),
            workflow_id: workflow.id.clone(),
            tab_id: tab,
        },
        now,
        &config,
    )
    .state;
    let state =
        dispatch(state, &SessionEvent::DataLoaded { workflow }, now, &config)
            .state;
    let mut state = dispatch(
        state,
        &SessionEvent::UrlChanged {
            tab_id: tab,
            url: "https://a.test/y".into(),
        },
        now,
        &config,
    )
    .state;
    state.touch(now, config.session_timeout_ms);
    host.seed_store(
        SESSION_STATE_KEY,
        serde_json::to_value(&state).unwrap(),
    );

    host.advance(config.navigation_timeout_ms / 2);

    let handle = Coordinator::spawn(
        config.clone(),
        host.clone(),
        Arc::new(StaticWorkflowSource::new(vec![])),
        None,
    );
    handle.initialize().await.unwrap();
    let watcher =
        NavigationWatcher::new(handle.clone(), host.clone(), config.clone());
    watcher.initialize().await.unwrap();

    assert_eq!(handle.state().machine_state, MachineState::Navigating);
    let deadline = host
        .armed_alarm(NAVIGATION_TIMEOUT_ALARM)
        .expect("alarm re-armed");
    assert_eq!(deadline, host.now_ms() + config.navigation_timeout_ms / 2);
}

// Scenario: the user types into a search box and presses Enter, which
// navigates the page synchronously. The commit lands before teardown;
// the rest of the walkthrough continues on the results page.
#[tokio::test]
async fn input_enter_commits_before_synchronous_navigation() {
    let json = indoc! {r##"
        {
          "id": "wf-search",
          "name": "search flow",
          "starting_url": "https://a.test/x",
          "steps": [
            {
              "step_number": 1,
              "action_type": "input_commit",
              "selectors": {"primary": "#q"},
              "page_context": {"url": "https://a.test/x"},
              "action_data": {"kind": "input_commit", "committed_value": "kittens"}
            },
            {
              "step_number": 2,
              "action_type": "click",
              "selectors": {"primary": "#result"},
              "page_context": {"url": "https://a.test/results"}
            }
          ]
        }
    "##};
    let mut fixture = start_fixture(
        workflow_from_json(json),
        Arc::new(NoHealer),
        "https://a.test/x",
        vec![
            FakeElement::new("q", "input").selector("#q"),
            FakeElement::new("r1", "a").selector("#result"),
        ],
    )
    .await;

    wait_for(&mut fixture.events, waiting_on(0)).await;
    fixture.page.user_focus("q");
    fixture.page.user_types("q", "kittens");
    fixture.page.user_presses_enter("q", false);

    // The Enter keydown committed the value before any navigation.
    let state = wait_for(&mut fixture.events, |state| {
        state.machine_state == MachineState::ShowingStep
            && state.current_step_index == 1
    })
    .await;
    assert!(state.completed_step_indexes.contains(&0));

    // The site then navigates to the results page.
    fixture.host.user_navigates(fixture.tab, "https://a.test/results");

    wait_for(&mut fixture.events, waiting_on(1)).await;
    fixture.page.user_click("r1");
    let done = wait_for(&mut fixture.events, |state| {
        state.machine_state == MachineState::Completed
    })
    .await;
    assert_eq!(done.completed_step_indexes, vec![0, 1]);

    fixture.session.shutdown().await;
}

/// Healer double that "finds" a known element at a fixed confidence.
struct FakeHealer {
    selector: String,
    node_id: String,
    confidence: f64,
}

#[async_trait]
impl Healer for FakeHealer {
    async fn heal_element(
        &self,
        _page: &dyn PageDriver,
        _step: &Step,
        context: HealContext<'_>,
    ) -> Result<HealingResult> {
        let element = ElementHandle {
            node_id: self.node_id.clone(),
            tag: "button".into(),
            text: Some("Save".into()),
        };
        let resolution = match decide(context.config, self.confidence) {
            HealDecision::AutoAccept => Resolution::HealedAuto,
            HealDecision::ConsultAi | HealDecision::AskUser => {
                match context
                    .ui
                    .show_healed_element(&element, self.confidence)
                    .await
                {
                    HealConfirmation::Confirmed => Resolution::HealedUser,
                    HealConfirmation::Rejected => {
                        return Ok(HealingResult::failed(
                            "user rejected candidate",
                            1,
                        ));
                    }
                }
            }
            HealDecision::Reject => {
                return Ok(HealingResult::failed("below threshold", 1));
            }
        };
        Ok(HealingResult {
            success: true,
            element: Some(element),
            confidence: self.confidence,
            resolution,
            candidates_evaluated: 4,
            ai_confidence: None,
            healed_selector: Some(self.selector.clone()),
            failure_reason: None,
            scoring_result: None,
            healing_log: vec!["matched by text and role".to_string()],
        })
    }
}

// Scenario: the recorded selector is dead, the healer finds the moved
// button at 0.93 confidence, and the walkthrough continues against the
// healed element without user confirmation.
#[tokio::test]
async fn healing_auto_accepts_high_confidence_candidate() {
    let json = indoc! {r##"
        {
          "id": "wf-heal",
          "name": "healing",
          "starting_url": "https://a.test/x",
          "steps": [
            {
              "step_number": 1,
              "action_type": "click",
              "selectors": {"primary": "#save-old"},
              "page_context": {"url": "https://a.test/x"}
            }
          ]
        }
    "##};
    let mut fixture = start_fixture(
        workflow_from_json(json),
        Arc::new(FakeHealer {
            selector: "#save-v2".into(),
            node_id: "save".into(),
            confidence: 0.93,
        }),
        "https://a.test/x",
        // The recorded selector matches nothing; the button moved.
        vec![FakeElement::new("save", "button").selector("#save-v2")],
    )
    .await;

    let state = wait_for(&mut fixture.events, waiting_on(0)).await;
    assert_eq!(
        state.steps[0].healed_selector.as_deref(),
        Some("#save-v2")
    );
    let healing = state.healing_info.as_ref().unwrap();
    assert!(!healing.in_progress);
    assert_eq!(healing.best_score, 0.93);
    assert_eq!(healing.candidate_count, 4);
    assert!(fixture.ui.saw("healing"));
    assert!(!fixture.ui.saw("healed_prompt"));

    fixture.page.user_click("save");
    let done = wait_for(&mut fixture.events, |state| {
        state.machine_state == MachineState::Completed
    })
    .await;
    assert_eq!(done.completed_step_indexes, vec![0]);

    fixture.session.shutdown().await;
}

// Healing failure surfaces the error UI with the healing_failed type.
#[tokio::test]
async fn failed_heal_lands_in_error() {
    let json = indoc! {r##"
        {
          "id": "wf-heal-fail",
          "name": "healing failure",
          "starting_url": "https://a.test/x",
          "steps": [
            {
              "step_number": 1,
              "action_type": "click",
              "selectors": {"primary": "#gone"},
              "page_context": {"url": "https://a.test/x"}
            }
          ]
        }
    "##};
    let mut fixture = start_fixture(
        workflow_from_json(json),
        Arc::new(NoHealer),
        "https://a.test/x",
        vec![],
    )
    .await;

    let state = wait_for(&mut fixture.events, |state| {
        state.machine_state == MachineState::Error
    })
    .await;
    assert_eq!(
        state.error_info.as_ref().unwrap().error_type,
        ErrorKind::HealingFailed
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(fixture.ui.saw("error:HealingFailed"));

    fixture.session.shutdown().await;
}

// Off-target clicks are blocked and reported; the target still works.
#[tokio::test]
async fn interceptor_blocks_and_pulses() {
    let workflow = workflow_from_json(click_workflow_json());
    let mut fixture = start_fixture(
        workflow,
        Arc::new(NoHealer),
        "https://a.test/x",
        vec![
            FakeElement::new("b1", "button").selector("#first"),
            FakeElement::new("b2", "button").selector("#second"),
            FakeElement::new("decoy", "button").selector("#decoy"),
        ],
    )
    .await;

    wait_for(&mut fixture.events, waiting_on(0)).await;
    fixture.page.user_click("decoy");

    tokio::time::timeout(WAIT, async {
        loop {
            if fixture.ui.saw("click_blocked") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("blocked click never surfaced");
    assert_eq!(fixture.page.pulses(), vec!["b1".to_string()]);

    // The real target still advances the walkthrough.
    fixture.page.user_click("b1");
    wait_for(&mut fixture.events, waiting_on(1)).await;

    fixture.session.shutdown().await;
}

// Closing the primary tab ends the session and clears the persisted
// state; page controllers get the IDLE broadcast addressed to them.
#[tokio::test]
async fn primary_tab_close_ends_the_session() {
    let workflow = workflow_from_json(click_workflow_json());
    let mut fixture = start_fixture(
        workflow,
        Arc::new(NoHealer),
        "https://a.test/x",
        vec![
            FakeElement::new("b1", "button").selector("#first"),
            FakeElement::new("b2", "button").selector("#second"),
        ],
    )
    .await;

    wait_for(&mut fixture.events, waiting_on(0)).await;
    assert!(fixture.host.stored_session().is_some());

    fixture.host.close_tab(fixture.tab);

    wait_for(&mut fixture.events, |state| {
        state.machine_state == MachineState::Idle
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(fixture.host.stored_session().is_none());
    assert!(fixture.ui.saw("destroy"));

    fixture.session.shutdown().await;
}

// Iframe navigations and restricted URLs never reach the machine.
#[tokio::test]
async fn iframe_and_restricted_navigations_are_suppressed() {
    let workflow = workflow_from_json(click_workflow_json());
    let mut fixture = start_fixture(
        workflow,
        Arc::new(NoHealer),
        "https://a.test/x",
        vec![
            FakeElement::new("b1", "button").selector("#first"),
            FakeElement::new("b2", "button").selector("#second"),
        ],
    )
    .await;

    wait_for(&mut fixture.events, waiting_on(0)).await;

    fixture.host.iframe_navigates(fixture.tab, "https://ads.test/frame");
    fixture.host.user_navigates(fixture.tab, "chrome://settings");
    fixture
        .host
        .user_navigates(fixture.tab, "https://a.test/manual.pdf");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let state = fixture.session.handle().state();
    assert_eq!(state.machine_state, MachineState::WaitingAction);
    assert!(!state.navigation.in_progress);

    fixture.session.shutdown().await;
}

// The retry count for a step survives in state, and a valid action
// resets it.
#[tokio::test]
async fn wrong_value_copy_burns_retries_then_errors() {
    let json = indoc! {r##"
        {
          "id": "wf-copy",
          "name": "copy check",
          "starting_url": "https://a.test/x",
          "steps": [
            {
              "step_number": 1,
              "action_type": "copy",
              "selectors": {"primary": "#order"},
              "page_context": {"url": "https://a.test/x"},
              "action_data": {"kind": "clipboard", "preview": "order #123", "truncated": false}
            }
          ]
        }
    "##};
    let mut fixture = start_fixture(
        workflow_from_json(json),
        Arc::new(NoHealer),
        "https://a.test/x",
        vec![
            FakeElement::new("order", "span")
                .selector("#order")
                .text("order #123"),
        ],
    )
    .await;

    wait_for(&mut fixture.events, waiting_on(0)).await;

    use waymark::host::ClipboardKind;
    fixture
        .page
        .user_clipboard(ClipboardKind::Copy, Some("wrong text"), None);
    let state = wait_for(&mut fixture.events, |state| state.retries_for(0) == 1)
        .await;
    assert_eq!(state.machine_state, MachineState::WaitingAction);

    fixture
        .page
        .user_clipboard(ClipboardKind::Copy, Some("wrong again"), None);
    wait_for(&mut fixture.events, |state| state.retries_for(0) == 2).await;

    fixture
        .page
        .user_clipboard(ClipboardKind::Copy, Some("still wrong"), None);
    let state = wait_for(&mut fixture.events, |state| {
        state.machine_state == MachineState::Error
    })
    .await;
    assert_eq!(
        state.error_info.as_ref().unwrap().error_type,
        ErrorKind::ActionInvalid
    );
    assert_eq!(state.error_info.as_ref().unwrap().retry_count, 3);

    fixture.session.shutdown().await;
}

// A session left idle past its deadline is ended by the inactivity
// timer.
#[tokio::test]
async fn session_times_out_after_inactivity() {
    let json = click_workflow_json();
    let host = MemoryHost::new();
    let tab = host.open_tab("https://a.test/x");
    let page = MemoryPage::new(host.clone(), tab);
    page.install_dom(vec![
        FakeElement::new("b1", "button").selector("#first"),
        FakeElement::new("b2", "button").selector("#second"),
    ]);

    let config = PlaybackConfig {
        session_timeout_ms: 100,
        ..test_config()
    };
    let workflow = workflow_from_json(json);
    let workflow_id = workflow.id.clone();
    let session = Session::start(
        host.clone(),
        page,
        Arc::new(StaticWorkflowSource::new(vec![workflow])),
        Arc::new(NoHealer),
        None,
        TestUi::new(),
        SessionOptions {
            config,
            auto: false,
            trace_dir: None,
        },
    )
    .await
    .unwrap();
    let mut events = session.events();
    session.begin(&workflow_id, tab).await.unwrap();

    wait_for(&mut events, waiting_on(0)).await;
    // Nobody acts; the wall clock passes the expiry before the timer
    // fires.
    host.advance(200_000);

    wait_for(&mut events, |state| {
        state.machine_state == MachineState::Idle
    })
    .await;
    assert!(host.stored_session().is_none());

    session.shutdown().await;
}

// The simulated user plays a whole recorded workflow, including the
// select and submit variants.
#[tokio::test]
async fn auto_driver_replays_mixed_action_workflow() {
    let json = indoc! {r##"
        {
          "id": "wf-mixed",
          "name": "mixed actions",
          "starting_url": "https://a.test/form",
          "steps": [
            {
              "step_number": 1,
              "action_type": "input_commit",
              "selectors": {"primary": "#name"},
              "page_context": {"url": "https://a.test/form"},
              "action_data": {"kind": "input_commit", "committed_value": "Ada"}
            },
            {
              "step_number": 2,
              "action_type": "select_change",
              "selectors": {"primary": "#country"},
              "page_context": {"url": "https://a.test/form"},
              "action_data": {"kind": "select_change", "selected_value": "se", "selected_label": "Sweden"}
            },
            {
              "step_number": 3,
              "action_type": "submit",
              "selectors": {"primary": "#send"},
              "page_context": {"url": "https://a.test/form"}
            }
          ]
        }
    "##};
    let workflow = workflow_from_json(json);
    let workflow_id = workflow.id.clone();

    let host = MemoryHost::new();
    let tab = host.open_tab("https://a.test/form");
    let page = MemoryPage::new(host.clone(), tab);
    let mut form = FakeElement::new("form-1", "form");
    form.selectors.push("#the-form".into());
    page.install_dom(vec![
        form,
        FakeElement::new("name", "input").selector("#name").in_form("form-1"),
        FakeElement::new("country", "select")
            .selector("#country")
            .value("us")
            .in_form("form-1"),
        FakeElement::new("send", "button")
            .selector("#send")
            .in_form("form-1"),
    ]);

    let session = Session::start(
        host.clone(),
        page,
        Arc::new(StaticWorkflowSource::new(vec![workflow])),
        Arc::new(NoHealer),
        None,
        TestUi::new(),
        SessionOptions {
            config: test_config(),
            auto: true,
            trace_dir: None,
        },
    )
    .await
    .unwrap();
    let mut events = session.events();
    session.begin(&workflow_id, tab).await.unwrap();

    let done = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let message = events.recv().await.expect("broadcasts open");
            if message.state.machine_state == MachineState::Completed {
                break message.state;
            }
        }
    })
    .await
    .expect("walkthrough never completed");
    assert_eq!(done.completed_step_indexes, vec![0, 1, 2]);

    session.shutdown().await;
}

// Workflow fixtures on disk load through the file source path used by
// the CLI.
#[tokio::test]
async fn workflow_files_load_and_validate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wf-clicks.json");
    std::fs::write(&path, click_workflow_json()).unwrap();

    let workflow = load_workflow_file(&path).unwrap();
    assert_eq!(workflow.id, "wf-clicks");
    assert_eq!(workflow.steps.len(), 2);
    assert_eq!(
        workflow.steps[0].instruction.as_deref(),
        Some("Click the first button")
    );
}
