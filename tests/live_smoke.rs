use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tempfile::TempDir;
use tower_http::services::ServeDir;

use waymark::config::PlaybackConfig;
use waymark::healing::NoHealer;
use waymark::host::cdp::{
    CdpHost, DebuggerOptions, LaunchOptions, PRIMARY_TAB,
};
use waymark::machine::state::MachineState;
use waymark::runner::{Session, SessionOptions};
use waymark::ui::{ConsoleUi, ErrorChoice};
use waymark::workflow::{
    ActionType, PageContext, SelectorSet, StaticWorkflowSource, Step,
    Workflow,
};

fn setup_logging() {
    let env = env_logger::Env::default().default_filter_or("warn");
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .is_test(true)
        .try_init();
}

/// End-to-end against a real Chromium: serves the fixture page, replays
/// a one-click workflow with the simulated user, expects COMPLETED.
/// Needs a local browser, so it stays out of the default run.
#[tokio::test]
#[ignore]
async fn replays_one_click_workflow_in_a_live_browser() {
    setup_logging();

    let app = Router::new().fallback_service(ServeDir::new("./tests/pages"));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let starting_url = format!("http://localhost:{}/one-click/", port);
    let workflow = Workflow {
        id: "wf-smoke".into(),
        name: "one click".into(),
        starting_url: starting_url.clone(),
        steps: vec![Step {
            step_number: 1,
            action_type: ActionType::Click,
            selectors: SelectorSet {
                primary: Some("#go".into()),
                ..SelectorSet::default()
            },
            element_meta: None,
            page_context: Some(PageContext {
                url: starting_url,
                title: None,
            }),
            action_data: None,
            instruction: Some("Press Go".into()),
            healed_selector: None,
        }],
    };

    let user_data_directory = TempDir::new().unwrap();
    let (host, page) = CdpHost::launch(DebuggerOptions::Managed {
        launch_options: LaunchOptions {
            headless: true,
            no_sandbox: true,
            user_data_directory: user_data_directory.path().to_path_buf(),
            width: 800,
            height: 600,
        },
    })
    .await
    .expect("browser launches");

    let session = Session::start(
        host.clone(),
        page,
        Arc::new(StaticWorkflowSource::new(vec![workflow])),
        Arc::new(NoHealer),
        None,
        Arc::new(ConsoleUi {
            confirm_heals: true,
            error_choice: ErrorChoice::Exit,
        }),
        SessionOptions {
            config: PlaybackConfig::default(),
            auto: true,
            trace_dir: None,
        },
    )
    .await
    .expect("session starts");

    let mut events = session.events();
    session.begin("wf-smoke", PRIMARY_TAB).await.expect("starts");

    let outcome = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let message = events.recv().await.expect("broadcasts open");
            match message.state.machine_state {
                MachineState::Completed => break Ok(()),
                MachineState::Error => {
                    break Err(message
                        .state
                        .error_info
                        .map(|error| error.message)
                        .unwrap_or_default());
                }
                _ => {}
            }
        }
    })
    .await
    .expect("walkthrough timed out");

    session.shutdown().await;
    host.terminate().await.unwrap();

    outcome.expect("walkthrough should complete");
}
