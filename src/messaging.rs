use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json as json;

use crate::config::PlaybackConfig;
use crate::machine::state::TabId;
use crate::machine::WalkthroughState;
use crate::workflow::ActionType;

/// Page-context → coordinator messages, discriminated the way they go
/// over the extension port.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PageMessage {
    #[serde(rename = "WALKTHROUGH_COMMAND")]
    Command {
        #[serde(flatten)]
        command: WalkthroughCommand,
    },
    #[serde(rename = "WALKTHROUGH_ELEMENT_STATUS")]
    ElementStatus {
        step_index: usize,
        found: bool,
        tab_id: TabId,
    },
    #[serde(rename = "WALKTHROUGH_HEALING_RESULT")]
    HealingResult {
        step_index: usize,
        result: HealingReport,
    },
    #[serde(rename = "WALKTHROUGH_EXECUTION_LOG")]
    ExecutionLog { entry: json::Value },
    #[serde(rename = "WALKTHROUGH_TAB_READY")]
    TabReady { tab_id: TabId, url: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalkthroughCommand {
    Start { workflow_id: String, tab_id: TabId },
    Next,
    Prev,
    JumpTo { index: usize },
    Retry,
    Skip,
    Exit,
    GetState,
    ReportAction {
        step_index: usize,
        action_type: ActionType,
        #[serde(default)]
        value: Option<String>,
        valid: bool,
        #[serde(default)]
        reason: Option<String>,
        tab_id: TabId,
    },
}

/// What the healer told the page, relayed verbatim to the coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealingReport {
    pub success: bool,
    pub confidence: f64,
    pub ai_validated: bool,
    #[serde(default)]
    pub healed_selector: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub candidates_evaluated: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(default)]
    pub state: Option<WalkthroughState>,
    #[serde(default)]
    pub error: Option<String>,
    /// Set by routing commands when a page navigation was initiated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigating: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabReadyResponse {
    pub has_active_session: bool,
    #[serde(default)]
    pub state: Option<WalkthroughState>,
}

/// Coordinator → page broadcast after every applied mutation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateChanged {
    pub state: WalkthroughState,
    /// Wire name of the event that caused the change.
    pub trigger: String,
    /// Tabs this snapshot is addressed to. An IDLE snapshot goes to the
    /// tabs of the state it replaced, so they know to clean up.
    pub recipients: Vec<TabId>,
}

#[derive(Clone, Debug)]
pub enum CoordinatorReply {
    Command(CommandResponse),
    TabReady(TabReadyResponse),
    Ack,
}

/// Transport-level failure vs a business error the caller must see.
/// Only the former is retried.
#[derive(Debug)]
pub enum SendError {
    Transport(String),
    Business(String),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Transport(message) => {
                write!(f, "transport error: {}", message)
            }
            SendError::Business(message) => message.fmt(f),
        }
    }
}

impl std::error::Error for SendError {}

impl SendError {
    /// Buckets a raw failure message: the extension runtime's transient
    /// channel failures are retryable, everything else is for the
    /// caller.
    pub fn classify(message: impl Into<String>) -> SendError {
        let message = message.into();
        if is_transport_failure(&message) {
            SendError::Transport(message)
        } else {
            SendError::Business(message)
        }
    }
}

/// Message strings the extension runtime produces for transient channel
/// failures. Anything matching is worth retrying.
pub fn is_transport_failure(message: &str) -> bool {
    const TRANSIENT: &[&str] = &[
        "receiving end does not exist",
        "extension context invalidated",
        "could not establish connection",
    ];
    let lower = message.to_ascii_lowercase();
    TRANSIENT.iter().any(|marker| lower.contains(marker))
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        message: PageMessage,
    ) -> Result<CoordinatorReply, SendError>;
}

/// Sends with exponential backoff on transport failures. Business errors
/// and exhaustion surface to the caller.
pub async fn send_with_retry(
    transport: &dyn Transport,
    message: PageMessage,
    config: &PlaybackConfig,
) -> Result<CoordinatorReply, SendError> {
    let mut attempt: u32 = 0;
    loop {
        match transport.send(message.clone()).await {
            Ok(reply) => return Ok(reply),
            Err(SendError::Business(error)) => {
                return Err(SendError::Business(error));
            }
            Err(SendError::Transport(error)) => {
                if attempt >= config.transport_max_retries {
                    return Err(SendError::Transport(error));
                }
                let delay = backoff_delay(config, attempt);
                log::debug!(
                    "transport send failed ({}), retrying in {}ms",
                    error,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

pub fn backoff_delay(config: &PlaybackConfig, attempt: u32) -> Duration {
    Duration::from_millis(
        config.transport_retry_base_ms.saturating_mul(1 << attempt),
    )
}

/// Fire-and-forget send for execution analytics; failures are logged and
/// never retried.
pub async fn send_log(transport: &dyn Transport, entry: json::Value) {
    if let Err(error) =
        transport.send(PageMessage::ExecutionLog { entry }).await
    {
        log::debug!("execution log dropped: {}", error);
    }
}

pub mod gateway {
    use super::WalkthroughCommand;
    use crate::machine::state::TabId;
    use serde::Deserialize;
    use serde_json as json;

    /// Window-level message shape posted by the dashboard overlay.
    #[derive(Debug, Deserialize)]
    struct DashboardMessage {
        source: String,
        #[serde(rename = "type")]
        kind: String,
        payload: Payload,
    }

    #[derive(Debug, Deserialize)]
    struct Payload {
        #[serde(rename = "workflowId")]
        workflow_id: String,
    }

    /// Accepts a window message only when it comes from an allowlisted
    /// origin and carries the dashboard envelope; anything else is
    /// dropped without a response, so probing pages learn nothing.
    pub fn accept_start(
        origin: &str,
        allowed_origins: &[String],
        message: &json::Value,
        tab_id: TabId,
    ) -> Option<WalkthroughCommand> {
        if !allowed_origins.iter().any(|allowed| allowed == origin) {
            log::debug!("dropping dashboard message from {}", origin);
            return None;
        }
        let message: DashboardMessage =
            serde_json::from_value(message.clone()).ok()?;
        if message.source != "overlay-dashboard"
            || message.kind != "START_WALKTHROUGH"
        {
            return None;
        }
        Some(WalkthroughCommand::Start {
            workflow_id: message.payload.workflow_id,
            tab_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyTransport {
        failures_left: AtomicU32,
        log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn send(
            &self,
            message: PageMessage,
        ) -> Result<CoordinatorReply, SendError> {
            self.log
                .lock()
                .unwrap()
                .push(serde_json::to_string(&message).unwrap());
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                Err(SendError::Transport(
                    "receiving end does not exist".into(),
                ))
            } else {
                Ok(CoordinatorReply::Ack)
            }
        }
    }

    fn fast_config() -> PlaybackConfig {
        PlaybackConfig {
            transport_retry_base_ms: 1,
            ..PlaybackConfig::default()
        }
    }

    #[tokio::test]
    async fn retries_transport_failures_then_succeeds() {
        let transport = FlakyTransport {
            failures_left: AtomicU32::new(2),
            log: Mutex::new(Vec::new()),
        };
        let reply = send_with_retry(
            &transport,
            PageMessage::TabReady {
                tab_id: 7,
                url: "https://a.test/".into(),
            },
            &fast_config(),
        )
        .await;
        assert!(reply.is_ok());
        assert_eq!(transport.log.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn business_errors_are_not_retried() {
        struct Refusing;
        #[async_trait]
        impl Transport for Refusing {
            async fn send(
                &self,
                _message: PageMessage,
            ) -> Result<CoordinatorReply, SendError> {
                Err(SendError::Business("no session".into()))
            }
        }
        let result = send_with_retry(
            &Refusing,
            PageMessage::Command {
                command: WalkthroughCommand::Next,
            },
            &fast_config(),
        )
        .await;
        match result {
            Err(SendError::Business(message)) => {
                assert_eq!(message, "no session");
            }
            other => panic!("expected business error, got {:?}", other),
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let config = PlaybackConfig::default();
        assert_eq!(backoff_delay(&config, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(2000));
    }

    #[test]
    fn transport_failure_classification() {
        assert!(is_transport_failure("Receiving end does not exist."));
        assert!(is_transport_failure("Extension context invalidated"));
        assert!(!is_transport_failure("invalid step index"));
    }

    #[test]
    fn gateway_accepts_only_allowlisted_dashboard_messages() {
        let allowed = vec!["https://dash.test".to_string()];
        let message = serde_json::json!({
            "source": "overlay-dashboard",
            "type": "START_WALKTHROUGH",
            "payload": {"workflowId": "wf-9"},
        });

        let accepted =
            gateway::accept_start("https://dash.test", &allowed, &message, 3);
        match accepted {
            Some(WalkthroughCommand::Start { workflow_id, tab_id }) => {
                assert_eq!(workflow_id, "wf-9");
                assert_eq!(tab_id, 3);
            }
            other => panic!("expected start, got {:?}", other),
        }

        assert!(
            gateway::accept_start("https://evil.test", &allowed, &message, 3)
                .is_none()
        );

        let wrong_source = serde_json::json!({
            "source": "somebody-else",
            "type": "START_WALKTHROUGH",
            "payload": {"workflowId": "wf-9"},
        });
        assert!(
            gateway::accept_start(
                "https://dash.test",
                &allowed,
                &wrong_source,
                3
            )
            .is_none()
        );
    }

    #[test]
    fn command_wire_format_round_trips() {
        let command = PageMessage::Command {
            command: WalkthroughCommand::JumpTo { index: 4 },
        };
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(value["type"], "WALKTHROUGH_COMMAND");
        assert_eq!(value["command"], "JUMP_TO");
        let back: PageMessage = serde_json::from_value(value).unwrap();
        match back {
            PageMessage::Command {
                command: WalkthroughCommand::JumpTo { index },
            } => assert_eq!(index, 4),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
