use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::sleep;

use crate::host::{ClipboardKind, ElementHandle, PageDriver, SimulatedAction};
use crate::machine::state::{MachineState, TabId};
use crate::machine::WalkthroughState;
use crate::messaging::StateChanged;
use crate::workflow::{ActionData, ActionType, Step};

/// Plays the human: whenever a step waits for its action, perform the
/// recorded action through the page driver. Used to validate recorded
/// workflows end-to-end and by the live smoke test.
pub struct SimulatedUser {
    pub page: Arc<dyn PageDriver>,
    pub tab_id: TabId,
    /// Small think-time delays so playback resembles a person and the
    /// UI's confirmation states are observable.
    pub jitter: bool,
}

impl SimulatedUser {
    pub fn spawn(
        self,
        mut broadcasts: broadcast::Receiver<StateChanged>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            // One attempt per (step, state) pairing; ACTION_INVALID
            // rebroadcasts must not cause a second identical action.
            let mut last_acted: Option<(usize, MachineState)> = None;
            loop {
                let message = match broadcasts.recv().await {
                    Ok(message) => message,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                if !message.recipients.contains(&self.tab_id) {
                    continue;
                }
                let state = &message.state;
                match state.machine_state {
                    MachineState::WaitingAction => {
                        let key = (
                            state.current_step_index,
                            MachineState::WaitingAction,
                        );
                        if last_acted == Some(key) {
                            continue;
                        }
                        last_acted = Some(key);
                        self.act(state).await;
                    }
                    MachineState::ShowingStep => {
                        // Navigate steps never reach WAITING_ACTION;
                        // the navigation itself is the action.
                        let Some(step) = state.current_step() else {
                            continue;
                        };
                        if step.action_type != ActionType::Navigate {
                            continue;
                        }
                        let key = (
                            state.current_step_index,
                            MachineState::ShowingStep,
                        );
                        if last_acted == Some(key) {
                            continue;
                        }
                        last_acted = Some(key);
                        self.navigate(step.clone()).await;
                    }
                    MachineState::Completed | MachineState::Idle => break,
                    _ => {}
                }
            }
        })
    }

    async fn think(&self) {
        if self.jitter {
            let millis = rand::rng().random_range(80..280);
            sleep(Duration::from_millis(millis)).await;
        }
    }

    async fn navigate(&self, step: Step) {
        self.think().await;
        let target = match &step.action_data {
            Some(ActionData::Navigate {
                target_url: Some(url),
            }) => Some(url.clone()),
            _ => step.page_context.as_ref().map(|c| c.url.clone()),
        };
        let Some(url) = target else {
            log::warn!("navigate step {} has no target", step.step_number);
            return;
        };
        if let Err(error) = self
            .page
            .perform(&SimulatedAction::Navigate { url: url.clone() })
            .await
        {
            log::error!("simulated navigation to {} failed: {}", url, error);
        }
    }

    async fn act(&self, state: &WalkthroughState) {
        let Some(step) = state.current_step() else {
            return;
        };
        let Some(element) = self.find(step).await else {
            log::warn!(
                "simulated user can't find the target for step {}",
                step.step_number
            );
            return;
        };
        self.think().await;

        let action = match step.action_type {
            ActionType::Click => SimulatedAction::Click { element },
            ActionType::InputCommit => {
                let text = match &step.action_data {
                    Some(ActionData::InputCommit {
                        committed_value: Some(value),
                    }) => value.clone(),
                    _ => "example input".to_string(),
                };
                SimulatedAction::TypeText {
                    element,
                    text,
                    press_enter: false,
                }
            }
            ActionType::SelectChange => {
                let value = match &step.action_data {
                    Some(ActionData::SelectChange {
                        selected_value: Some(value),
                        ..
                    }) => value.clone(),
                    _ => "1".to_string(),
                };
                SimulatedAction::SelectOption { element, value }
            }
            ActionType::Submit => {
                match self.page.form_ancestor(&element).await {
                    Ok(Some(form)) => SimulatedAction::SubmitForm { form },
                    _ => {
                        log::warn!(
                            "no form around step {} target",
                            step.step_number
                        );
                        return;
                    }
                }
            }
            ActionType::Copy => SimulatedAction::Clipboard {
                element,
                kind: ClipboardKind::Copy,
            },
            ActionType::Cut => SimulatedAction::Clipboard {
                element,
                kind: ClipboardKind::Cut,
            },
            ActionType::Paste => SimulatedAction::Clipboard {
                element,
                kind: ClipboardKind::Paste,
            },
            ActionType::Navigate => return,
        };

        if let Err(error) = self.page.perform(&action).await {
            log::error!(
                "simulated action for step {} failed: {}",
                step.step_number,
                error
            );
        }
    }

    async fn find(&self, step: &Step) -> Option<ElementHandle> {
        for (kind, selector) in
            step.selectors.candidates(step.healed_selector.as_ref())
        {
            if let Ok(Some(element)) = self.page.query(kind, &selector).await
            {
                return Some(element);
            }
        }
        None
    }
}
