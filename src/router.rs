use crate::coordinator::CoordinatorHandle;
use crate::machine::state::MachineState;
use crate::machine::WalkthroughState;
use crate::messaging::{CommandResponse, WalkthroughCommand};
use crate::url::urls_match;

/// Why a routing request was refused. The wire carries these as the
/// response's error code.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RouteRefusal {
    InvalidIndex,
    SameStep,
    NoSession,
    NavigationFailed,
    NoTargetUrl,
}

impl RouteRefusal {
    pub fn code(self) -> &'static str {
        match self {
            RouteRefusal::InvalidIndex => "invalid_index",
            RouteRefusal::SameStep => "same_step",
            RouteRefusal::NoSession => "no_session",
            RouteRefusal::NavigationFailed => "navigation_failed",
            RouteRefusal::NoTargetUrl => "no_target_url",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "invalid_index" => Some(RouteRefusal::InvalidIndex),
            "same_step" => Some(RouteRefusal::SameStep),
            "no_session" => Some(RouteRefusal::NoSession),
            "navigation_failed" => Some(RouteRefusal::NavigationFailed),
            "no_target_url" => Some(RouteRefusal::NoTargetUrl),
            _ => None,
        }
    }
}

impl std::fmt::Display for RouteRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.code().fmt(f)
    }
}

/// Decision for a step jump: either a refusal, or the index to dispatch
/// plus the URL the primary tab must be sent to first (None when the
/// current page already satisfies the step's recorded URL).
#[derive(Clone, Debug, PartialEq)]
pub enum RoutePlan {
    Refuse(RouteRefusal),
    Jump {
        index: usize,
        navigate_to: Option<String>,
    },
}

/// Pure URL-match routing policy. `current_url` is the primary tab's
/// location, when the host could tell us.
pub fn plan_jump(
    state: &WalkthroughState,
    index: usize,
    current_url: Option<&str>,
) -> RoutePlan {
    if !state.is_active() {
        return RoutePlan::Refuse(RouteRefusal::NoSession);
    }
    if index >= state.total_steps {
        return RoutePlan::Refuse(RouteRefusal::InvalidIndex);
    }
    if index == state.current_step_index
        && state.machine_state == MachineState::ShowingStep
    {
        return RoutePlan::Refuse(RouteRefusal::SameStep);
    }

    let step_url = state.steps[index]
        .page_context
        .as_ref()
        .map(|context| context.url.clone());

    match (step_url, current_url) {
        (Some(target), Some(current)) => {
            if urls_match(current, &target) {
                RoutePlan::Jump {
                    index,
                    navigate_to: None,
                }
            } else {
                RoutePlan::Jump {
                    index,
                    navigate_to: Some(target),
                }
            }
        }
        // No way to tell where the tab is; dispatch the jump and force
        // the recorded page to make the element findable.
        (Some(target), None) => RoutePlan::Jump {
            index,
            navigate_to: Some(target),
        },
        (None, Some(current)) => {
            // Nothing recorded for the step. If the tab has wandered off
            // the workflow's origin there is nowhere to send it.
            if let Some(starting) = &state.starting_url
                && !urls_match(current, starting)
            {
                return RoutePlan::Refuse(RouteRefusal::NoTargetUrl);
            }
            RoutePlan::Jump {
                index,
                navigate_to: None,
            }
        }
        (None, None) => RoutePlan::Jump {
            index,
            navigate_to: None,
        },
    }
}

/// Outcome of a router operation, mirroring the wire response.
#[derive(Clone, Debug)]
pub struct RouteOutcome {
    pub success: bool,
    pub navigating: bool,
    pub reason: Option<RouteRefusal>,
}

impl From<CommandResponse> for RouteOutcome {
    fn from(response: CommandResponse) -> Self {
        RouteOutcome {
            success: response.success,
            navigating: response.navigating.unwrap_or(false),
            reason: response
                .error
                .as_deref()
                .and_then(RouteRefusal::from_code),
        }
    }
}

/// Client-side router. All decisions run inside the coordinator so the
/// jump-before-navigate ordering holds no matter who asks.
#[derive(Clone)]
pub struct StepRouter {
    handle: CoordinatorHandle,
}

impl StepRouter {
    pub fn new(handle: CoordinatorHandle) -> Self {
        StepRouter { handle }
    }

    pub async fn next(&self) -> RouteOutcome {
        self.handle.command(WalkthroughCommand::Next).await.into()
    }

    pub async fn previous(&self) -> RouteOutcome {
        self.handle.command(WalkthroughCommand::Prev).await.into()
    }

    pub async fn jump_to_step(&self, index: usize) -> RouteOutcome {
        self.handle
            .command(WalkthroughCommand::JumpTo { index })
            .await
            .into()
    }

    pub async fn retry(&self) -> RouteOutcome {
        self.handle.command(WalkthroughCommand::Retry).await.into()
    }

    pub async fn restart(&self) -> RouteOutcome {
        self.jump_to_step(0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlaybackConfig;
    use crate::machine::{dispatch, SessionEvent};
    use crate::workflow::{
        ActionType, PageContext, SelectorSet, Step, Workflow,
    };

    fn step(number: u32, url: Option<&str>) -> Step {
        Step {
            step_number: number,
            action_type: ActionType::Click,
            selectors: SelectorSet {
                primary: Some(format!("#s{}", number)),
                ..SelectorSet::default()
            },
            element_meta: None,
            page_context: url.map(|url| PageContext {
                url: url.to_string(),
                title: None,
            }),
            action_data: None,
            instruction: None,
            healed_selector: None,
        }
    }

    fn active_state(steps: Vec<Step>) -> WalkthroughState {
        let config = PlaybackConfig::default();
        let state = dispatch(
            WalkthroughState::idle(),
            &SessionEvent::Start {
                session_id: "s".into(),
                workflow_id: "wf".into(),
                tab_id: 1,
            },
            0,
            &config,
        )
        .state;
        dispatch(
            state,
            &SessionEvent::DataLoaded {
                workflow: Workflow {
                    id: "wf".into(),
                    name: "wf".into(),
                    starting_url: "https://a.test/x".into(),
                    steps,
                },
            },
            0,
            &config,
        )
        .state
    }

    #[test]
    fn no_session_refused() {
        let plan = plan_jump(&WalkthroughState::idle(), 0, None);
        assert_eq!(plan, RoutePlan::Refuse(RouteRefusal::NoSession));
    }

    #[test]
    fn out_of_range_refused() {
        let state = active_state(vec![step(1, Some("https://a.test/x"))]);
        let plan = plan_jump(&state, 3, Some("https://a.test/x"));
        assert_eq!(plan, RoutePlan::Refuse(RouteRefusal::InvalidIndex));
    }

    #[test]
    fn jump_to_shown_step_refused_as_same_step() {
        let state = active_state(vec![step(1, Some("https://a.test/x"))]);
        let plan = plan_jump(&state, 0, Some("https://a.test/x"));
        assert_eq!(plan, RoutePlan::Refuse(RouteRefusal::SameStep));
    }

    #[test]
    fn matching_url_jumps_in_place() {
        let state = active_state(vec![
            step(1, Some("https://a.test/x")),
            step(2, Some("https://a.test/x")),
        ]);
        let plan = plan_jump(&state, 1, Some("https://a.test/x?tab=2"));
        assert_eq!(
            plan,
            RoutePlan::Jump {
                index: 1,
                navigate_to: None
            }
        );
    }

    #[test]
    fn cross_page_jump_carries_target() {
        let state = active_state(vec![
            step(1, Some("https://a.test/x")),
            step(2, Some("https://a.test/y")),
        ]);
        let plan = plan_jump(&state, 1, Some("https://a.test/x"));
        assert_eq!(
            plan,
            RoutePlan::Jump {
                index: 1,
                navigate_to: Some("https://a.test/y".into())
            }
        );
    }

    #[test]
    fn root_recorded_url_matches_any_same_origin_path() {
        let state = active_state(vec![
            step(1, Some("https://a.test/")),
            step(2, Some("https://a.test/")),
        ]);
        let plan = plan_jump(&state, 1, Some("https://a.test/search?q=foo"));
        assert_eq!(
            plan,
            RoutePlan::Jump {
                index: 1,
                navigate_to: None
            }
        );
    }

    #[test]
    fn unrecorded_step_url_off_origin_is_refused() {
        let state = active_state(vec![
            step(1, Some("https://a.test/x")),
            step(2, None),
        ]);
        let plan = plan_jump(&state, 1, Some("https://elsewhere.test/"));
        assert_eq!(plan, RoutePlan::Refuse(RouteRefusal::NoTargetUrl));
    }
}
