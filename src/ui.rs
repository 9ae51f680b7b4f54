use async_trait::async_trait;

use crate::host::ElementHandle;
use crate::machine::state::ErrorInfo;
use crate::workflow::Step;

/// User's answer to a medium-confidence heal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HealConfirmation {
    Confirmed,
    Rejected,
}

/// What the user picked on the error screen. `Dismiss` means the UI
/// could not collect a choice (headless runs).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorChoice {
    Retry,
    Skip,
    Exit,
    Dismiss,
}

/// The visual overlay: spotlight, tooltip, healing indicator, error
/// panel. Rendering is an external collaborator; the controller only
/// talks to this interface.
#[async_trait]
pub trait WalkthroughUi: Send + Sync {
    async fn show_step(&self, element: &ElementHandle, step: &Step);

    async fn show_healing(&self);

    /// Confirmation prompt for a medium-confidence heal.
    async fn show_healed_element(
        &self,
        candidate: &ElementHandle,
        confidence: f64,
    ) -> HealConfirmation;

    /// `can_retry` is false for terminal errors, where the only offer
    /// is EXIT.
    async fn show_error(
        &self,
        error: &ErrorInfo,
        can_retry: bool,
    ) -> ErrorChoice;

    async fn show_completed(&self);

    /// Toast-style feedback after the interceptor swallowed a click.
    async fn notify_click_blocked(&self);

    async fn destroy(&self);
}

/// Log-only UI for the CLI and tests: every callback becomes a log line
/// and choices resolve to fixed answers.
pub struct ConsoleUi {
    pub confirm_heals: bool,
    pub error_choice: ErrorChoice,
}

impl Default for ConsoleUi {
    fn default() -> Self {
        ConsoleUi {
            confirm_heals: true,
            error_choice: ErrorChoice::Exit,
        }
    }
}

#[async_trait]
impl WalkthroughUi for ConsoleUi {
    async fn show_step(&self, element: &ElementHandle, step: &Step) {
        let instruction = step
            .instruction
            .as_deref()
            .unwrap_or("perform the highlighted action");
        log::info!(
            "step {}: {} <{}> {}",
            step.step_number,
            instruction,
            element.tag,
            element.text.as_deref().unwrap_or(""),
        );
    }

    async fn show_healing(&self) {
        log::info!("looking for a replacement element...");
    }

    async fn show_healed_element(
        &self,
        candidate: &ElementHandle,
        confidence: f64,
    ) -> HealConfirmation {
        log::info!(
            "healed candidate <{}> at {:.0}% confidence",
            candidate.tag,
            confidence * 100.0
        );
        if self.confirm_heals {
            HealConfirmation::Confirmed
        } else {
            HealConfirmation::Rejected
        }
    }

    async fn show_error(
        &self,
        error: &ErrorInfo,
        can_retry: bool,
    ) -> ErrorChoice {
        log::error!(
            "walkthrough error {:?}: {} (retryable: {})",
            error.error_type,
            error.message,
            can_retry
        );
        if can_retry {
            self.error_choice
        } else {
            ErrorChoice::Exit
        }
    }

    async fn show_completed(&self) {
        log::info!("walkthrough completed");
    }

    async fn notify_click_blocked(&self) {
        log::info!("that's not the highlighted element, click the target");
    }

    async fn destroy(&self) {}
}
