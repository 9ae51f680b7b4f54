use crate::host::{ClipboardKind, DomEvent, ElementHandle};
use crate::workflow::{ActionData, ActionType, Step};

/// Why an observed action failed validation. Codes travel in
/// REPORT_ACTION messages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValidationFailure {
    WrongElement,
    WrongAction,
    WrongValue,
    NoValueChange,
    InvalidTarget,
}

impl ValidationFailure {
    pub fn code(self) -> &'static str {
        match self {
            ValidationFailure::WrongElement => "wrong_element",
            ValidationFailure::WrongAction => "wrong_action",
            ValidationFailure::WrongValue => "wrong_value",
            ValidationFailure::NoValueChange => "no_value_change",
            ValidationFailure::InvalidTarget => "invalid_target",
        }
    }
}

/// Verdict for one DOM event while waiting for the step's action.
#[derive(Clone, Debug, PartialEq)]
pub enum Observation {
    /// Not the commit we're waiting for; keep listening.
    Ignored,
    Detected { value: Option<String> },
    Invalid { reason: ValidationFailure },
}

/// Watches the DOM events of the current target and decides when the
/// recorded action happened.
///
/// The baseline is captured at attach time, not on first focus: the
/// user may already be sitting in the field when the step appears. An
/// Enter keydown that changed the value emits immediately and moves the
/// baseline forward, because many sites navigate synchronously on Enter
/// and the focusout would arrive after teardown (or re-emit).
pub struct ActionDetector {
    action: ActionType,
    target: ElementHandle,
    form: Option<ElementHandle>,
    expected_clipboard: Option<(String, bool)>,
    baseline: String,
}

impl ActionDetector {
    pub fn new(
        step: &Step,
        target: ElementHandle,
        form: Option<ElementHandle>,
        baseline: String,
    ) -> Self {
        let expected_clipboard = match &step.action_data {
            Some(ActionData::Clipboard { preview, truncated }) => preview
                .as_ref()
                .map(|preview| (preview.clone(), *truncated)),
            _ => None,
        };
        ActionDetector {
            action: step.action_type,
            target,
            form,
            expected_clipboard,
            baseline,
        }
    }

    pub fn baseline(&self) -> &str {
        &self.baseline
    }

    pub fn observe(&mut self, event: &DomEvent) -> Observation {
        match self.action {
            ActionType::Click => self.observe_click(event),
            ActionType::InputCommit => self.observe_input(event),
            ActionType::SelectChange => self.observe_select(event),
            ActionType::Submit => self.observe_submit(event),
            ActionType::Copy | ActionType::Cut | ActionType::Paste => {
                self.observe_clipboard(event)
            }
            // Navigate steps complete from URL events, never from the
            // detector.
            ActionType::Navigate => Observation::Ignored,
        }
    }

    fn observe_click(&mut self, event: &DomEvent) -> Observation {
        match event {
            DomEvent::Click {
                node_id,
                composed_path,
            } => {
                // Composed-path membership keeps this shadow-DOM safe:
                // the expected element, a descendant, or a shadow host
                // chain through it all count.
                if *node_id == self.target.node_id
                    || composed_path.contains(&self.target.node_id)
                {
                    Observation::Detected { value: None }
                } else {
                    Observation::Invalid {
                        reason: ValidationFailure::WrongElement,
                    }
                }
            }
            _ => Observation::Ignored,
        }
    }

    fn observe_input(&mut self, event: &DomEvent) -> Observation {
        match event {
            DomEvent::FocusIn { value, .. } => {
                self.baseline = value.clone();
                Observation::Ignored
            }
            DomEvent::FocusOut { value, .. } => {
                if *value != self.baseline {
                    self.baseline = value.clone();
                    Observation::Detected {
                        value: Some(value.clone()),
                    }
                } else {
                    Observation::Ignored
                }
            }
            DomEvent::KeyDown {
                key,
                shift_key,
                value,
                in_textarea,
                ..
            } => {
                if key != "Enter" {
                    return Observation::Ignored;
                }
                if *shift_key && *in_textarea {
                    // Shift+Enter is a newline, not a commit.
                    return Observation::Ignored;
                }
                if *value == self.baseline {
                    return Observation::Ignored;
                }
                // Emit now and move the baseline so the trailing
                // focusout can't double-report.
                self.baseline = value.clone();
                Observation::Detected {
                    value: Some(value.clone()),
                }
            }
            _ => Observation::Ignored,
        }
    }

    fn observe_select(&mut self, event: &DomEvent) -> Observation {
        match event {
            DomEvent::Change { value, .. } => {
                if *value == self.baseline {
                    Observation::Invalid {
                        reason: ValidationFailure::NoValueChange,
                    }
                } else {
                    self.baseline = value.clone();
                    Observation::Detected {
                        value: Some(value.clone()),
                    }
                }
            }
            _ => Observation::Ignored,
        }
    }

    fn observe_submit(&mut self, event: &DomEvent) -> Observation {
        match event {
            // Submission's event target is the form, not the button that
            // triggered it, so only the event type matters here.
            DomEvent::Submit { form_node_id } => match &self.form {
                Some(form) if *form_node_id != form.node_id => {
                    Observation::Invalid {
                        reason: ValidationFailure::InvalidTarget,
                    }
                }
                _ => Observation::Detected { value: None },
            },
            _ => Observation::Ignored,
        }
    }

    fn observe_clipboard(&mut self, event: &DomEvent) -> Observation {
        let expected_kind = match self.action {
            ActionType::Copy => ClipboardKind::Copy,
            ActionType::Cut => ClipboardKind::Cut,
            ActionType::Paste => ClipboardKind::Paste,
            _ => return Observation::Ignored,
        };
        match event {
            DomEvent::Clipboard {
                kind,
                clipboard,
                selection,
            } if *kind == expected_kind => {
                let value = clipboard.clone().or_else(|| selection.clone());
                if let Some((preview, truncated)) = &self.expected_clipboard {
                    let Some(value) = value else {
                        return Observation::Invalid {
                            reason: ValidationFailure::WrongValue,
                        };
                    };
                    let matches = if *truncated {
                        value.starts_with(preview.as_str())
                    } else {
                        value == *preview
                    };
                    if matches {
                        Observation::Detected { value: Some(value) }
                    } else {
                        Observation::Invalid {
                            reason: ValidationFailure::WrongValue,
                        }
                    }
                } else {
                    Observation::Detected { value }
                }
            }
            _ => Observation::Ignored,
        }
    }
}
