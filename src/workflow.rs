use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A recorded workflow: the ordered steps of one user journey, as captured
/// by the recorder and served back for playback.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub starting_url: String,
    pub steps: Vec<Step>,
}

/// One recorded user action plus everything needed to replay it: where the
/// element was, how it looked, and what the user did to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_number: u32,
    pub action_type: ActionType,
    pub selectors: SelectorSet,
    #[serde(default)]
    pub element_meta: Option<ElementMeta>,
    #[serde(default)]
    pub page_context: Option<PageContext>,
    #[serde(default)]
    pub action_data: Option<ActionData>,
    /// Pre-computed coaching text shown in the tooltip, if the recorder
    /// produced one.
    #[serde(default)]
    pub instruction: Option<String>,
    /// Selector override written back after a successful heal.
    #[serde(default)]
    pub healed_selector: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Click,
    InputCommit,
    SelectChange,
    Submit,
    Navigate,
    Copy,
    Cut,
    Paste,
}

impl ActionType {
    /// Clipboard actions share one detection path: a document-level
    /// capture listener for the matching clipboard event.
    pub fn is_clipboard(self) -> bool {
        matches!(self, ActionType::Copy | ActionType::Cut | ActionType::Paste)
    }
}

/// Recorded selectors in order of preference. The primary selector is
/// whatever the recorder judged most stable (id, data-testid or name).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectorSet {
    #[serde(default)]
    pub primary: Option<String>,
    #[serde(default)]
    pub css: Option<String>,
    #[serde(default)]
    pub xpath: Option<String>,
    #[serde(default)]
    pub data_testid: Option<String>,
    /// Stable attributes compounded into a query of last resort.
    #[serde(default)]
    pub stable_attributes: BTreeMap<String, String>,
}

impl SelectorSet {
    /// Candidate selectors in lookup order. A healed override, when
    /// present, is tried before everything the recorder captured.
    pub fn candidates(
        &self,
        healed: Option<&String>,
    ) -> Vec<(SelectorKind, String)> {
        let mut out = Vec::new();
        if let Some(healed) = healed {
            out.push((SelectorKind::Css, healed.clone()));
        }
        if let Some(primary) = &self.primary {
            out.push((SelectorKind::Css, primary.clone()));
        }
        if let Some(testid) = &self.data_testid {
            out.push((
                SelectorKind::Css,
                format!("[data-testid=\"{}\"]", testid),
            ));
        }
        if let Some(css) = &self.css {
            out.push((SelectorKind::Css, css.clone()));
        }
        if let Some(xpath) = &self.xpath {
            out.push((SelectorKind::XPath, xpath.clone()));
        }
        if !self.stable_attributes.is_empty() {
            let compound = self
                .stable_attributes
                .iter()
                .map(|(name, value)| format!("[{}=\"{}\"]", name, value))
                .collect::<String>();
            out.push((SelectorKind::Css, compound));
        }
        out
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    Css,
    XPath,
}

/// Recorded element fingerprint, used for display and handed to the
/// healer verbatim when the selectors stop matching.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementMeta {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub bounding_box: Option<BoundingBox>,
    #[serde(default)]
    pub parent_chain: Vec<String>,
    #[serde(default)]
    pub form_context: Option<String>,
    #[serde(default)]
    pub visual_region: Option<String>,
    #[serde(default)]
    pub nearby_landmarks: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContext {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Per-action recorded payload, keyed by the step's action type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionData {
    /// Value the user committed into the field, when the recorder kept it.
    InputCommit { committed_value: Option<String> },
    SelectChange {
        selected_value: Option<String>,
        selected_label: Option<String>,
    },
    /// Preview of the clipboard text; `truncated` marks a cut-off preview
    /// so validation falls back to prefix matching.
    Clipboard {
        preview: Option<String>,
        #[serde(default)]
        truncated: bool,
    },
    Navigate { target_url: Option<String> },
}

impl Workflow {
    pub fn validate(&self) -> Result<()> {
        for (index, step) in self.steps.iter().enumerate() {
            if step.selectors.candidates(None).is_empty()
                && !matches!(step.action_type, ActionType::Navigate)
            {
                bail!(
                    "step {} ({:?}) has no selectors",
                    index,
                    step.action_type
                );
            }
        }
        Ok(())
    }
}

/// Where workflows come from during INITIALIZING. The dashboard backend
/// in production; a file or a fixture in this crate.
#[async_trait]
pub trait WorkflowSource: Send + Sync {
    async fn fetch(&self, workflow_id: &str) -> Result<Workflow>;
}

/// Loads `<dir>/<workflow_id>.json`, or the file itself when constructed
/// with a path to a single workflow file.
pub struct FileWorkflowSource {
    path: PathBuf,
}

impl FileWorkflowSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileWorkflowSource { path: path.into() }
    }

    fn resolve(&self, workflow_id: &str) -> PathBuf {
        if self.path.is_dir() {
            self.path.join(format!("{}.json", workflow_id))
        } else {
            self.path.clone()
        }
    }
}

#[async_trait]
impl WorkflowSource for FileWorkflowSource {
    async fn fetch(&self, workflow_id: &str) -> Result<Workflow> {
        let path = self.resolve(workflow_id);
        let contents =
            tokio::fs::read_to_string(&path).await.with_context(|| {
                format!("reading workflow {}", path.display())
            })?;
        let workflow: Workflow = serde_json::from_str(&contents)
            .with_context(|| format!("parsing workflow {}", path.display()))?;
        workflow.validate()?;
        Ok(workflow)
    }
}

/// Fixture source for tests and embedders.
pub struct StaticWorkflowSource {
    workflows: Vec<Workflow>,
}

impl StaticWorkflowSource {
    pub fn new(workflows: Vec<Workflow>) -> Self {
        StaticWorkflowSource { workflows }
    }
}

#[async_trait]
impl WorkflowSource for StaticWorkflowSource {
    async fn fetch(&self, workflow_id: &str) -> Result<Workflow> {
        self.workflows
            .iter()
            .find(|workflow| workflow.id == workflow_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown workflow {}", workflow_id))
    }
}

pub fn load_workflow_file(path: &Path) -> Result<Workflow> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading workflow {}", path.display()))?;
    let workflow: Workflow = serde_json::from_str(&contents)
        .with_context(|| format!("parsing workflow {}", path.display()))?;
    workflow.validate()?;
    Ok(workflow)
}
