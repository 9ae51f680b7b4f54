use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::PlaybackConfig;
use crate::host::{ElementHandle, PageDriver};
use crate::ui::WalkthroughUi;
use crate::workflow::Step;

/// How a heal was settled.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    HealedAuto,
    HealedAi,
    HealedUser,
    Failed,
}

/// What the healer hands back. `element` is the live candidate the
/// controller adopts as the step's new target; `healed_selector` is the
/// durable override written into state.
#[derive(Clone, Debug)]
pub struct HealingResult {
    pub success: bool,
    pub element: Option<ElementHandle>,
    pub confidence: f64,
    pub resolution: Resolution,
    pub candidates_evaluated: u32,
    pub ai_confidence: Option<f64>,
    pub healed_selector: Option<String>,
    pub failure_reason: Option<String>,
    /// Healer-specific scoring breakdown, opaque to the core.
    pub scoring_result: Option<serde_json::Value>,
    /// Human-readable trail of what the healer tried.
    pub healing_log: Vec<String>,
}

impl HealingResult {
    pub fn failed(reason: impl Into<String>, candidates: u32) -> Self {
        HealingResult {
            success: false,
            element: None,
            confidence: 0.0,
            resolution: Resolution::Failed,
            candidates_evaluated: candidates,
            ai_confidence: None,
            healed_selector: None,
            failure_reason: Some(reason.into()),
            scoring_result: None,
            healing_log: Vec::new(),
        }
    }
}

/// Hooks the core wires for the healer: user confirmation goes to the
/// walkthrough UI, AI validation to whatever external service the
/// embedder configured.
pub struct HealContext<'a> {
    pub config: &'a PlaybackConfig,
    pub ai: Option<&'a dyn AiValidator>,
    pub ui: &'a dyn WalkthroughUi,
}

#[async_trait]
pub trait AiValidator: Send + Sync {
    /// Returns the AI's confidence that the candidate matches the
    /// recorded element, or None when the service declines to judge.
    async fn validate(
        &self,
        step: &Step,
        candidate: &ElementHandle,
        score: f64,
    ) -> Result<Option<f64>>;
}

/// External selector-recovery engine. The core passes the step verbatim
/// and consumes the result; scoring strategy is the healer's business.
#[async_trait]
pub trait Healer: Send + Sync {
    async fn heal_element(
        &self,
        page: &dyn PageDriver,
        step: &Step,
        context: HealContext<'_>,
    ) -> Result<HealingResult>;
}

/// What the confidence policy says to do with a scored candidate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HealDecision {
    AutoAccept,
    /// Consult the AI validator first when one is wired; its answer can
    /// lift the candidate over the bar.
    ConsultAi,
    /// Candidate is plausible but the user has to confirm it.
    AskUser,
    Reject,
}

/// The shared confidence policy: auto-accept at or above HIGH, AI
/// consultation between MEDIUM_HIGH and HIGH, user confirmation between
/// MEDIUM and MEDIUM_HIGH, rejection below MEDIUM.
pub fn decide(config: &PlaybackConfig, confidence: f64) -> HealDecision {
    if confidence >= config.healing_confidence_high {
        HealDecision::AutoAccept
    } else if confidence >= config.healing_confidence_medium_high {
        HealDecision::ConsultAi
    } else if confidence >= config.healing_confidence_medium {
        HealDecision::AskUser
    } else {
        HealDecision::Reject
    }
}

/// Healer that never finds anything. Used when no recovery engine is
/// configured; ELEMENT_NOT_FOUND then goes straight to the error UI.
pub struct NoHealer;

#[async_trait]
impl Healer for NoHealer {
    async fn heal_element(
        &self,
        _page: &dyn PageDriver,
        _step: &Step,
        _context: HealContext<'_>,
    ) -> Result<HealingResult> {
        Ok(HealingResult::failed("no healer configured", 0))
    }
}
