use std::sync::Arc;

use anyhow::Result;

use crate::host::{ElementHandle, PageDriver};

/// Session-scoped click gate. Enabled once at session start and kept on
/// through HEALING and SHOWING_STEP; scoping it to WAITING_ACTION
/// would leak clicks between steps. The page host does the synchronous
/// blocking; this tracks the allowed target and reports blocked clicks.
pub struct ClickInterceptor {
    page: Arc<dyn PageDriver>,
    enabled: bool,
    target: Option<ElementHandle>,
}

impl ClickInterceptor {
    pub fn new(page: Arc<dyn PageDriver>) -> Self {
        ClickInterceptor {
            page,
            enabled: false,
            target: None,
        }
    }

    pub async fn enable(&mut self) -> Result<()> {
        if self.enabled {
            return Ok(());
        }
        self.page.set_intercept_enabled(true).await?;
        self.enabled = true;
        Ok(())
    }

    pub async fn disable(&mut self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.page.set_intercept_target(None).await?;
        self.page.set_intercept_enabled(false).await?;
        self.enabled = false;
        self.target = None;
        Ok(())
    }

    pub async fn set_target(&mut self, element: &ElementHandle) -> Result<()> {
        self.enable().await?;
        self.page.set_intercept_target(Some(element)).await?;
        self.target = Some(element.clone());
        Ok(())
    }

    /// Leaving WAITING_ACTION: no click is expected until the next step
    /// sets a target, but interception itself stays armed.
    pub async fn clear_target(&mut self) -> Result<()> {
        if self.target.take().is_some() {
            self.page.set_intercept_target(None).await?;
        }
        Ok(())
    }

    /// Feedback for a click the host swallowed: pulse the real target
    /// so the user's eye lands on it.
    pub async fn on_blocked_click(&self) -> Result<()> {
        if let Some(target) = &self.target {
            self.page.pulse(target).await?;
        }
        Ok(())
    }

    pub fn target(&self) -> Option<&ElementHandle> {
        self.target.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}
