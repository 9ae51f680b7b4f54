use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;

use crate::config::PlaybackConfig;
use crate::coordinator::CoordinatorHandle;
use crate::host::{Host, HostEvent};
use crate::machine::state::NAVIGATION_TIMEOUT_ALARM;
use crate::machine::{MachineState, SessionEvent};
use crate::url::is_restricted;

/// Watches the host's navigation stream for the primary tab and maps it
/// onto machine events. The page-load deadline lives in a host alarm,
/// not a timer, so it survives a coordinator restart.
pub struct NavigationWatcher {
    handle: CoordinatorHandle,
    host: Arc<dyn Host>,
    config: PlaybackConfig,
}

impl NavigationWatcher {
    pub fn new(
        handle: CoordinatorHandle,
        host: Arc<dyn Host>,
        config: PlaybackConfig,
    ) -> Self {
        NavigationWatcher {
            handle,
            host,
            config,
        }
    }

    /// Restart recovery. If the restored session is mid-navigation the
    /// deadline may already have passed while the coordinator was gone;
    /// fire it now, or re-arm the alarm for the remaining interval.
    pub async fn initialize(&self) -> Result<()> {
        let state = self.handle.state();
        if state.machine_state != MachineState::Navigating {
            return Ok(());
        }
        let Some(started_at) = state.navigation.started_at else {
            return Ok(());
        };
        let now = self.host.now_ms();
        let elapsed = now.saturating_sub(started_at);
        if elapsed >= self.config.navigation_timeout_ms {
            log::info!(
                "navigation deadline passed during restart ({}ms elapsed)",
                elapsed
            );
            self.handle.dispatch(SessionEvent::NavigationTimeout).await?;
        } else {
            let remaining = self.config.navigation_timeout_ms - elapsed;
            self.host
                .arm_alarm(
                    NAVIGATION_TIMEOUT_ALARM,
                    std::time::Duration::from_millis(remaining),
                )
                .await?;
            log::debug!("re-armed navigation alarm for {}ms", remaining);
        }
        Ok(())
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        // Subscribe before the task is scheduled so nothing emitted in
        // the meantime is missed.
        let mut events = self.host.host_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => self.handle_event(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!(
                            "navigation watcher lagged, {} events dropped",
                            missed
                        );
                    }
                    Err(RecvError::Closed) => {
                        log::debug!("host event stream closed");
                        break;
                    }
                }
            }
        })
    }

    async fn handle_event(&self, event: HostEvent) {
        match event {
            HostEvent::NavigationStarted {
                tab_id,
                url,
                main_frame,
            } => {
                if !main_frame || !self.is_primary(tab_id) {
                    return;
                }
                if is_restricted(&url) {
                    // Dead zone: the machine stays where it is and the
                    // user finds their own way back.
                    log::debug!("suppressing restricted url {}", url);
                    return;
                }
                if let Err(error) = self
                    .handle
                    .dispatch(SessionEvent::UrlChanged { tab_id, url })
                    .await
                {
                    log::error!("URL_CHANGED dispatch failed: {}", error);
                    return;
                }
                if let Err(error) = self
                    .host
                    .arm_alarm(
                        NAVIGATION_TIMEOUT_ALARM,
                        self.config.navigation_timeout(),
                    )
                    .await
                {
                    log::error!("arming navigation alarm failed: {}", error);
                }
            }
            HostEvent::NavigationCompleted { tab_id } => {
                if !self.is_primary(tab_id) {
                    return;
                }
                if let Err(error) =
                    self.host.cancel_alarm(NAVIGATION_TIMEOUT_ALARM).await
                {
                    log::warn!("cancelling navigation alarm failed: {}", error);
                }
                if let Err(error) = self
                    .handle
                    .dispatch(SessionEvent::PageLoaded { tab_id })
                    .await
                {
                    log::error!("PAGE_LOADED dispatch failed: {}", error);
                }
            }
            HostEvent::NavigationFailed { tab_id, error } => {
                if !self.is_primary(tab_id) {
                    return;
                }
                log::warn!("navigation failed in tab {}: {}", tab_id, error);
                let _ =
                    self.host.cancel_alarm(NAVIGATION_TIMEOUT_ALARM).await;
                if self.handle.state().machine_state
                    == MachineState::Navigating
                {
                    let _ = self
                        .handle
                        .dispatch(SessionEvent::NavigationTimeout)
                        .await;
                }
            }
            HostEvent::AlarmFired { name } => {
                if name != NAVIGATION_TIMEOUT_ALARM {
                    return;
                }
                if self.handle.state().machine_state
                    == MachineState::Navigating
                {
                    let _ = self
                        .handle
                        .dispatch(SessionEvent::NavigationTimeout)
                        .await;
                }
            }
            HostEvent::TabClosed { tab_id } => {
                self.handle.remove_tab(tab_id).await;
            }
        }
    }

    fn is_primary(&self, tab_id: crate::machine::state::TabId) -> bool {
        let state = self.handle.state();
        state.is_active() && state.tabs.primary_tab_id == Some(tab_id)
    }
}
