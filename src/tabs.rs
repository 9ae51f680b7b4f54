use crate::coordinator::CoordinatorHandle;
use crate::machine::state::TabId;

/// Read-through tab queries and the tab-close rule: closing the primary
/// tab ends the session, closing any other tab only trims membership.
#[derive(Clone)]
pub struct TabManager {
    handle: CoordinatorHandle,
}

impl TabManager {
    pub fn new(handle: CoordinatorHandle) -> Self {
        TabManager { handle }
    }

    pub async fn on_tab_opened(&self, tab_id: TabId) {
        self.handle.add_tab(tab_id).await;
    }

    pub async fn on_tab_closed(&self, tab_id: TabId) {
        self.handle.remove_tab(tab_id).await;
    }

    pub fn primary_tab(&self) -> Option<TabId> {
        self.handle.state().tabs.primary_tab_id
    }

    pub fn all_tabs(&self) -> Vec<TabId> {
        self.handle.state().tabs.active_tab_ids
    }

    pub fn is_session_tab(&self, tab_id: TabId) -> bool {
        self.handle.state().tabs.active_tab_ids.contains(&tab_id)
    }
}
