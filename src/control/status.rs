use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
  #[default]
  Idle,
  Syncing,
  Error,
}

/// Connectivity and sync state observed by the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
  pub is_online: bool,
  pub is_offline: bool,
  pub last_online_timestamp: Option<i64>,
  pub connection_type: Option<String>,
  pub sync_status: SyncStatus,
  pub pending_count: u64,
}

impl Default for ConnectionStatus {
  /// Unknown connectivity counts as offline until the first probe answers.
  fn default() -> Self {
    Self {
      is_online: false,
      is_offline: true,
      last_online_timestamp: None,
      connection_type: None,
      sync_status: SyncStatus::Idle,
      pending_count: 0,
    }
  }
}

impl ConnectionStatus {
  /// Returns true when this is a transition from offline.
  pub fn mark_online(&mut self, connection_type: Option<String>, now: i64) -> bool {
    let came_online = !self.is_online;
    self.is_online = true;
    self.is_offline = false;
    self.last_online_timestamp = Some(now);
    if connection_type.is_some() {
      self.connection_type = connection_type;
    }
    came_online
  }

  /// Returns true when this is a transition from online.
  pub fn mark_offline(&mut self) -> bool {
    let went_offline = self.is_online;
    self.is_online = false;
    self.is_offline = true;
    went_offline
  }
}
