pub mod state;
pub mod test_objects;

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
pub use state::{
    urn_name, Checkpoint, Deployment, Mutation, MutationAction, ResourceRecord, StateBlob,
    STACK_RESOURCE_TYPE,
};
use stelvio_utils::now_iso8601;
use strum::{AsRefStr, EnumString};

const UPDATE_ID_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// Identifies one operation attempt. Names the scratch directory, the update
/// record and the snapshot of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct UpdateId(String);

impl UpdateId {
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(20, &UPDATE_ID_ALPHABET))
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UpdateId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// CLI commands that open a run against the state of an (app, env).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, EnumString, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Command {
    Diff,
    Deploy,
    Refresh,
    Destroy,
    Outputs,
    Unlock,
    History,
    StateList,
    StateRm,
    StateRepair,
}

impl Command {
    /// Command name recorded in the lock, or `None` for commands that only
    /// read state.
    pub fn lock_as(&self) -> Option<&str> {
        match self {
            Command::Deploy |
            Command::Refresh |
            Command::Destroy |
            Command::StateRm |
            Command::StateRepair => Some(self.as_ref()),
            Command::Diff |
            Command::Outputs |
            Command::Unlock |
            Command::History |
            Command::StateList => None,
        }
    }

    /// Whether a run of this command works on a local copy of the remote
    /// state. Lock and ledger maintenance must work even when the state blob
    /// is unreadable.
    pub fn reads_state(&self) -> bool {
        !matches!(self, Command::Unlock | Command::History)
    }
}

/// Blob store keys for one (app, env).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateKeys {
    pub app: String,
    pub env: String,
}

impl StateKeys {
    pub fn new(app: &str, env: &str) -> Self {
        Self {
            app: app.to_string(),
            env: env.to_string(),
        }
    }

    pub fn state(&self) -> String {
        format!("state/{}/{}.json", self.app, self.env)
    }

    pub fn lock(&self) -> String {
        format!("lock/{}/{}.json", self.app, self.env)
    }

    pub fn snapshot_prefix(&self) -> String {
        format!("snapshot/{}/{}", self.app, self.env)
    }

    pub fn snapshot(&self, update_id: &UpdateId) -> String {
        format!("{}/{}.json", self.snapshot_prefix(), update_id)
    }

    pub fn update_prefix(&self) -> String {
        format!("update/{}/{}", self.app, self.env)
    }

    pub fn update(&self, update_id: &UpdateId) -> String {
        format!("{}/{}.json", self.update_prefix(), update_id)
    }
}

/// The lock blob. Its existence is the lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    pub created: String,
    pub update_id: UpdateId,
    pub command: String,
    pub run_id: Option<String>,
}

impl LockRecord {
    pub fn new(update_id: UpdateId, command: &str, run_id: Option<String>) -> Self {
        Self {
            created: now_iso8601(),
            update_id,
            command: command.to_string(),
            run_id,
        }
    }
}

/// Ledger entry for one operation attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateRecord {
    pub id: UpdateId,
    pub command: String,
    pub run_id: Option<String>,
    pub time_started: String,
    pub time_completed: Option<String>,
    pub errors: Option<Vec<String>>,
}

impl UpdateRecord {
    pub fn started(id: UpdateId, command: &str, run_id: Option<String>) -> Self {
        Self {
            id,
            command: command.to_string(),
            run_id,
            time_started: now_iso8601(),
            time_completed: None,
            errors: None,
        }
    }

    pub fn complete(&mut self, errors: Option<Vec<String>>) {
        self.time_completed = Some(now_iso8601());
        self.errors = errors;
    }

    pub fn is_complete(&self) -> bool {
        self.time_completed.is_some()
    }

    pub fn failed(&self) -> bool {
        self.errors.as_ref().is_some_and(|errors| !errors.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_state_keys() {
        let keys = StateKeys::new("shop", "dev");
        let update_id = UpdateId::from("u1");
        assert_eq!(keys.state(), "state/shop/dev.json");
        assert_eq!(keys.lock(), "lock/shop/dev.json");
        assert_eq!(keys.snapshot(&update_id), "snapshot/shop/dev/u1.json");
        assert_eq!(keys.update(&update_id), "update/shop/dev/u1.json");
    }

    #[test]
    fn test_update_id_is_url_safe() {
        let id = UpdateId::generate();
        assert_eq!(id.get().len(), 20);
        assert!(stelvio_utils::is_url_safe(id.get()));
        assert_ne!(id, UpdateId::generate());
    }

    #[test]
    fn test_command_lock_as() {
        assert_eq!(Command::Deploy.lock_as(), Some("deploy"));
        assert_eq!(Command::StateRepair.lock_as(), Some("state-repair"));
        assert_eq!(Command::Diff.lock_as(), None);
        assert_eq!(Command::Outputs.lock_as(), None);
        assert_eq!(Command::from_str("state-rm").unwrap(), Command::StateRm);
        assert!(!Command::Unlock.reads_state());
        assert!(Command::StateList.reads_state());
    }

    #[test]
    fn test_lock_record_json() {
        let lock = LockRecord::new(UpdateId::from("u1"), "deploy", None);
        let json = serde_json::to_value(&lock).unwrap();
        assert_eq!(json["update_id"], "u1");
        assert_eq!(json["command"], "deploy");
        assert!(json["run_id"].is_null());
        assert!(json["created"].is_string());
    }

    #[test]
    fn test_update_record_complete() {
        let mut record = UpdateRecord::started(UpdateId::from("u1"), "deploy", Some("r1".into()));
        let json = serde_json::to_value(&record).unwrap();
        assert!(json["time_completed"].is_null());
        assert!(json["errors"].is_null());
        assert!(!record.is_complete());

        record.complete(Some(vec!["boom".to_string()]));
        assert!(record.is_complete());
        assert!(record.failed());
    }
}
