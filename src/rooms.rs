// Provisioning collaborator for per-session chat rooms.
//
// The engine only ever creates rooms and deletes them again during cleanup;
// everything else about the chat platform stays outside the core. Failures
// are logged by callers and never abort the surrounding operation.

use async_trait::async_trait;

use crate::session::ParticipantId;

#[async_trait]
pub trait RoomProvider: Send + Sync {
    /// Create a room restricted to `members` and return its identifier.
    async fn create(&self, name: &str, members: &[ParticipantId]) -> anyhow::Result<String>;

    /// Delete a previously created room. Deleting a room that is already
    /// gone must be treated as success.
    async fn delete(&self, room_id: &str) -> anyhow::Result<()>;
}

/// Provider for deployments without a chat backend. Creation hands out
/// synthetic ids so the rest of the engine behaves identically.
pub struct NoopRooms;

#[async_trait]
impl RoomProvider for NoopRooms {
    async fn create(&self, name: &str, _members: &[ParticipantId]) -> anyhow::Result<String> {
        Ok(format!("noop-{name}"))
    }

    async fn delete(&self, _room_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use anyhow::bail;

    use super::*;

    /// In-memory provider that records calls and can fail on demand.
    #[derive(Default)]
    pub struct RecordingRooms {
        pub created: Mutex<Vec<String>>,
        pub deleted: Mutex<Vec<String>>,
        pub fail_deletes: Mutex<bool>,
    }

    impl RecordingRooms {
        pub fn created_names(&self) -> Vec<String> {
            self.created.lock().unwrap().clone()
        }

        pub fn deleted_ids(&self) -> Vec<String> {
            self.deleted.lock().unwrap().clone()
        }

        pub fn set_fail_deletes(&self, fail: bool) {
            *self.fail_deletes.lock().unwrap() = fail;
        }
    }

    #[async_trait]
    impl RoomProvider for RecordingRooms {
        async fn create(&self, name: &str, _members: &[ParticipantId]) -> anyhow::Result<String> {
            let mut created = self.created.lock().unwrap();
            created.push(name.to_string());
            Ok(format!("room-{}", created.len()))
        }

        async fn delete(&self, room_id: &str) -> anyhow::Result<()> {
            if *self.fail_deletes.lock().unwrap() {
                bail!("room backend unavailable");
            }
            self.deleted.lock().unwrap().push(room_id.to_string());
            Ok(())
        }
    }
}
