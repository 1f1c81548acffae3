//! Membership lookups used for fan-out to computed recipient sets.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

/// Directory lookup errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The server or conversation is unknown.
    #[error("Not found: {0}")]
    NotFound(Uuid),

    /// The backing store failed.
    #[error("Directory backend error: {0}")]
    Backend(String),
}

/// Resolves who should see server, DM and presence events.
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    /// All members of a server.
    async fn server_member_ids(&self, server_id: Uuid) -> Result<Vec<Uuid>, DirectoryError>;

    /// All participants of a DM conversation.
    async fn dm_participant_ids(&self, conversation_id: Uuid)
        -> Result<Vec<Uuid>, DirectoryError>;

    /// Distinct users sharing at least one server with `user_id`, excluding `user_id`.
    async fn co_member_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>, DirectoryError>;
}

/// A directory held in memory.
///
/// Backs tests and deployments where membership is pushed in rather than
/// queried.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    servers: DashMap<Uuid, HashSet<Uuid>>,
    conversations: DashMap<Uuid, HashSet<Uuid>>,
}

impl InMemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user to a server.
    pub fn add_server_member(&self, server_id: Uuid, user_id: Uuid) {
        self.servers.entry(server_id).or_default().insert(user_id);
    }

    /// Remove a user from a server.
    pub fn remove_server_member(&self, server_id: Uuid, user_id: Uuid) {
        if let Some(mut members) = self.servers.get_mut(&server_id) {
            members.remove(&user_id);
        }
        self.servers.remove_if(&server_id, |_, members| members.is_empty());
    }

    /// Set the participants of a DM conversation.
    pub fn set_conversation(
        &self,
        conversation_id: Uuid,
        participants: impl IntoIterator<Item = Uuid>,
    ) {
        self.conversations
            .insert(conversation_id, participants.into_iter().collect());
    }
}

#[async_trait]
impl MemberDirectory for InMemoryDirectory {
    async fn server_member_ids(&self, server_id: Uuid) -> Result<Vec<Uuid>, DirectoryError> {
        self.servers
            .get(&server_id)
            .map(|members| members.iter().copied().collect())
            .ok_or(DirectoryError::NotFound(server_id))
    }

    async fn dm_participant_ids(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<Uuid>, DirectoryError> {
        self.conversations
            .get(&conversation_id)
            .map(|members| members.iter().copied().collect())
            .ok_or(DirectoryError::NotFound(conversation_id))
    }

    async fn co_member_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>, DirectoryError> {
        let mut co_members = HashSet::new();
        for server in self.servers.iter() {
            if server.contains(&user_id) {
                co_members.extend(server.iter().copied());
            }
        }
        co_members.remove(&user_id);
        Ok(co_members.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_co_members_are_distinct() {
        let directory = InMemoryDirectory::new();
        let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (s1, s2) = (Uuid::new_v4(), Uuid::new_v4());

        for user in [a, b, c] {
            directory.add_server_member(s1, user);
        }
        for user in [a, b] {
            directory.add_server_member(s2, user);
        }
        directory.add_server_member(Uuid::new_v4(), d);

        let mut co = directory.co_member_ids(a).await.unwrap();
        co.sort();
        let mut expected = vec![b, c];
        expected.sort();
        assert_eq!(co, expected);
    }

    #[tokio::test]
    async fn test_unknown_server() {
        let directory = InMemoryDirectory::new();
        let server = Uuid::new_v4();
        assert!(matches!(
            directory.server_member_ids(server).await,
            Err(DirectoryError::NotFound(id)) if id == server
        ));

        let user = Uuid::new_v4();
        directory.add_server_member(server, user);
        directory.remove_server_member(server, user);
        assert!(directory.server_member_ids(server).await.is_err());
    }
}
