//! Storage backends for huddle
//!
//! - Memory: process-local store, used by tests and database-less deployments
//! - Postgres: durable storage for users, groups, memberships and messages
//!
//! The policy layer only depends on the [`Store`] contract. Backends never
//! make authorization decisions.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PostgresConfig, PostgresStore};

use crate::model::{Group, GroupId, Message, MessageId, UserId, UserRecord};
pub use async_trait::async_trait;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid reference: {0}")]
    Invalid(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Fields required to create an account
#[derive(Debug, Clone)]
pub struct NewUser {
    pub display_name: String,
    pub email: String,
    pub password_hash: String,
}

/// Exclusive bound on message ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdBound {
    /// `id < n`: older than `n`
    Below(MessageId),
    /// `id > n`: newer than `n`
    Above(MessageId),
}

impl IdBound {
    pub fn admits(&self, id: MessageId) -> bool {
        match *self {
            IdBound::Below(n) => id < n,
            IdBound::Above(n) => id > n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Newest first
    Descending,
    /// Oldest first
    Ascending,
}

/// A bounded, ordered slice of a group's message history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageWindow {
    pub bound: Option<IdBound>,
    pub order: SortOrder,
    pub limit: usize,
}

/// Query/command contract over persisted users, groups and messages
#[async_trait]
pub trait Store: Send + Sync {
    /// Create an account; fails with `Conflict` when the email is taken
    async fn create_user(&self, user: NewUser) -> Result<UserRecord, StorageError>;

    async fn find_user(&self, id: UserId) -> Result<Option<UserRecord>, StorageError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StorageError>;

    /// Replace the password hash without touching the version
    async fn set_password_hash(&self, id: UserId, hash: &str) -> Result<(), StorageError>;

    /// Atomically increment the account version, returning the updated record
    async fn bump_user_version(&self, id: UserId) -> Result<UserRecord, StorageError>;

    async fn add_friend(&self, user_id: UserId, friend_id: UserId) -> Result<(), StorageError>;

    async fn list_friends(&self, user_id: UserId) -> Result<Vec<UserRecord>, StorageError>;

    /// Create a group; every member id must reference an existing user
    async fn create_group(&self, name: &str, member_ids: &[UserId]) -> Result<Group, StorageError>;

    async fn find_group(&self, id: GroupId) -> Result<Option<Group>, StorageError>;

    async fn groups_for_user(&self, user_id: UserId) -> Result<Vec<Group>, StorageError>;

    async fn rename_group(&self, id: GroupId, name: &str) -> Result<Group, StorageError>;

    /// Remove one member, returning the group as it is afterwards
    async fn remove_member(&self, group_id: GroupId, user_id: UserId) -> Result<Group, StorageError>;

    /// Delete a group and all its messages; returns false if it did not exist
    async fn delete_group(&self, id: GroupId) -> Result<bool, StorageError>;

    async fn create_message(
        &self,
        group_id: GroupId,
        author_id: UserId,
        text: &str,
    ) -> Result<Message, StorageError>;

    async fn list_messages(
        &self,
        group_id: GroupId,
        window: MessageWindow,
    ) -> Result<Vec<Message>, StorageError>;

    /// Existence probe for at least one message in `group_id` within `bound`
    async fn message_exists(&self, group_id: GroupId, bound: IdBound) -> Result<bool, StorageError>;

    /// Reachability probe for health checks
    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
