//! In-memory store
//!
//! All tables live behind one lock so multi-row commands (group delete with
//! message cascade, membership removal) are atomic.

use crate::model::{Group, GroupId, Message, MessageId, UserId, UserRecord};
use crate::storage::{IdBound, MessageWindow, NewUser, SortOrder, Store, StorageError};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Default)]
struct Tables {
    users: BTreeMap<UserId, UserRecord>,
    emails: HashMap<String, UserId>,
    friends: BTreeMap<UserId, BTreeSet<UserId>>,
    groups: BTreeMap<GroupId, Group>,
    /// Ordered by id, so range scans give history order for free
    messages: BTreeMap<MessageId, Message>,
    next_user_id: i64,
    next_group_id: i64,
    next_message_id: i64,
}

impl Tables {
    fn next_id(counter: &mut i64) -> i64 {
        *counter += 1;
        *counter
    }
}

/// Process-local [`Store`] implementation
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently stored (all groups)
    pub fn message_count(&self) -> usize {
        self.tables.read().messages.len()
    }
}

fn user_not_found(id: UserId) -> StorageError {
    StorageError::NotFound(format!("user {} does not exist", id))
}

fn group_not_found(id: GroupId) -> StorageError {
    StorageError::NotFound(format!("group {} does not exist", id))
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_user(&self, user: NewUser) -> Result<UserRecord, StorageError> {
        let mut t = self.tables.write();
        let email_key = user.email.to_lowercase();
        if t.emails.contains_key(&email_key) {
            return Err(StorageError::Conflict(format!(
                "email {} is already registered",
                user.email
            )));
        }

        let id = Tables::next_id(&mut t.next_user_id);
        let record = UserRecord {
            id,
            display_name: user.display_name,
            email: user.email,
            password_hash: user.password_hash,
            version: 1,
            created_at: Utc::now(),
        };
        t.emails.insert(email_key, id);
        t.users.insert(id, record.clone());
        Ok(record)
    }

    async fn find_user(&self, id: UserId) -> Result<Option<UserRecord>, StorageError> {
        Ok(self.tables.read().users.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StorageError> {
        let t = self.tables.read();
        Ok(t
            .emails
            .get(&email.to_lowercase())
            .and_then(|id| t.users.get(id))
            .cloned())
    }

    async fn set_password_hash(&self, id: UserId, hash: &str) -> Result<(), StorageError> {
        let mut t = self.tables.write();
        let user = t.users.get_mut(&id).ok_or_else(|| user_not_found(id))?;
        user.password_hash = hash.to_string();
        Ok(())
    }

    async fn bump_user_version(&self, id: UserId) -> Result<UserRecord, StorageError> {
        let mut t = self.tables.write();
        let user = t.users.get_mut(&id).ok_or_else(|| user_not_found(id))?;
        user.version += 1;
        Ok(user.clone())
    }

    async fn add_friend(&self, user_id: UserId, friend_id: UserId) -> Result<(), StorageError> {
        let mut t = self.tables.write();
        if !t.users.contains_key(&user_id) {
            return Err(user_not_found(user_id));
        }
        if !t.users.contains_key(&friend_id) {
            return Err(StorageError::Invalid(format!("user {} does not exist", friend_id)));
        }
        t.friends.entry(user_id).or_default().insert(friend_id);
        Ok(())
    }

    async fn list_friends(&self, user_id: UserId) -> Result<Vec<UserRecord>, StorageError> {
        let t = self.tables.read();
        Ok(t
            .friends
            .get(&user_id)
            .map(|ids| ids.iter().filter_map(|id| t.users.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn create_group(&self, name: &str, member_ids: &[UserId]) -> Result<Group, StorageError> {
        let mut t = self.tables.write();
        if let Some(missing) = member_ids.iter().find(|id| !t.users.contains_key(id)) {
            return Err(StorageError::Invalid(format!("user {} does not exist", missing)));
        }

        let id = Tables::next_id(&mut t.next_group_id);
        let group = Group {
            id,
            name: name.to_string(),
            member_ids: member_ids.iter().copied().collect(),
            created_at: Utc::now(),
        };
        t.groups.insert(id, group.clone());
        Ok(group)
    }

    async fn find_group(&self, id: GroupId) -> Result<Option<Group>, StorageError> {
        Ok(self.tables.read().groups.get(&id).cloned())
    }

    async fn groups_for_user(&self, user_id: UserId) -> Result<Vec<Group>, StorageError> {
        Ok(self
            .tables
            .read()
            .groups
            .values()
            .filter(|g| g.has_member(user_id))
            .cloned()
            .collect())
    }

    async fn rename_group(&self, id: GroupId, name: &str) -> Result<Group, StorageError> {
        let mut t = self.tables.write();
        let group = t.groups.get_mut(&id).ok_or_else(|| group_not_found(id))?;
        group.name = name.to_string();
        Ok(group.clone())
    }

    async fn remove_member(&self, group_id: GroupId, user_id: UserId) -> Result<Group, StorageError> {
        let mut t = self.tables.write();
        let group = t
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| group_not_found(group_id))?;
        group.member_ids.remove(&user_id);
        Ok(group.clone())
    }

    async fn delete_group(&self, id: GroupId) -> Result<bool, StorageError> {
        let mut t = self.tables.write();
        if t.groups.remove(&id).is_none() {
            return Ok(false);
        }
        t.messages.retain(|_, m| m.group_id != id);
        Ok(true)
    }

    async fn create_message(
        &self,
        group_id: GroupId,
        author_id: UserId,
        text: &str,
    ) -> Result<Message, StorageError> {
        let mut t = self.tables.write();
        if !t.groups.contains_key(&group_id) {
            return Err(StorageError::Invalid(format!("group {} does not exist", group_id)));
        }

        let id = Tables::next_id(&mut t.next_message_id);
        let message = Message {
            id,
            group_id,
            author_id,
            text: text.to_string(),
            created_at: Utc::now(),
        };
        t.messages.insert(id, message.clone());
        Ok(message)
    }

    async fn list_messages(
        &self,
        group_id: GroupId,
        window: MessageWindow,
    ) -> Result<Vec<Message>, StorageError> {
        let t = self.tables.read();
        let in_window = |m: &&Message| {
            m.group_id == group_id && window.bound.map_or(true, |b| b.admits(m.id))
        };

        let rows = match window.order {
            SortOrder::Descending => t
                .messages
                .values()
                .rev()
                .filter(in_window)
                .take(window.limit)
                .cloned()
                .collect(),
            SortOrder::Ascending => t
                .messages
                .values()
                .filter(in_window)
                .take(window.limit)
                .cloned()
                .collect(),
        };
        Ok(rows)
    }

    async fn message_exists(&self, group_id: GroupId, bound: IdBound) -> Result<bool, StorageError> {
        Ok(self
            .tables
            .read()
            .messages
            .values()
            .any(|m| m.group_id == group_id && bound.admits(m.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(email: &str) -> NewUser {
        NewUser {
            display_name: email.split('@').next().unwrap_or(email).to_string(),
            email: email.to_string(),
            password_hash: "hash".to_string(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_email_is_conflict() {
        let store = MemoryStore::new();
        store.create_user(new_user("ann@example.com")).await.unwrap();

        let result = store.create_user(new_user("ANN@example.com")).await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_bump_version_increments() {
        let store = MemoryStore::new();
        let user = store.create_user(new_user("ann@example.com")).await.unwrap();
        assert_eq!(user.version, 1);

        let bumped = store.bump_user_version(user.id).await.unwrap();
        assert_eq!(bumped.version, 2);
    }

    #[tokio::test]
    async fn test_delete_group_cascades_messages() {
        let store = MemoryStore::new();
        let ann = store.create_user(new_user("ann@example.com")).await.unwrap();
        let keep = store.create_group("keep", &[ann.id]).await.unwrap();
        let doomed = store.create_group("doomed", &[ann.id]).await.unwrap();

        store.create_message(keep.id, ann.id, "stays").await.unwrap();
        store.create_message(doomed.id, ann.id, "goes").await.unwrap();
        store.create_message(doomed.id, ann.id, "goes too").await.unwrap();

        assert!(store.delete_group(doomed.id).await.unwrap());
        assert_eq!(store.message_count(), 1);
        assert!(store.find_group(doomed.id).await.unwrap().is_none());
        assert!(!store.delete_group(doomed.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_messages_window() {
        let store = MemoryStore::new();
        let ann = store.create_user(new_user("ann@example.com")).await.unwrap();
        let group = store.create_group("g", &[ann.id]).await.unwrap();
        for i in 0..5 {
            store.create_message(group.id, ann.id, &format!("m{}", i)).await.unwrap();
        }

        let newest = store
            .list_messages(
                group.id,
                MessageWindow { bound: None, order: SortOrder::Descending, limit: 2 },
            )
            .await
            .unwrap();
        let ids: Vec<_> = newest.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![5, 4]);

        let older = store
            .list_messages(
                group.id,
                MessageWindow {
                    bound: Some(IdBound::Below(4)),
                    order: SortOrder::Descending,
                    limit: 10,
                },
            )
            .await
            .unwrap();
        let ids: Vec<_> = older.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);

        assert!(store.message_exists(group.id, IdBound::Above(4)).await.unwrap());
        assert!(!store.message_exists(group.id, IdBound::Above(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_group_members_must_exist() {
        let store = MemoryStore::new();
        let ann = store.create_user(new_user("ann@example.com")).await.unwrap();
        let result = store.create_group("g", &[ann.id, 999]).await;
        assert!(matches!(result, Err(StorageError::Invalid(_))));
    }
}
