//! Authorization logic
//!
//! One function per protected field or operation. Each resolves the caller
//! from the [`RequestContext`], applies its scope rule and only then touches
//! the store. Decisions are never cached: every call reads current state.
//!
//! Scope rules:
//! - self fields (`email`, `groups`, `friends`): caller id == target id
//! - group operations: caller id is in the group's member set

use crate::auth::password::{hash_password, verify_password};
use crate::auth::{RequestContext, TokenService};
use crate::error::{ApiError, ApiResult};
use crate::events::{AuthCheck, AuthorizedStream, Event, EventBus, ItemCheck, Topic};
use crate::inputs::{
    ChangePasswordInput, CreateGroupInput, CreateMessageInput, LoginInput, MessageAddedArgs,
    MessagesInput, SignupInput, UpdateGroupInput,
};
use crate::model::{
    AuthPayload, Group, GroupId, Identity, LeaveGroupPayload, Message, Profile, User, UserId,
    UserRecord,
};
use crate::pagination::{page_messages, Connection};
use crate::storage::{NewUser, Store};
use futures::FutureExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Self-access: the caller may only read their own private fields
fn require_self(identity: &Identity, target: UserId) -> ApiResult<()> {
    if identity.id != target {
        return Err(ApiError::Forbidden(format!(
            "user {} may not access private fields of user {}",
            identity.id, target
        )));
    }
    Ok(())
}

fn require_member(identity: &Identity, group: &Group) -> ApiResult<()> {
    if !group.has_member(identity.id) {
        return Err(ApiError::Forbidden(format!(
            "user {} is not a member of group {}",
            identity.id, group.id
        )));
    }
    Ok(())
}

/// Membership check for subscription scope. Missing groups are invalid
/// input rather than not-found, since the caller named them as arguments.
async fn check_memberships(
    store: &dyn Store,
    identity: &Identity,
    group_ids: &BTreeSet<GroupId>,
) -> ApiResult<()> {
    for group_id in group_ids {
        let group = store
            .find_group(*group_id)
            .await?
            .ok_or_else(|| ApiError::Validation(format!("group {} does not exist", group_id)))?;
        require_member(identity, &group)?;
    }
    Ok(())
}

/// Authorization layer shared by the HTTP dispatcher and the socket gateway
#[derive(Clone)]
pub struct Policy {
    store: Arc<dyn Store>,
    tokens: TokenService,
    bus: EventBus,
}

impl Policy {
    pub fn new(store: Arc<dyn Store>, tokens: TokenService, bus: EventBus) -> Self {
        Self { store, tokens, bus }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    async fn current_user(&self, identity: &Identity) -> ApiResult<UserRecord> {
        self.store
            .find_user(identity.id)
            .await?
            .ok_or_else(ApiError::unauthenticated)
    }

    /// Load a group the caller belongs to
    async fn member_group(&self, identity: &Identity, group_id: GroupId) -> ApiResult<Group> {
        let group = self
            .store
            .find_group(group_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("group {} does not exist", group_id)))?;
        require_member(identity, &group)?;
        Ok(group)
    }

    fn auth_payload(&self, user: &UserRecord) -> AuthPayload {
        AuthPayload {
            token: self.tokens.issue(&user.identity()).to_string(),
            user: user.profile(),
        }
    }

    // ---- accounts ----

    pub async fn signup(&self, input: &SignupInput) -> ApiResult<AuthPayload> {
        let password_hash = hash_password(&input.password)?;
        let user = self
            .store
            .create_user(NewUser {
                display_name: input.display_name.trim().to_string(),
                email: input.email.trim().to_string(),
                password_hash,
            })
            .await?;

        info!(user_id = user.id, "User signed up");
        Ok(self.auth_payload(&user))
    }

    pub async fn login(&self, input: &LoginInput) -> ApiResult<AuthPayload> {
        let bad_credentials = || ApiError::Authentication("invalid email or password".to_string());

        let user = self
            .store
            .find_user_by_email(input.email.trim())
            .await?
            .ok_or_else(bad_credentials)?;
        if !verify_password(&input.password, &user.password_hash) {
            debug!(user_id = user.id, "Login rejected");
            return Err(bad_credentials());
        }

        debug!(user_id = user.id, "User logged in");
        Ok(self.auth_payload(&user))
    }

    /// Change credentials. Every token issued before this call stops verifying.
    pub async fn change_password(
        &self,
        ctx: &RequestContext,
        input: &ChangePasswordInput,
    ) -> ApiResult<AuthPayload> {
        let identity = ctx.identity()?;
        let user = self.current_user(identity).await?;
        if !verify_password(&input.current_password, &user.password_hash) {
            return Err(ApiError::Forbidden("current password is incorrect".to_string()));
        }

        let hash = hash_password(&input.new_password)?;
        self.store.set_password_hash(user.id, &hash).await?;
        let user = self.tokens.bump_version(user.id).await?;

        info!(user_id = user.id, version = user.version, "Password changed");
        Ok(self.auth_payload(&user))
    }

    /// Sign the caller out everywhere
    pub async fn logout(&self, ctx: &RequestContext) -> ApiResult<bool> {
        let identity = ctx.identity()?;
        let user = self.tokens.bump_version(identity.id).await?;
        info!(user_id = user.id, version = user.version, "User logged out");
        Ok(true)
    }

    // ---- users ----

    pub async fn me(&self, ctx: &RequestContext) -> ApiResult<Profile> {
        let identity = ctx.identity()?;
        Ok(self.current_user(identity).await?.profile())
    }

    pub async fn user(&self, ctx: &RequestContext, user_id: UserId) -> ApiResult<User> {
        ctx.identity()?;
        self.store
            .find_user(user_id)
            .await?
            .map(|u| u.public())
            .ok_or_else(|| ApiError::NotFound(format!("user {} does not exist", user_id)))
    }

    pub async fn user_email(&self, ctx: &RequestContext, user_id: UserId) -> ApiResult<String> {
        let identity = ctx.identity()?;
        require_self(identity, user_id)?;
        Ok(self.current_user(identity).await?.email)
    }

    pub async fn user_groups(&self, ctx: &RequestContext, user_id: UserId) -> ApiResult<Vec<Group>> {
        let identity = ctx.identity()?;
        require_self(identity, user_id)?;
        Ok(self.store.groups_for_user(user_id).await?)
    }

    pub async fn user_friends(&self, ctx: &RequestContext, user_id: UserId) -> ApiResult<Vec<User>> {
        let identity = ctx.identity()?;
        require_self(identity, user_id)?;
        let friends = self.store.list_friends(user_id).await?;
        Ok(friends.iter().map(UserRecord::public).collect())
    }

    pub async fn add_friend(&self, ctx: &RequestContext, friend_id: UserId) -> ApiResult<User> {
        let identity = ctx.identity()?;
        if identity.id == friend_id {
            return Err(ApiError::Validation("cannot add yourself as a friend".to_string()));
        }

        self.store.add_friend(identity.id, friend_id).await?;
        self.store
            .find_user(friend_id)
            .await?
            .map(|u| u.public())
            .ok_or_else(|| ApiError::Validation(format!("user {} does not exist", friend_id)))
    }

    // ---- groups ----

    pub async fn group(&self, ctx: &RequestContext, group_id: GroupId) -> ApiResult<Group> {
        let identity = ctx.identity()?;
        self.member_group(identity, group_id).await
    }

    pub async fn messages(
        &self,
        ctx: &RequestContext,
        input: &MessagesInput,
    ) -> ApiResult<Connection<Message>> {
        let identity = ctx.identity()?;
        self.member_group(identity, input.group_id).await?;
        page_messages(self.store.as_ref(), input.group_id, &input.page).await
    }

    /// The creator is always a member. Publishes `groupAdded`.
    pub async fn create_group(&self, ctx: &RequestContext, input: &CreateGroupInput) -> ApiResult<Group> {
        let identity = ctx.identity()?;

        let mut members: BTreeSet<UserId> = input.member_ids.iter().copied().collect();
        members.insert(identity.id);
        let members: Vec<UserId> = members.into_iter().collect();

        let group = self.store.create_group(input.name.trim(), &members).await?;
        info!(group_id = group.id, creator_id = identity.id, "Group created");

        self.bus.publish(Event::GroupAdded {
            group: group.clone(),
            creator_id: identity.id,
        });
        Ok(group)
    }

    pub async fn update_group(&self, ctx: &RequestContext, input: &UpdateGroupInput) -> ApiResult<Group> {
        let identity = ctx.identity()?;
        self.member_group(identity, input.group_id).await?;
        Ok(self.store.rename_group(input.group_id, input.name.trim()).await?)
    }

    /// Remove the caller from a group; the last member out deletes it
    pub async fn leave_group(&self, ctx: &RequestContext, group_id: GroupId) -> ApiResult<LeaveGroupPayload> {
        let identity = ctx.identity()?;
        self.member_group(identity, group_id).await?;

        let remaining = self.store.remove_member(group_id, identity.id).await?;
        let deleted = if remaining.member_ids.is_empty() {
            self.store.delete_group(group_id).await?
        } else {
            false
        };

        info!(group_id, user_id = identity.id, deleted, "Left group");
        Ok(LeaveGroupPayload { group_id, deleted })
    }

    /// Delete a group and all of its messages
    pub async fn delete_group(&self, ctx: &RequestContext, group_id: GroupId) -> ApiResult<GroupId> {
        let identity = ctx.identity()?;
        self.member_group(identity, group_id).await?;

        if !self.store.delete_group(group_id).await? {
            return Err(ApiError::NotFound(format!("group {} does not exist", group_id)));
        }
        info!(group_id, user_id = identity.id, "Group deleted");
        Ok(group_id)
    }

    // ---- messages ----

    /// Membership is read from the store on every call. Publishes
    /// `messageAdded` with exactly the record returned to the caller.
    pub async fn create_message(
        &self,
        ctx: &RequestContext,
        input: &CreateMessageInput,
    ) -> ApiResult<Message> {
        let identity = ctx.identity()?;
        let group = self
            .store
            .find_group(input.group_id)
            .await?
            .ok_or_else(|| ApiError::Validation(format!("group {} does not exist", input.group_id)))?;
        require_member(identity, &group)?;

        let message = self
            .store
            .create_message(group.id, identity.id, &input.text)
            .await?;
        debug!(message_id = message.id, group_id = group.id, "Message created");

        self.bus.publish(Event::MessageAdded(message.clone()));
        Ok(message)
    }

    // ---- subscriptions ----

    /// Subscribe-time check for `messageAdded`
    pub async fn authorize_message_added(
        &self,
        ctx: &RequestContext,
        args: &MessageAddedArgs,
    ) -> ApiResult<()> {
        let identity = ctx.identity()?;
        let group_ids = args.group_ids.iter().copied().collect();
        check_memberships(self.store.as_ref(), identity, &group_ids).await
    }

    /// `messageAdded` stream for the caller.
    ///
    /// Delivers messages from the requested groups, minus the caller's own.
    /// With `revalidate` set, membership of each event's group is re-read
    /// before delivery and a failed check ends the stream.
    pub fn message_added(
        &self,
        ctx: &RequestContext,
        args: &MessageAddedArgs,
        revalidate: bool,
    ) -> AuthorizedStream {
        let base = self.bus.subscribe(Topic::MessageAdded);
        let group_ids: BTreeSet<GroupId> = args.group_ids.iter().copied().collect();
        let subscriber = ctx.identity().ok().map(|i| i.id);

        let check: AuthCheck = {
            let store = self.store.clone();
            let identity = ctx.identity().cloned();
            let group_ids = group_ids.clone();
            async move {
                let identity = identity?;
                check_memberships(store.as_ref(), &identity, &group_ids).await
            }
            .boxed()
        };

        let stream = AuthorizedStream::new(base, check).with_filter(move |event| match event {
            Event::MessageAdded(m) => {
                group_ids.contains(&m.group_id) && Some(m.author_id) != subscriber
            }
            _ => false,
        });

        match (revalidate, ctx.identity()) {
            (true, Ok(identity)) => {
                let store = self.store.clone();
                let identity = identity.clone();
                let per_item: ItemCheck = Arc::new(move |event: &Event| {
                    let store = store.clone();
                    let identity = identity.clone();
                    let group_id = match event {
                        Event::MessageAdded(m) => Some(m.group_id),
                        _ => None,
                    };
                    async move {
                        let Some(group_id) = group_id else {
                            return Ok(());
                        };
                        check_memberships(store.as_ref(), &identity, &BTreeSet::from([group_id]))
                            .await
                            .map_err(|e| match e {
                                ApiError::Validation(msg) => ApiError::Forbidden(msg),
                                other => other,
                            })
                    }
                    .boxed()
                });
                stream.with_item_check(per_item)
            }
            _ => stream,
        }
    }

    /// `groupAdded` stream: new groups the caller was added to by someone else
    pub fn group_added(&self, ctx: &RequestContext) -> AuthorizedStream {
        let base = self.bus.subscribe(Topic::GroupAdded);
        let subscriber = ctx.identity().ok().map(|i| i.id);
        let identity = ctx.identity().map(|_| ());

        AuthorizedStream::new(base, async move { identity }.boxed()).with_filter(move |event| {
            match (event, subscriber) {
                (Event::GroupAdded { group, creator_id }, Some(me)) => {
                    group.has_member(me) && *creator_id != me
                }
                _ => false,
            }
        })
    }
}
