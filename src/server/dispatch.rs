//! Query and mutation dispatch
//!
//! Maps a parsed operation onto the policy layer and serializes the result.

use crate::auth::{Policy, RequestContext};
use crate::error::{ApiError, ApiResult};
use crate::server::gateway::Gateway;
use crate::server::protocol::{Mutation, Query};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

fn data<T: Serialize>(value: T) -> ApiResult<Value> {
    serde_json::to_value(value).map_err(|e| ApiError::Internal(e.to_string()))
}

#[derive(Clone)]
pub struct Dispatcher {
    policy: Policy,
    /// Set when credential changes should also close the caller's live sockets
    revoke_sockets: Option<Gateway>,
}

impl Dispatcher {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            revoke_sockets: None,
        }
    }

    pub fn with_socket_revocation(mut self, gateway: Gateway) -> Self {
        self.revoke_sockets = Some(gateway);
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub async fn query(&self, ctx: &RequestContext, query: Query) -> ApiResult<Value> {
        let p = &self.policy;
        match query {
            Query::Me => data(p.me(ctx).await?),
            Query::User(input) => data(p.user(ctx, input.user_id).await?),
            Query::UserEmail(input) => data(p.user_email(ctx, input.user_id).await?),
            Query::UserGroups(input) => data(p.user_groups(ctx, input.user_id).await?),
            Query::UserFriends(input) => data(p.user_friends(ctx, input.user_id).await?),
            Query::Group(input) => data(p.group(ctx, input.group_id).await?),
            Query::Messages(input) => data(p.messages(ctx, &input).await?),
        }
    }

    pub async fn mutation(&self, ctx: &RequestContext, mutation: Mutation) -> ApiResult<Value> {
        let p = &self.policy;
        let revokes = mutation.revokes_sessions();

        let result = match mutation {
            Mutation::Signup(input) => data(p.signup(&input).await?),
            Mutation::Login(input) => data(p.login(&input).await?),
            Mutation::ChangePassword(input) => data(p.change_password(ctx, &input).await?),
            Mutation::Logout => data(p.logout(ctx).await?),
            Mutation::AddFriend(input) => data(p.add_friend(ctx, input.user_id).await?),
            Mutation::CreateGroup(input) => data(p.create_group(ctx, &input).await?),
            Mutation::UpdateGroup(input) => data(p.update_group(ctx, &input).await?),
            Mutation::LeaveGroup(input) => data(p.leave_group(ctx, input.group_id).await?),
            Mutation::DeleteGroup(input) => data(p.delete_group(ctx, input.group_id).await?),
            Mutation::CreateMessage(input) => data(p.create_message(ctx, &input).await?),
        }?;

        if revokes {
            if let (Some(gateway), Ok(identity)) = (&self.revoke_sockets, ctx.identity()) {
                let closed = gateway.disconnect_identity(identity.id);
                debug!(identity_id = identity.id, closed, "Revoked live sockets");
            }
        }

        Ok(result)
    }
}
