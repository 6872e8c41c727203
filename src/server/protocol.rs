//! Wire protocol
//!
//! HTTP carries queries and mutations as `{ "operation": <name>, "input": {...} }`.
//! The socket carries subscription traffic as `type`-tagged JSON messages.
//! Raw requests are turned into typed, validated operations here, before
//! anything reaches the policy layer.

use crate::error::{ApiError, ApiResult, ErrorPayload};
use crate::events::{Event, Topic};
use crate::inputs::{
    ChangePasswordInput, CreateGroupInput, CreateMessageInput, GroupIdInput, LoginInput,
    MessageAddedArgs, MessagesInput, SignupInput, UpdateGroupInput, UserIdInput, Validate,
};
use crate::model::Identity;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Messages from client to server over the socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on every socket
    ConnectionInit { payload: ConnectionInitPayload },
    /// Start a subscription operation
    Subscribe { id: String, payload: SubscribePayload },
    /// Stop a subscription operation
    Complete { id: String },
    /// Keepalive
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInitPayload {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub topic: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Messages from server to client over the socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted
    ConnectionAck { identity: Identity },
    /// Handshake rejected; the socket closes right after
    ConnectionError { error: ErrorPayload },
    /// Subscription authorized and live
    Subscribed { id: String },
    /// An event for a live subscription
    Next { id: String, payload: Event },
    /// The operation failed; other operations are unaffected
    Error { id: String, error: ErrorPayload },
    /// The operation ended
    Complete { id: String },
    /// Keepalive response
    Pong,
}

/// A validated subscription request
#[derive(Debug, Clone)]
pub enum Subscription {
    MessageAdded(MessageAddedArgs),
    GroupAdded,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        match self {
            Subscription::MessageAdded(_) => Topic::MessageAdded,
            Subscription::GroupAdded => Topic::GroupAdded,
        }
    }
}

impl SubscribePayload {
    pub fn new(topic: Topic, args: serde_json::Value) -> Self {
        Self {
            topic: topic.to_string(),
            args,
        }
    }

    pub fn parse(&self) -> ApiResult<Subscription> {
        let topic: Topic = self
            .topic
            .parse()
            .map_err(|e: crate::events::UnknownTopic| ApiError::Validation(e.to_string()))?;

        match topic {
            Topic::MessageAdded => Ok(Subscription::MessageAdded(typed_input(
                topic.as_str(),
                self.args.clone(),
            )?)),
            Topic::GroupAdded => Ok(Subscription::GroupAdded),
        }
    }
}

/// Raw HTTP operation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub operation: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl OperationRequest {
    pub fn new(operation: &str, input: serde_json::Value) -> Self {
        Self {
            operation: operation.to_string(),
            input,
        }
    }
}

fn typed_input<T>(operation: &str, input: serde_json::Value) -> ApiResult<T>
where
    T: DeserializeOwned + Validate,
{
    let input = if input.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        input
    };
    let value: T = serde_json::from_value(input)
        .map_err(|e| ApiError::Validation(format!("invalid input for {}: {}", operation, e)))?;
    value.validate()?;
    Ok(value)
}

#[derive(Debug, Clone)]
pub enum Query {
    Me,
    User(UserIdInput),
    UserEmail(UserIdInput),
    UserGroups(UserIdInput),
    UserFriends(UserIdInput),
    Group(GroupIdInput),
    Messages(MessagesInput),
}

impl Query {
    pub fn parse(req: OperationRequest) -> ApiResult<Self> {
        let op = req.operation.as_str();
        let input = req.input;
        Ok(match op {
            "me" => Query::Me,
            "user" => Query::User(typed_input(op, input)?),
            "userEmail" => Query::UserEmail(typed_input(op, input)?),
            "userGroups" => Query::UserGroups(typed_input(op, input)?),
            "userFriends" => Query::UserFriends(typed_input(op, input)?),
            "group" => Query::Group(typed_input(op, input)?),
            "messages" => Query::Messages(typed_input(op, input)?),
            other => {
                return Err(ApiError::Validation(format!("unknown query '{}'", other)));
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Query::Me => "me",
            Query::User(_) => "user",
            Query::UserEmail(_) => "userEmail",
            Query::UserGroups(_) => "userGroups",
            Query::UserFriends(_) => "userFriends",
            Query::Group(_) => "group",
            Query::Messages(_) => "messages",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Mutation {
    Signup(SignupInput),
    Login(LoginInput),
    ChangePassword(ChangePasswordInput),
    Logout,
    AddFriend(UserIdInput),
    CreateGroup(CreateGroupInput),
    UpdateGroup(UpdateGroupInput),
    LeaveGroup(GroupIdInput),
    DeleteGroup(GroupIdInput),
    CreateMessage(CreateMessageInput),
}

impl Mutation {
    pub fn parse(req: OperationRequest) -> ApiResult<Self> {
        let op = req.operation.as_str();
        let input = req.input;
        Ok(match op {
            "signup" => Mutation::Signup(typed_input(op, input)?),
            "login" => Mutation::Login(typed_input(op, input)?),
            "changePassword" => Mutation::ChangePassword(typed_input(op, input)?),
            "logout" => Mutation::Logout,
            "addFriend" => Mutation::AddFriend(typed_input(op, input)?),
            "createGroup" => Mutation::CreateGroup(typed_input(op, input)?),
            "updateGroup" => Mutation::UpdateGroup(typed_input(op, input)?),
            "leaveGroup" => Mutation::LeaveGroup(typed_input(op, input)?),
            "deleteGroup" => Mutation::DeleteGroup(typed_input(op, input)?),
            "createMessage" => Mutation::CreateMessage(typed_input(op, input)?),
            other => {
                return Err(ApiError::Validation(format!("unknown mutation '{}'", other)));
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Mutation::Signup(_) => "signup",
            Mutation::Login(_) => "login",
            Mutation::ChangePassword(_) => "changePassword",
            Mutation::Logout => "logout",
            Mutation::AddFriend(_) => "addFriend",
            Mutation::CreateGroup(_) => "createGroup",
            Mutation::UpdateGroup(_) => "updateGroup",
            Mutation::LeaveGroup(_) => "leaveGroup",
            Mutation::DeleteGroup(_) => "deleteGroup",
            Mutation::CreateMessage(_) => "createMessage",
        }
    }

    /// Mutations after which all earlier tokens of the caller are dead
    pub fn revokes_sessions(&self) -> bool {
        matches!(self, Mutation::ChangePassword(_) | Mutation::Logout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_client_message_wire_format() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"connection_init","payload":{"token":"sess-x.y"}}"#)
                .unwrap();
        assert!(matches!(msg, ClientMessage::ConnectionInit { payload } if payload.token == "sess-x.y"));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe","id":"1","payload":{"topic":"groupAdded"}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Subscribe { id, payload } => {
                assert_eq!(id, "1");
                assert!(matches!(payload.parse().unwrap(), Subscription::GroupAdded));
            }
            other => panic!("unexpected {:?}", other),
        }

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn test_server_message_wire_format() {
        let json = serde_json::to_value(ServerMessage::Complete { id: "7".to_string() }).unwrap();
        assert_eq!(json, json!({"type": "complete", "id": "7"}));

        let json = serde_json::to_value(ServerMessage::Pong).unwrap();
        assert_eq!(json, json!({"type": "pong"}));
    }

    #[test]
    fn test_subscribe_payload_validation() {
        let bad_topic = SubscribePayload { topic: "typing".to_string(), args: json!({}) };
        assert_eq!(bad_topic.parse().unwrap_err().kind(), ErrorKind::Validation);

        let missing_args = SubscribePayload::new(Topic::MessageAdded, serde_json::Value::Null);
        assert_eq!(missing_args.parse().unwrap_err().kind(), ErrorKind::Validation);

        let ok = SubscribePayload::new(Topic::MessageAdded, json!({"groupIds": [1, 2]}));
        match ok.parse().unwrap() {
            Subscription::MessageAdded(args) => assert_eq!(args.group_ids, vec![1, 2]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_operation_parsing() {
        let q = Query::parse(OperationRequest::new("me", serde_json::Value::Null)).unwrap();
        assert_eq!(q.name(), "me");

        let q = Query::parse(OperationRequest::new(
            "messages",
            json!({"groupId": 4, "first": 10, "after": null}),
        ))
        .unwrap();
        assert!(matches!(q, Query::Messages(ref m) if m.group_id == 4));

        let err = Mutation::parse(OperationRequest::new("dropTables", json!({}))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = Mutation::parse(OperationRequest::new(
            "createMessage",
            json!({"groupId": 1, "text": ""}),
        ))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let m = Mutation::parse(OperationRequest::new("logout", serde_json::Value::Null)).unwrap();
        assert!(m.revokes_sessions());
    }
}
