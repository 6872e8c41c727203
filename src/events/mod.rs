//! Live event delivery
//!
//! Topics:
//! - `messageAdded`: a message was created in some group
//! - `groupAdded`: a group was created
//!
//! [`EventBus`] fans published events out to one private queue per
//! subscriber. [`AuthorizedStream`] gates a bus subscription behind an
//! authorization check and a per-event scope filter.

mod authorized;
mod bus;

pub use authorized::{AuthCheck, AuthorizedStream, EventFilter, ItemCheck};
pub use bus::{EventBus, EventStream};

use crate::model::{Group, Message, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Topic {
    MessageAdded,
    GroupAdded,
}

#[derive(Debug, Error)]
#[error("unknown topic '{0}'")]
pub struct UnknownTopic(pub String);

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::MessageAdded => "messageAdded",
            Topic::GroupAdded => "groupAdded",
        }
    }
}

impl FromStr for Topic {
    type Err = UnknownTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "messageAdded" => Ok(Topic::MessageAdded),
            "groupAdded" => Ok(Topic::GroupAdded),
            other => Err(UnknownTopic(other.to_string())),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload carried on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "data", rename_all = "camelCase")]
pub enum Event {
    MessageAdded(Message),
    #[serde(rename_all = "camelCase")]
    GroupAdded {
        group: Group,
        creator_id: UserId,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::MessageAdded(_) => Topic::MessageAdded,
            Event::GroupAdded { .. } => Topic::GroupAdded,
        }
    }

    /// The identity whose action produced this event
    pub fn origin(&self) -> UserId {
        match self {
            Event::MessageAdded(message) => message.author_id,
            Event::GroupAdded { creator_id, .. } => *creator_id,
        }
    }
}
