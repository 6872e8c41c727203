//! Typed operation inputs
//!
//! One struct per operation. The dispatcher runs [`Validate::validate`] on
//! every input before it reaches the policy layer.

use crate::error::ApiError;
use crate::model::{GroupId, UserId};
use crate::pagination::PageArgs;
use serde::{Deserialize, Serialize};

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_MESSAGE_LEN: usize = 4000;

pub trait Validate {
    fn validate(&self) -> Result<(), ApiError>;
}

fn invalid(msg: impl Into<String>) -> ApiError {
    ApiError::Validation(msg.into())
}

fn check_name(field: &str, value: &str) -> Result<(), ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(invalid(format!("{} cannot be empty", field)));
    }
    if value.chars().count() > MAX_NAME_LEN {
        return Err(invalid(format!("{} is longer than {} characters", field, MAX_NAME_LEN)));
    }
    Ok(())
}

fn check_email(email: &str) -> Result<(), ApiError> {
    let email = email.trim();
    let well_formed = matches!(
        email.split_once('@'),
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@')
    );
    if !well_formed || email.len() > MAX_EMAIL_LEN {
        return Err(invalid("email address is not valid"));
    }
    Ok(())
}

fn check_password(field: &str, password: &str) -> Result<(), ApiError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(invalid(format!(
            "{} must be at least {} characters",
            field, MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn check_id(field: &str, id: i64) -> Result<(), ApiError> {
    if id <= 0 {
        return Err(invalid(format!("{} must be a positive id", field)));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupInput {
    pub display_name: String,
    pub email: String,
    pub password: String,
}

impl Validate for SignupInput {
    fn validate(&self) -> Result<(), ApiError> {
        check_name("displayName", &self.display_name)?;
        check_email(&self.email)?;
        check_password("password", &self.password)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginInput {
    pub email: String,
    pub password: String,
}

impl Validate for LoginInput {
    fn validate(&self) -> Result<(), ApiError> {
        check_email(&self.email)?;
        if self.password.is_empty() {
            return Err(invalid("password cannot be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordInput {
    pub current_password: String,
    pub new_password: String,
}

impl Validate for ChangePasswordInput {
    fn validate(&self) -> Result<(), ApiError> {
        check_password("newPassword", &self.new_password)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdInput {
    pub user_id: UserId,
}

impl Validate for UserIdInput {
    fn validate(&self) -> Result<(), ApiError> {
        check_id("userId", self.user_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupIdInput {
    pub group_id: GroupId,
}

impl Validate for GroupIdInput {
    fn validate(&self) -> Result<(), ApiError> {
        check_id("groupId", self.group_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupInput {
    pub name: String,
    #[serde(default)]
    pub member_ids: Vec<UserId>,
}

impl Validate for CreateGroupInput {
    fn validate(&self) -> Result<(), ApiError> {
        check_name("name", &self.name)?;
        self.member_ids.iter().try_for_each(|id| check_id("memberIds", *id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGroupInput {
    pub group_id: GroupId,
    pub name: String,
}

impl Validate for UpdateGroupInput {
    fn validate(&self) -> Result<(), ApiError> {
        check_id("groupId", self.group_id)?;
        check_name("name", &self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageInput {
    pub group_id: GroupId,
    pub text: String,
}

impl Validate for CreateMessageInput {
    fn validate(&self) -> Result<(), ApiError> {
        check_id("groupId", self.group_id)?;
        if self.text.trim().is_empty() {
            return Err(invalid("text cannot be empty"));
        }
        if self.text.chars().count() > MAX_MESSAGE_LEN {
            return Err(invalid(format!("text is longer than {} characters", MAX_MESSAGE_LEN)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesInput {
    pub group_id: GroupId,
    #[serde(flatten)]
    pub page: PageArgs,
}

impl Validate for MessagesInput {
    fn validate(&self) -> Result<(), ApiError> {
        check_id("groupId", self.group_id)?;
        self.page.validate()
    }
}

/// Arguments of the `messageAdded` subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAddedArgs {
    pub group_ids: Vec<GroupId>,
}

impl Validate for MessageAddedArgs {
    fn validate(&self) -> Result<(), ApiError> {
        if self.group_ids.is_empty() {
            return Err(invalid("groupIds cannot be empty"));
        }
        self.group_ids.iter().try_for_each(|id| check_id("groupIds", *id))
    }
}
