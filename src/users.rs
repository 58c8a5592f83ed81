//! User registry: self-service registration and role/status administration.
//!
//! The workflow engine takes the caller's role as an argument on every
//! gated operation; this directory exists to enumerate the active holders
//! of a role when addressing an approver group, and to back whatever
//! session layer sits in front of the engine. Gating `set_role_status` to
//! controllers is that outer layer's job.
use crate::error::WorkflowError;
use crate::request::Role;
use crate::store::{RecordStore, TABLE_USERS};
use crate::time::TimeStamp;
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Active,
    #[n(2)]
    Disabled,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    #[n(0)]
    pub user_id: String,
    #[n(1)]
    pub email: String,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub department: String,
    #[n(4)]
    pub requested_role: Role,
    #[n(5)]
    pub role: Role,
    #[n(6)]
    pub status: UserStatus,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
}

pub struct UserDirectory<'a> {
    store: &'a RecordStore,
}

impl<'a> UserDirectory<'a> {
    pub fn new(store: &'a RecordStore) -> Self {
        Self { store }
    }

    /// Self-service account request. Lands as a plain user, Pending until a
    /// controller activates it.
    pub fn register(
        &self,
        email: &str,
        name: &str,
        department: &str,
        requested_role: Role,
    ) -> Result<UserRecord, WorkflowError> {
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return Err(WorkflowError::Validation("email is required".into()));
        }
        if self.find_by_email(&email)?.is_some() {
            return Err(WorkflowError::Validation(format!(
                "an account already exists for {email}"
            )));
        }

        let record = UserRecord {
            user_id: self.store.next_user_id()?,
            email: email.clone(),
            name: if name.trim().is_empty() {
                email.clone()
            } else {
                name.trim().to_string()
            },
            department: department.trim().to_string(),
            requested_role,
            role: Role::User,
            status: UserStatus::Pending,
            created_at: TimeStamp::now(),
        };
        self.store
            .append_record(TABLE_USERS, &record.user_id, &record)?;
        Ok(record)
    }

    pub fn set_role_status(
        &self,
        user_id: &str,
        role: Role,
        status: UserStatus,
    ) -> Result<(), WorkflowError> {
        let updated = self
            .store
            .update_record_by_key(TABLE_USERS, user_id, |u: &mut UserRecord| {
                u.role = role;
                u.status = status;
            })?;
        if !updated {
            return Err(WorkflowError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    pub fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, WorkflowError> {
        let needle = email.trim().to_lowercase();
        let users: Vec<UserRecord> = self.store.read_all_records(TABLE_USERS)?;
        Ok(users.into_iter().find(|u| u.email == needle))
    }

    /// Active holders of a role, in registration order. This is the group
    /// a Pending request's next stage gets addressed to.
    pub fn active_in_role(&self, role: Role) -> Result<Vec<UserRecord>, WorkflowError> {
        let users: Vec<UserRecord> = self.store.read_all_records(TABLE_USERS)?;
        Ok(users
            .into_iter()
            .filter(|u| u.role == role && u.status == UserStatus::Active)
            .collect())
    }
}
