use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::model::Actor;

/// Login names that act with the admin role. Everyone else is a client.
#[derive(Debug, Clone, Default)]
pub struct AdminSet(Arc<HashSet<String>>);

impl AdminSet {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        Self(Arc::new(names.into_iter().collect()))
    }

    pub fn contains(&self, user: &str) -> bool {
        self.0.contains(user)
    }

    /// The booking identity for a login name.
    pub fn actor_for(&self, user: String) -> Actor {
        if self.contains(&user) {
            Actor::admin(user)
        } else {
            Actor::client(user)
        }
    }
}

/// Shared-secret cleartext auth. Every user logs in with the server password;
/// the login name becomes the booking identity, so it must be present.
#[derive(Debug)]
pub struct SlotbookAuthSource {
    password: String,
    admins: AdminSet,
}

impl SlotbookAuthSource {
    pub fn new(password: String, admins: AdminSet) -> Self {
        Self { password, admins }
    }
}

#[async_trait]
impl AuthSource for SlotbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().filter(|u| !u.is_empty()).ok_or_else(|| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".to_owned(),
                "28000".to_owned(),
                "a user name is required to book".to_owned(),
            )))
        })?;
        let role = if self.admins.contains(user) { "admin" } else { "client" };
        tracing::debug!(user, role, "login");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
