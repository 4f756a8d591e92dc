use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::observability::AUTH_FAILURES_TOTAL;

/// Login accepted by the server. When `user` is None any user name is
/// accepted and only the password is checked.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: String,
}

impl Credentials {
    fn user_allowed(&self, login_user: Option<&str>) -> bool {
        self.user.as_deref().is_none_or(|expected| login_user == Some(expected))
    }
}

#[derive(Debug)]
pub struct StaydAuthSource {
    credentials: Credentials,
}

impl StaydAuthSource {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AuthSource for StaydAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if !self.credentials.user_allowed(login.user()) {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!(user = login.user().unwrap_or(""), "rejected login for unknown user");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28P01".into(),
                "password authentication failed".into(),
            ))));
        }
        Ok(Password::new(None, self.credentials.password.as_bytes().to_vec()))
    }
}
