use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use ulid::Ulid;

use crate::model::{MemberRole, MemberStatus};

/// The member identity behind a connection, resolved from the login user
/// (an email) at query time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub member_id: Ulid,
    pub email: String,
    pub role: MemberRole,
    pub status: MemberStatus,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == MemberRole::Admin
    }
}

#[derive(Debug)]
pub struct CoworkdAuthSource {
    password: String,
}

impl CoworkdAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for CoworkdAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
