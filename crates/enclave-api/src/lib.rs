//! REST surface: accounts, realm and channel administration, invitations.

pub mod auth;
pub mod error;
pub mod invites;
pub mod middleware;
pub mod realms;

use std::sync::Arc;

use enclave_db::Database;

pub type ApiState = Arc<ApiStateInner>;

pub struct ApiStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
}
