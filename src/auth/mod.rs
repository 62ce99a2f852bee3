use async_trait::async_trait;

use crate::error::AuthError;

pub mod endpoint;
pub mod service_account;
pub mod token;

pub use endpoint::{GoogleIdentity, IdentityProvider};
pub use service_account::ServiceAccountTokens;
pub use token::{TokenManager, TokenState, TokenStore};

/// Anything able to hand out a currently valid bearer token.
#[async_trait]
pub trait AccessTokenSource: Sync + Send + 'static {
    async fn access_token(&self) -> Result<String, AuthError>;
}
