pub mod oauth;
pub mod pool;

pub use oauth::OAuthSession;
pub use pool::{HttpPoolConfig, HttpPoolError, RateLimitedClient, RequestAuth};
