pub mod graph;
pub mod oidc;

pub use graph::GraphClient;
pub use oidc::{decode_id_token_claims, IdTokenClaims, OidcBridge, OidcTokens};
