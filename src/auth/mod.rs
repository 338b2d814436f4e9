//! Authentication: user bearer tokens, internal service key, webhook HMAC.
//!
//! Token issuance lives in the identity service; this side only verifies.

mod jwt;
mod middleware;

pub use jwt::{Claims, TokenValidator};
pub use middleware::{
    require_auth, require_internal_key, verify_webhook_signature, AuthError, AuthedUser,
};
