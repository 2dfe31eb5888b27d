//! Authentication: tokens, password hashing, credential backends and the
//! request decorator that ties them together.

pub mod middleware;
pub mod password;
pub mod token;
pub mod verifier;

pub use middleware::{authenticate, require_auth, RequestContext, AUTH_HEADER};
pub use password::{hash_password, verify_password};
pub use token::{load_or_generate_key, Claims, TokenCodec, TokenError, TOKEN_ISSUER};
pub use verifier::{CredentialVerifier, LoginAttempt};
