/// Security primitives for the auth session subsystem
///
/// - **token_codec**: HS256 access/refresh token signing and verification
/// - **revocation**: in-process revocation list for token identifiers
/// - **lockout**: per-principal failed-attempt counters and lock state
/// - **password**: password verification seam (Argon2id default)
/// - **secret_validation**: signing secret strength checks
pub mod lockout;
pub mod password;
pub mod revocation;
pub mod secret_validation;
pub mod token_codec;

pub use lockout::{lockout_key, InMemoryLockoutGuard, LockoutGuard, LockoutStatus};
pub use password::{hash_password, Argon2PasswordVerifier, PasswordVerifier};
pub use revocation::{InMemoryRevocationList, RevocationList};
pub use token_codec::{Claims, IssuedToken, TokenCodec, TokenType};
