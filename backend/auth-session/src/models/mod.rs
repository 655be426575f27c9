/// Data models for the auth session subsystem
pub mod principal;
pub mod refresh_token;
pub mod session;

pub use principal::Principal;
pub use refresh_token::{
    hash_token, NewRefreshToken, RefreshTokenRecord, RevocationReason, RevokedToken,
};
pub use session::{ClientContext, LoginRequest, LoginResponse, TokenPair};
