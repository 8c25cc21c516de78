pub mod authenticator;

pub use authenticator::{decode_target, AccessMode, AuthToken, Authenticator};
