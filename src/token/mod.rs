//! The token envelope: header, payload, spending-condition locks, and
//! the build/sign/restore/JWT-string operations of spec §3.1 and §4.1.

mod header;
mod jwt;
mod lock;
mod payload;

pub use header::{Header, TokenType};
pub use jwt::Token;
pub use lock::{HashFunction, LockStatus, HTLC};
pub use payload::Payload;
