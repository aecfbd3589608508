//! Authentication module for the Estate API

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtManager};
pub use middleware::{require_auth, AuthState, AuthUser};
