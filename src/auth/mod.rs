//! Authentication & Authorization
//! Mission: Resolve bearer credentials to opaque user identities

pub mod jwt;
pub mod middleware;
pub mod models;

pub use jwt::JwtHandler;
pub use middleware::{auth_middleware, require_admin};
pub use models::{Claims, UserRole};
