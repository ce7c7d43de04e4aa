pub mod auth;
pub mod guards;

pub use auth::{Claims, JwtValidator};
pub use guards::{AuthenticatedUser, InternalService, INTERNAL_TOKEN_HEADER};
