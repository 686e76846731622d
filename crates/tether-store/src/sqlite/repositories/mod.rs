//! Stateless repositories. Every method takes `&Connection`.

pub mod credential;
pub mod grant;
pub mod projection;

pub use credential::CredentialRepo;
pub use grant::GrantRepo;
pub use projection::ProjectionRepo;
