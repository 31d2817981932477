pub mod error;
pub mod form;
pub mod metadata;
pub mod orchestrator;
pub mod provider;
pub mod repository;
pub mod session;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;


pub use self::error::{ErrorBody, ErrorKind, SamlError};
pub use self::metadata::{IdentityProviderMetadataLoader, SystemMetadataReader};
pub use self::orchestrator::SamlOrchestrator;
pub use self::provider::{SamaelProvider, SamlProvider, ServiceProviderConfig};
pub use self::repository::{PgUserRepository, UserRepository};
pub use self::session::{SessionSecrets, SessionStore};
pub use self::token::TokenCodec;
