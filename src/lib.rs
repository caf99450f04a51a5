pub mod catalog;
pub mod chat;
pub mod config;
pub mod error;
pub mod model;
pub mod protocol;
pub mod server;
pub mod session;

pub use catalog::{Catalog, CatalogEntry};
pub use config::{AppConfig, GenerationSettings, SessionTimeouts};
pub use error::SessionError;
pub use protocol::{GeneratePayload, GenerationOutcome, InitPayload, SessionConfig};
pub use server::build_router;
pub use session::{Backend, Precision, SessionController};
