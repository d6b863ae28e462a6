pub mod config;
pub mod error;
pub mod types;

pub use error::{TipvaultError, TipvaultResult};
pub use types::{ReceiverId, SessionId, TenantSettings, TipId, UserId};
