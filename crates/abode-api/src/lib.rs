// abode-api: Async Rust client for the Abode home security cloud
// (session/auth lifecycle + resilient push-event stream)

pub mod auth;
pub mod client;
pub mod config;
pub mod devices;
pub mod error;
pub mod events;
pub mod session;
mod socket;

pub use auth::Credentials;
pub use client::AbodeClient;
pub use config::ClientConfig;
pub use error::Error;
pub use events::AbodeEvent;
pub use session::SessionManager;
