//! Sessions: per-session configuration and the registry that owns them.

mod config;
mod registry;

pub use config::SessionConfig;
pub use registry::{
    Capabilities, RegistrySettings, SessionHandle, SessionInfo, SessionRegistry, SessionState,
};
