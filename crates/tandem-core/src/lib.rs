pub mod config;
pub mod event_bus;
pub mod lease;
pub mod storage;

pub const DEFAULT_ENGINE_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENGINE_PORT: u16 = 39731;

pub use config::*;
pub use event_bus::*;
pub use lease::*;
pub use storage::*;
