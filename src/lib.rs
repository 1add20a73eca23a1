pub mod config;
pub mod directory;
pub mod dynamic_stream;
pub mod error;
pub mod events;
pub mod logging;
pub mod npt;
pub mod probe;
pub mod ssdp;
pub mod state;
pub mod transcode;
pub mod web;

pub use config::Config;
pub use state::AppState;
