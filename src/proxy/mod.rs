pub mod access_log;
pub mod connection;
pub mod error;
pub mod http_handler;
pub mod recorder;
pub mod relay;
pub mod server;
pub mod stats_page;
pub mod traffic;
pub mod tunnel;
