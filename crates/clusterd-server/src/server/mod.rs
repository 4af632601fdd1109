pub mod app;
pub mod config;
pub mod pidfile;
pub mod signals;
pub mod telemetry;
pub mod transport;
