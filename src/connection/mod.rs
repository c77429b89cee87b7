pub mod backoff;
pub mod connection_manager;
pub mod transport;
