pub mod client_config;
pub mod client_driver;
pub mod client_events;
pub mod client_state;
pub mod push_client;
