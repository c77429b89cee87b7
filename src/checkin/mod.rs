pub mod checkin_coordinator;
pub mod checkin_messages;
pub mod checkin_state;
pub mod server_settings;
