pub mod registration_key;
pub mod registration_manager;
pub mod registration_service;
