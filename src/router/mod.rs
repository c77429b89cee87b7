pub mod message_router;
pub mod messages;
