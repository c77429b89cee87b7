pub mod frames;
pub mod heartbeat;
pub mod send_queue;
pub mod stream_client;
