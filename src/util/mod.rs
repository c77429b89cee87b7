pub mod buf;
pub mod clock;
