//! Fakes for the client's collaborators: an in-memory credential store, scripted check-in and
//!  registration services, a manual clock, and a connection factory whose connections end in a
//!  fake server that speaks the frame protocol.
//!
//! They are part of the regular (non-#[cfg(test)]) code so applications can use them for their
//!  own tests.

pub mod clock;
pub mod connection;
pub mod services;
pub mod store;

use std::sync::{Mutex, MutexGuard};

/// test code that panicked while holding a lock should not make every later access panic
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
