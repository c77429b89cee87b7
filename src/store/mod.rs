//! Persistent state of the client. The client only talks to storage through [CredentialStore],
//!  and every write is fire-and-forget from its perspective: a failed write is logged, but the
//!  in-memory state stays authoritative until the next load.

pub mod credential_store;
