//! Sockets and the connections built on them.
//!
//! # Data Flow
//! ```text
//! client side:   listener.rs ─accept─▶ clients.rs ─▶ connection.rs
//! upstream side: dialer.rs ─connect─▶ connection.rs
//! in between:    operation.rs links one client request to one upstream msgid
//!
//! connection states: Ready ⇄ Binding, Active → Ready, any → Closing → Dying
//! ```
//!
//! # Design Decisions
//! - A listener holds a semaphore permit per accepted client
//! - Connections are shared between shards and workers, so all state sits behind one mutex
//! - `Dialer` is a trait; unit tests replace the network with a scripted one

pub mod clients;
pub mod connection;
pub mod dialer;
pub mod listener;
pub mod operation;
