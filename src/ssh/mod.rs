//! SSH transport layer
//!
//! Dialing and password authentication via russh, plus the handle owner
//! task that serializes all access to the connection handle.

mod client;
mod config;
mod handle_owner;

pub use client::{connect_and_auth, ClientHandler};
pub use config::ConnectParams;
pub use handle_owner::{
    spawn_handle_owner_task, HandleCommand, HandleController, PingResult,
};
