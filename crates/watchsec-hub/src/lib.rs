//! Runtime side of watchsec: the WebSocket hub, the SMTP-like and ICAP
//! listeners, the admin socket and the sqlite / file-system collaborators.

pub mod admin;
pub mod capture;
pub mod client;
pub mod commands;
pub mod error;
pub mod events;
pub mod frames;
pub mod gateway;
pub mod hub;
pub mod icap;
pub mod mail;
pub mod ports;
pub mod protocol;
pub mod runtime;
pub mod store;
pub mod ws_server;

#[cfg(test)]
mod memory;
