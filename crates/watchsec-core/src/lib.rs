//! Pure domain logic for the watchsec telemetry hub.
//!
//! Nothing in this crate performs I/O: the capture throttle, the SMTP-like
//! session machine and the ICAP classifier all take their input as values and
//! return decisions, so the daemon crate owns every socket and every clock.

pub mod agent_id;
pub mod capture;
pub mod config;
pub mod icap;
pub mod smtp;
pub mod types;
