//! HTTP surface of the notification subsystem.
//!
//! Consumed by the survey and admin collaborators: enqueue, survey fan-out,
//! queue introspection, health and Telegram bot discovery. Authentication is
//! handled in front of this service.

pub mod routes;
pub mod state;
