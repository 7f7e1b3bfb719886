//! External delivery channels for backup notifications.

pub mod email;
pub mod webhook;
