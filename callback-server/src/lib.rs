//! Local HTTP callback listener for UPnP event notifications.
//!
//! Players deliver events by sending HTTP NOTIFY requests to a URL we hand
//! them at subscription time. This crate runs a single warp server for the
//! whole gateway on a dedicated runtime thread and bridges received bodies
//! into the blocking world over a channel.
//!
//! The listener acknowledges every NOTIFY with `200 OK` *before* anything
//! looks at the body: players drop subscriptions whose callback answers
//! slowly, so parsing happens downstream on the consumer's thread.

mod server;

pub use server::{CallbackError, CallbackServer, Notification};
