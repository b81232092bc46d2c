#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_wrap,
    clippy::uninlined_format_args
)]

//! twinbus — a reliable message bus node.
//!
//! Each node federates request/reply traffic between identity-addressed
//! peers ("twins") over HTTP, while a local queue broker is the interface
//! to producers and consumers on the same host. The same process is at
//! once a gateway for outbound requests, a reverse gateway for inbound
//! ones, a correlator matching replies to outstanding requests, and a
//! proxy holding replies for HTTP callers.

pub mod backend;
pub mod config;
pub mod gateway;
pub mod identity;
pub mod message;
pub mod relay;
pub mod twin;

pub use message::{Envelope, Message, MessageIdentifier, QueueTag};
pub use relay::App;
