//! Core SMTP types.

mod address;
mod encoding;
mod extension;
mod reply;

pub use address::{Address, ReversePath};
pub use encoding::BodyEncoding;
pub use extension::{AuthMechanism, Extension, ExtensionSet};
pub use reply::{Reply, ReplyCode};
