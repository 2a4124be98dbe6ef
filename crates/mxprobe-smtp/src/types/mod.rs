//! Core SMTP types.

mod address;
mod extension;
mod reply;
mod response;

pub use address::Address;
pub use extension::Extension;
pub use reply::{Reply, ReplyCode};
pub use response::{CATCH_ALL_INDICATORS, ResponseCategory, SmtpResponse, is_catch_all_text};
