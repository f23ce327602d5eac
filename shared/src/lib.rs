//! Types shared between the interception core and its consumers: error enums, the decoded
//! module events handed to subscribers, and well-known names.

pub mod constants;
pub mod errors;
pub mod events;
