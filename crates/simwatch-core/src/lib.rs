#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod range;
pub mod retry;
pub mod types;
pub mod upload_url;
