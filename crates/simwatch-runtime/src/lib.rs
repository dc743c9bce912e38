#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod archive;
pub mod container;
pub mod fetch;
pub mod index_watcher;
pub mod movies;
pub mod run_watcher;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod types;
