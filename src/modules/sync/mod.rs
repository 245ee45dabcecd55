// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

//! Mailbox synchronization: a cancellable, memory-bounded pipeline that pages
//! through remote message metadata, downloads and builds each message, and
//! applies the results to the local store.

pub mod api;
pub mod cache;
pub mod channel;
pub mod handler;
pub mod job;
pub mod limits;
pub mod memory;
pub mod ratelimit;
pub mod service;
pub mod stage;
pub mod status;
pub mod waiter;

#[cfg(test)]
pub(crate) mod testing;
