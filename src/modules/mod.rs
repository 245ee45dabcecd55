// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

pub mod common;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod settings;
pub mod sync;
pub mod utils;
