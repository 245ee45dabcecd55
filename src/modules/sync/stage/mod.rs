// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::sync::{
    api::{BuildResult, FullMessage},
    job::ChildJob,
};

pub mod apply;
pub mod build;
pub mod download;
pub mod metadata;

/// Message IDs discovered by the metadata stage, newest first.
pub struct DownloadRequest {
    pub child: ChildJob,
    pub ids: Vec<String>,
}

/// Downloaded messages waiting to be built.
pub struct BuildRequest {
    pub child: ChildJob,
    pub batch: Vec<FullMessage>,
}

/// Built messages waiting for the local store.
pub struct ApplyRequest {
    pub child: ChildJob,
    pub messages: Vec<BuildResult>,
}
