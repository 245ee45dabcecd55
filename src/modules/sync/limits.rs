// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use tracing::{debug, warn};

use crate::{
    modules::{
        settings::cli::Settings,
        utils::{to_mb, GIGABYTE, MEGABYTE},
    },
    total_memory,
};

/// Beyond this, extra download memory per request stops paying off: the build
/// stage cannot keep up anyway.
const MAX_DOWNLOAD_REQUEST_MEM: u64 = 128 * MEGABYTE;
/// Below this, large messages may not fit into a single download request.
const MIN_DOWNLOAD_REQUEST_MEM: u64 = 40 * MEGABYTE;
const MAX_MESSAGE_BUILDING_MEM: u64 = 128 * MEGABYTE;
const MIN_MESSAGE_BUILDING_MEM: u64 = 64 * MEGABYTE;
/// Upper bound on concurrent API downloads recommended by the remote.
const MAX_PARALLEL_DOWNLOADS: usize = 20;
const MIN_SYNC_MEMORY: u64 = 800 * MEGABYTE;

/// Memory and parallelism ceilings for the download and build stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncLimits {
    pub max_sync_memory: u64,
    pub download_request_mem: u64,
    pub message_build_mem: u64,
    pub max_parallel_downloads: usize,
}

impl SyncLimits {
    /// Reads total system memory once and derives the limits from `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::compute(
            settings.mailbridge_max_sync_memory,
            total_memory!(),
            settings.mailbridge_sync_force_minimum_spec,
        )
    }

    pub fn compute(max_sync_memory: u64, total_memory: u64, force_minimum_spec: bool) -> Self {
        let mut max_download_request_mem = MAX_DOWNLOAD_REQUEST_MEM;
        let mut max_message_building_mem = MAX_MESSAGE_BUILDING_MEM;
        let mut max_parallel_downloads = MAX_PARALLEL_DOWNLOADS;
        let mut max_sync_memory = max_sync_memory;

        if force_minimum_spec {
            warn!("Sync specs forced to minimum");
            max_download_request_mem = 50 * MEGABYTE;
            max_message_building_mem = 80 * MEGABYTE;
            max_parallel_downloads = 2;
            max_sync_memory = MIN_SYNC_MEMORY;
        }

        // The download and build stages together use roughly 4x the configured
        // memory once pipelining, network buffers and compression are counted.
        if max_sync_memory >= total_memory / 2 {
            warn!(
                "Requested max sync memory of {} MB is greater than half of system memory ({} MB), forcing to half of system memory",
                to_mb(max_sync_memory),
                to_mb(total_memory / 2)
            );
            max_sync_memory = total_memory / 2;
        }

        if max_sync_memory < MIN_SYNC_MEMORY {
            warn!(
                "Requested max sync memory of {} MB, but minimum recommended is 800 MB, forcing max sync memory to 800 MB",
                to_mb(max_sync_memory)
            );
            max_sync_memory = MIN_SYNC_MEMORY;
        }

        debug!("Total system memory: {} MB", to_mb(total_memory));

        let (download_request_mem, message_build_mem) = if max_sync_memory < 2 * GIGABYTE {
            (MIN_DOWNLOAD_REQUEST_MEM, MIN_MESSAGE_BUILDING_MEM)
        } else if max_sync_memory == 2 * GIGABYTE {
            // Smaller download requests mean more frequent progress updates; most of
            // the sync time is spent building anyway.
            (max_download_request_mem, max_message_building_mem)
        } else {
            // Divided by 8: the download and build stages use about 4x their budget each.
            let remaining = (max_sync_memory - 2 * GIGABYTE) / 8;
            (
                max_download_request_mem + remaining,
                max_message_building_mem + remaining,
            )
        };

        let limits = SyncLimits {
            max_sync_memory,
            download_request_mem,
            message_build_mem,
            max_parallel_downloads,
        };
        debug!("Max sync memory: {} MB", to_mb(limits.max_sync_memory));
        debug!(
            "Sync download request mem: {} MB",
            to_mb(limits.download_request_mem)
        );
        debug!("Sync message build mem: {} MB", to_mb(limits.message_build_mem));
        limits
    }
}
