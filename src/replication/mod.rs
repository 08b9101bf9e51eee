// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Asynchronous double-write to a secondary target.

pub mod classify;
pub mod job;
pub mod pipeline;
pub mod wal;

pub use job::ReplicationJob;
pub use pipeline::{PipelineStatsSnapshot, ReplicationPipeline};
