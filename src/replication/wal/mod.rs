// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable replication log.
//!
//! Jobs are appended as JSON lines to per-backend segment files before they
//! enter the in-memory queue. Segments left behind by a crash (or a dropped
//! job) are replayed against the secondary target on the next start.

pub mod replay;
pub mod segment;
pub mod store;

pub use replay::{ReplayReport, ReplayTarget, SegmentReplayer};
pub use segment::SegmentName;
pub use store::{LogSegmentStore, SegmentStatsSnapshot};
