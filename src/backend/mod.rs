// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The execute contract and its implementations.
//!
//! - [`InMemoryBackend`]: in-process key-value interpreter with fault injection
//! - [`RedisBackend`]: one `ConnectionManager` per endpoint
//! - [`SqlBackend`]: one sqlx `AnyPool` per endpoint

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;

pub use memory::InMemoryBackend;
pub use self::redis::RedisBackend;
pub use sql::SqlBackend;
pub use traits::{Backend, BackendError};
