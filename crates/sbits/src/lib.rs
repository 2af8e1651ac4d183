//! Alopex SBITS - embedded append-only time series storage
//!
//! This crate stores fixed-size `(key, data)` records with strictly
//! increasing keys in circular page logs, sized for flash and SD media
//! with a handful of page buffers.
//!
//! # Components
//!
//! - [`Engine`]: put/get/flush/close, reclamation and recovery
//! - [`Spline`] / [`RadixSpline`]: learned index from keys to data pages
//! - [`RecordIter`]: range scans pruned by bitmap summaries
//! - [`VarDataStream`]: variable-length payloads stored beside the records
//! - [`query`]: pull-based relational operators over scans
//!
//! # Example
//!
//! ```rust
//! use alopex_sbits::{Devices, Engine, EngineConfig, IteratorQuery};
//!
//! let config = EngineConfig::default();
//! let mut db = Engine::open(config.clone(), Devices::in_memory(&config))?;
//!
//! for key in 0u32..1000 {
//!     db.put(&key.to_le_bytes(), &(key * 2).to_le_bytes())?;
//! }
//! db.flush()?;
//!
//! let mut value = [0u8; 4];
//! db.get(&500u32.to_le_bytes(), &mut value)?;
//! assert_eq!(u32::from_le_bytes(value), 1000);
//!
//! let count = db.iter(IteratorQuery::new().min_key(100).max_key(199))?.count();
//! assert_eq!(count, 100);
//! # Ok::<(), alopex_sbits::DbError>(())
//! ```

#![deny(missing_docs)]

pub mod bitmap;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod page;
pub mod query;
pub mod radix;
pub mod spline;
pub mod storage;

pub use bitmap::{BitmapPolicy, BucketBitmap, StepBitmap};
pub use buffer::IoStats;
pub use config::{EngineConfig, Parameters, SearchMethod};
pub use engine::{
    Devices, Engine, EngineState, IteratorQuery, Record, RecordIter, VarData, VarDataStream,
};
pub use error::{DbError, Result};
pub use radix::RadixSpline;
pub use spline::{Spline, SplineBounds, SplinePoint};
pub use storage::{FileDevice, MemoryDevice, PageDevice};
