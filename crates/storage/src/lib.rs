//! Local storage for FileMover
//!
//! Everything that touches the disk on behalf of the transfer engine:
//! - `pool`: the shared pool directory that transfers land in
//! - `sweeper`: background eviction keeping the pool under its size quota
//! - `download_area`: per-user hard/soft link publication of pool files and
//!   age-based cleanup

pub mod download_area;
pub mod pool;
pub mod sweeper;

pub use download_area::{CleanReport, DownloadArea, DownloadEntry};
pub use pool::{StorageError, StoragePool, STORE_PREFIX};
pub use sweeper::{sweep_pool, CacheSweeper, SweepReport, SweeperConfig};
