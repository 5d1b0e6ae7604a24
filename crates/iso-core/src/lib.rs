pub mod cache;
pub mod commands;
pub mod compress;
pub mod config;
pub mod fetch_queue;
pub mod item;
pub mod manifest;
pub mod platform;
pub mod pool;
pub mod storage;
pub mod verify;

pub use iso_types::error;

pub use cache::{CachePolicy, ContentAddressedCache, DiskCache, MemoryCache};
pub use fetch_queue::FetchQueue;
pub use item::Item;
pub use storage::{Storage, StorageOptions};

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
