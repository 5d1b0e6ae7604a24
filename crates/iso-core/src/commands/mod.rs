pub mod archive;
pub mod fetch;

pub use archive::{archive_paths, directory_to_metadata, upload_tree, ArchiveResult, Blacklist};
pub use fetch::{fetch_isolated, FetchOptions};
