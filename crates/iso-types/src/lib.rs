pub mod digest;
pub mod error;
pub mod namespace;

pub use digest::{Digest, HashAlgorithm, Hasher};
pub use error::{ErrorKind, IsoError, Result};
pub use namespace::Namespace;
