//! The storage layer used by the benchmark and scanner tools.
//!
//! [`StorageService`] is a cheap-to-clone handle around a single bucket on one of the supported
//! backends. It exposes exactly the three operations the tools need: writing an object, streaming
//! an object back, and listing a prefix page by page using an opaque continuation token.
//!
//! Every operation is timed and emitted as a `merni` distribution tagged with the backend type.
//! Whether those metrics go anywhere depends on the sink installed by the binary.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod backend;
pub mod error;
pub mod object;
pub mod service;
pub mod stream;

pub use error::{Error, Result};
pub use object::{ListPage, ObjectMetadata, ObjectSummary};
pub use service::{StorageConfig, StorageService};
pub use stream::PayloadStream;
