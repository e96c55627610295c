//! External collaborators, expressed as traits the platform shell implements.
//!
//! Every capability is injected as an `Arc<dyn Trait>` so tests can swap in
//! fakes and the shells can bridge to their native APIs.

mod connectivity;
mod generator;
mod image;
mod kv;

pub use self::connectivity::{ConnectivityProbe, ProbeError, ProbeResult};
pub use self::generator::{GenerationFailure, RecipeGenerator};
pub use self::image::{ImagePipeline, ImagePipelineError};
pub use self::kv::{
    KeyNamespace, KeyValueStore, KvError, KvKey, MemoryKvStore, StorageErrorCode, TypedKvStore,
    MAX_KEY_LENGTH, MAX_VALUE_SIZE,
};

#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKvStore;
