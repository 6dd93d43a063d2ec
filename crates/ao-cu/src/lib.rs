//! Compute unit core.
//!
//! The evaluation pipeline: a message source over the SU feed, hydration
//! transforms, the WASM fold, the result store, the bounded process
//! memory cache, and checkpoint publish/discovery on the gateway. The
//! thin request layer, wallet loading, and the WASM runtime itself are
//! external collaborators behind the traits defined here.

pub mod cache;
pub mod checkpoint;
mod compress;
pub mod config;
mod error;
pub mod evaluator;
pub mod gateway;
pub mod hydrate;
pub mod source;
pub mod store;
pub mod su;
pub mod wasm;

pub use cache::{CacheEntry, CachedMemory, ProcessMemoryCache};
pub use checkpoint::{
    CheckpointAnchor, CheckpointStore, DiscoveryTarget, FoundCheckpoint, PublishMemory,
};
pub use compress::{gunzip, gzip};
pub use config::{ConfigError, CuConfig, Mode};
pub use error::{CuError, CuResult};
pub use evaluator::{checkpoint_eviction_hook, EvalResult, Evaluator};
pub use gateway::{ArweaveGateway, CheckpointQuery, Gateway, GatewayTransaction};
pub use hydrate::{HydrationPolicy, Hydrator};
pub use source::MessageSource;
pub use store::{EvalRange, EvaluationStore, FsEvalStore, MemEvalStore, SaveOutcome};
pub use su::{HttpSequencerClient, SequencerClient};
pub use wasm::{parse_output, ProcessModule, WasmOutput};
