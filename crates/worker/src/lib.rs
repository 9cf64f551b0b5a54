//! llmrelay worker
//!
//! Serverless job handler in front of an LLM inference engine. Each job is
//! normalized into a request descriptor, served by the native or the
//! OpenAI-compatible facade and relayed back batch by batch. Engine failures
//! that leave the engine unusable terminate the process.

pub mod batching;
pub mod concurrency;
pub mod context;
pub mod engine;
pub mod facade;
pub mod handler;
pub mod input;
pub mod liveness;
pub mod relay;

#[cfg(test)]
pub(crate) mod testing;

pub use batching::{BatchPolicy, BatchSize};
pub use concurrency::ConcurrencyAdvertiser;
pub use context::WorkerContext;
pub use engine::{HttpEngine, InferenceEngine};
pub use facade::{CompatibleFacade, EngineFacades, Facade, NativeFacade};
pub use handler::WorkerHandler;
pub use input::{RequestDescriptor, RouteKind};
pub use liveness::{classify, FailureClass, LivenessMonitor, ProcessExit, Terminator};
