//! Engine facades
//!
//! Two entry points over the one engine instance: the native job format and
//! an OpenAI-compatible adapter. One facade serves each request, picked from
//! the descriptor's route alone.

mod compatible;
mod native;
pub mod openai;

pub use compatible::CompatibleFacade;
pub use native::NativeFacade;

use std::sync::Arc;

use futures::stream;
use llmrelay_common::RelayError;
use llmrelay_host::BatchStream;

use crate::batching::{BatchPolicy, BatchSize};
use crate::engine::InferenceEngine;
use crate::input::{RequestDescriptor, RouteKind};

/// A way of turning a request into output batches
pub trait Facade: Send + Sync {
    /// Start a generation. The stream is lazy and ends after the last
    /// batch or after the first error.
    fn generate(&self, descriptor: RequestDescriptor) -> BatchStream;
}

/// Both facades, sharing one engine
pub struct EngineFacades {
    native: NativeFacade,
    compatible: CompatibleFacade,
}

impl EngineFacades {
    /// `policy` is the default batch policy for compatible streams; native
    /// requests carry their own.
    pub fn new(engine: Arc<dyn InferenceEngine>, policy: BatchPolicy, raw_output: bool) -> Self {
        let native = NativeFacade::new(engine);
        let compatible = CompatibleFacade::new(Arc::clone(native.engine()), policy, raw_output);
        Self { native, compatible }
    }

    pub fn select(&self, descriptor: &RequestDescriptor) -> &dyn Facade {
        match descriptor.route() {
            RouteKind::Native => &self.native,
            RouteKind::Compatible => &self.compatible,
        }
    }

    pub fn native(&self) -> &NativeFacade {
        &self.native
    }

    pub fn compatible(&self) -> &CompatibleFacade {
        &self.compatible
    }
}

/// Stream yielding a single error
fn failed(err: RelayError) -> BatchStream {
    Box::pin(stream::once(async move { Err(err) }))
}

/// Groups items into batches whose size follows a [`BatchSize`]
struct Batcher<T> {
    size: BatchSize,
    items: Vec<T>,
}

impl<T> Batcher<T> {
    fn new(policy: BatchPolicy) -> Self {
        Self {
            size: BatchSize::new(policy),
            items: Vec::new(),
        }
    }

    /// Add an item, returning the full batch once the current size is reached
    fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.items.push(item);
        if self.items.len() < self.size.current() {
            return None;
        }
        self.size.grow();
        Some(std::mem::take(&mut self.items))
    }

    /// Whatever is left, if anything
    fn flush(&mut self) -> Option<Vec<T>> {
        if self.items.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.items))
        }
    }
}
