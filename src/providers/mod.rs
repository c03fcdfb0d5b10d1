//! Text generation providers
//!
//! The orchestrator talks to the generation service through [`Generator`]:
//! a streaming call for the reply itself and a one-shot call for
//! summarization and query refinement.

pub mod ollama;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

pub use ollama::OllamaGenerator;

/// Stream of generated text fragments, ending at the first error
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// External text generation service
#[async_trait]
pub trait Generator: Send + Sync {
    /// Starts generating a reply for `prompt`
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be started; failures after
    /// the first fragment arrive as `Err` items on the stream.
    async fn generate_stream(&self, prompt: &str) -> Result<FragmentStream>;

    /// Generates a complete reply for `prompt`
    async fn generate(&self, prompt: &str) -> Result<String>;
}
