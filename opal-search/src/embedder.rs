//! External embedder interface
//!
//! The engine accepts numeric vectors from any source: a local model, a
//! remote service, a test stub. Embedders are opaque; the engine performs
//! no retries and no normalization on their behalf.

use async_trait::async_trait;

/// Failure reported by an embedder. The engine surfaces the reason verbatim.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct EmbedError(pub String);

/// Progress callback for long-running embedders, called with values in 0..=1.
pub type ProgressFn<'a> = &'a (dyn Fn(f32) + Send + Sync);

/// Turns text into a fixed-dimension vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f64>, EmbedError>;

    /// Embed with progress reporting. The default implementation signals
    /// only start and completion.
    async fn embed_with_progress(
        &self,
        text: &str,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<Vec<f64>, EmbedError> {
        if let Some(report) = progress {
            report(0.0);
        }
        let vector = self.embed(text).await?;
        if let Some(report) = progress {
            report(1.0);
        }
        Ok(vector)
    }
}
