//! Ordered degradation across candidates of decreasing freshness.
//!
//! A [`FallbackChain`] holds lazy factories. Evaluation runs them in order,
//! each at most once, and stops at the first success. Every failed step is
//! logged and reported as a [`ProviderEvent::FallbackStep`].
//!
//! Chains that must always produce something end with [`FallbackChain::build_or`],
//! whose terminal factory cannot fail by type. Chains without a terminal use
//! [`FallbackChain::try_build`] and surface [`ProviderError::ChainExhausted`].

use crate::error::{ProviderError, Result};
use crate::metrics;
use crate::telemetry::{ProviderContext, ProviderEvent};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use tracing::{info, warn};

type Factory<'a, T> = Box<dyn FnOnce() -> BoxFuture<'a, Result<T>> + Send + 'a>;

pub struct FallbackChain<'a, T> {
    label: String,
    ctx: ProviderContext,
    candidates: Vec<(String, Factory<'a, T>)>,
}

impl<'a, T: Send + 'a> FallbackChain<'a, T> {
    pub fn new(label: impl Into<String>, ctx: ProviderContext) -> Self {
        Self {
            label: label.into(),
            ctx,
            candidates: Vec::new(),
        }
    }

    /// Appends a candidate. The factory only runs if every earlier one failed.
    pub fn candidate<F, Fut>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T>> + Send + 'a,
    {
        self.candidates
            .push((name.into(), Box::new(move || factory().boxed())));
        self
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Runs the candidates. Fails with `ChainExhausted` carrying the last error.
    pub async fn try_build(self) -> Result<T> {
        let label = self.label.clone();
        match self.run().await {
            Ok(value) => Ok(value),
            Err((attempts, last_error)) => Err(ProviderError::ChainExhausted {
                chain: label,
                attempts,
                last_error: Box::new(last_error),
            }),
        }
    }

    /// Runs the candidates and falls back to `terminal`, which cannot fail.
    pub async fn build_or<F, Fut>(self, terminal_name: &str, terminal: F) -> T
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = T> + Send + 'a,
    {
        let label = self.label.clone();
        let ctx = self.ctx.clone();
        match self.run().await {
            Ok(value) => value,
            Err((attempts, _)) => {
                let attempt = attempts + 1;
                info!(chain = %label, candidate = %terminal_name, attempt, "using terminal fallback");
                metrics::increment_fallback_selected(&label, terminal_name);
                ctx.emit(ProviderEvent::FallbackSelected {
                    chain: label,
                    candidate: terminal_name.to_string(),
                    attempt,
                });
                terminal().await
            }
        }
    }

    async fn run(self) -> std::result::Result<T, (usize, ProviderError)> {
        let mut last_error =
            ProviderError::InvalidRequest(format!("fallback chain '{}' has no candidates", self.label));
        let mut attempts = 0;

        for (index, (name, factory)) in self.candidates.into_iter().enumerate() {
            let attempt = index + 1;
            attempts = attempt;
            match factory().await {
                Ok(value) => {
                    info!(chain = %self.label, candidate = %name, attempt, "fallback candidate selected");
                    metrics::increment_fallback_selected(&self.label, &name);
                    self.ctx.emit(ProviderEvent::FallbackSelected {
                        chain: self.label.clone(),
                        candidate: name,
                        attempt,
                    });
                    return Ok(value);
                }
                Err(e) => {
                    warn!(chain = %self.label, candidate = %name, attempt, error = %e, "fallback candidate failed");
                    metrics::increment_fallback_step(&self.label, &name);
                    self.ctx.emit(ProviderEvent::FallbackStep {
                        chain: self.label.clone(),
                        candidate: name,
                        attempt,
                        error: e.to_string(),
                    });
                    last_error = e;
                }
            }
        }
        Err((attempts, last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ChannelSink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_stops_at_first_success() {
        let third_calls = Arc::new(AtomicUsize::new(0));
        let third = third_calls.clone();

        let value = FallbackChain::new("numbers", ProviderContext::null())
            .candidate("first", || async { Err(ProviderError::unavailable("first", "down")) })
            .candidate("second", || async { Ok(2) })
            .candidate("third", move || async move {
                third.fetch_add(1, Ordering::SeqCst);
                Ok(3)
            })
            .try_build()
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(third_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exhausted_chain_reports_last_error() {
        let err = FallbackChain::<u32>::new("numbers", ProviderContext::null())
            .candidate("a", || async { Err(ProviderError::unavailable("a", "first failure")) })
            .candidate("b", || async { Err(ProviderError::unavailable("b", "second failure")) })
            .try_build()
            .await
            .unwrap_err();

        match err {
            ProviderError::ChainExhausted {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 2);
                assert!(last_error.to_string().contains("second failure"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_terminal_used_when_all_fail() {
        let (sink, mut rx) = ChannelSink::new();
        let ctx = ProviderContext::new(Arc::new(sink));

        let value = FallbackChain::new("numbers", ctx)
            .candidate("a", || async { Err(ProviderError::unavailable("a", "down")) })
            .build_or("static", || async { 42 })
            .await;
        assert_eq!(value, 42);

        let step = rx.recv().await.unwrap();
        assert!(matches!(step, ProviderEvent::FallbackStep { attempt: 1, .. }));
        let selected = rx.recv().await.unwrap();
        assert!(matches!(
            selected,
            ProviderEvent::FallbackSelected { attempt: 2, ref candidate, .. } if candidate == "static"
        ));
    }

    #[tokio::test]
    async fn test_empty_chain_is_exhausted() {
        let err = FallbackChain::<u32>::new("empty", ProviderContext::null())
            .try_build()
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ChainExhausted { attempts: 0, .. }));
    }
}
