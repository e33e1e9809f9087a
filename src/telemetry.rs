//! Structured provider events and the sinks that receive them.
//!
//! Shadow comparisons, fallback steps and bootstrap failures are reported as
//! [`ProviderEvent`]s through an [`EventSink`]. Emitting never blocks and never
//! fails, so the calling path is unaffected by whatever the sink does.
//!
//! There is no process-wide logger state: a [`ProviderContext`] is created per
//! container build and cloned into every component that reports events.

use crate::chain::ChainId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// Which side of a traffic switch produced the authoritative value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchSide {
    Current,
    Target,
}

impl SwitchSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchSide::Current => "current",
            SwitchSide::Target => "target",
        }
    }

    pub fn other(&self) -> SwitchSide {
        match self {
            SwitchSide::Current => SwitchSide::Target,
            SwitchSide::Target => SwitchSide::Current,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    ShadowMatch {
        provider: String,
        key: String,
    },
    ShadowMismatch {
        provider: String,
        key: String,
        divergence: String,
    },
    ShadowFailure {
        provider: String,
        key: String,
        side: SwitchSide,
        error: String,
    },
    ShadowTimeout {
        provider: String,
        key: String,
        side: SwitchSide,
        timeout: Duration,
    },
    /// Outcome of consulting the source of truth after a mismatch.
    SourceOfTruthAudit {
        provider: String,
        key: String,
        current_agrees: Option<bool>,
        target_agrees: Option<bool>,
    },
    FallbackStep {
        chain: String,
        candidate: String,
        attempt: usize,
        error: String,
    },
    FallbackSelected {
        chain: String,
        candidate: String,
        attempt: usize,
    },
    CacheComparison {
        cache: String,
        key: String,
        matched: bool,
        detail: String,
    },
    NetworkUnusable {
        chain_id: ChainId,
        reason: String,
    },
}

impl ProviderEvent {
    pub fn level(&self) -> EventLevel {
        match self {
            ProviderEvent::ShadowMatch { .. } => EventLevel::Debug,
            ProviderEvent::FallbackSelected { .. } => EventLevel::Info,
            ProviderEvent::ShadowMismatch { .. }
            | ProviderEvent::ShadowFailure { .. }
            | ProviderEvent::ShadowTimeout { .. }
            | ProviderEvent::SourceOfTruthAudit { .. }
            | ProviderEvent::FallbackStep { .. } => EventLevel::Warn,
            ProviderEvent::CacheComparison { matched, .. } => {
                if *matched {
                    EventLevel::Debug
                } else {
                    EventLevel::Warn
                }
            }
            ProviderEvent::NetworkUnusable { .. } => EventLevel::Fatal,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ProviderEvent::ShadowMatch { provider, key } => {
                format!("[{provider}] shadow result matches for {key}")
            }
            ProviderEvent::ShadowMismatch {
                provider,
                key,
                divergence,
            } => format!("[{provider}] shadow mismatch for {key}: {divergence}"),
            ProviderEvent::ShadowFailure {
                provider,
                key,
                side,
                error,
            } => format!(
                "[{provider}] {} provider failed in shadow for {key}: {error}",
                side.as_str()
            ),
            ProviderEvent::ShadowTimeout {
                provider,
                key,
                side,
                timeout,
            } => format!(
                "[{provider}] {} provider timed out in shadow for {key} after {timeout:?}",
                side.as_str()
            ),
            ProviderEvent::SourceOfTruthAudit {
                provider,
                key,
                current_agrees,
                target_agrees,
            } => format!(
                "[{provider}] source of truth audit for {key}: current={current_agrees:?} target={target_agrees:?}"
            ),
            ProviderEvent::FallbackStep {
                chain,
                candidate,
                attempt,
                error,
            } => format!("[{chain}] candidate #{attempt} '{candidate}' failed: {error}"),
            ProviderEvent::FallbackSelected {
                chain,
                candidate,
                attempt,
            } => format!("[{chain}] using candidate #{attempt} '{candidate}'"),
            ProviderEvent::CacheComparison {
                cache,
                key,
                matched,
                detail,
            } => format!("[{cache}] cached value for {key} matched={matched}: {detail}"),
            ProviderEvent::NetworkUnusable { chain_id, reason } => {
                format!("chain {chain_id} is unusable: {reason}")
            }
        }
    }
}

/// Observability sink. Implementations must return promptly.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProviderEvent);
}

/// Writes every event as a tracing record at the event's level.
#[derive(Debug, Clone, Default)]
pub struct TracingSink {
    activity_id: Option<Uuid>,
}

impl TracingSink {
    pub fn new(activity_id: Uuid) -> Self {
        Self {
            activity_id: Some(activity_id),
        }
    }
}

impl EventSink for TracingSink {
    fn emit(&self, event: ProviderEvent) {
        let activity = self.activity_id.map(|id| id.to_string()).unwrap_or_default();
        let message = event.message();
        match event.level() {
            EventLevel::Debug => debug!(activity_id = %activity, "{}", message),
            EventLevel::Info => info!(activity_id = %activity, "{}", message),
            EventLevel::Warn => warn!(activity_id = %activity, "{}", message),
            EventLevel::Error => error!(activity_id = %activity, "{}", message),
            EventLevel::Fatal => error!(activity_id = %activity, fatal = true, "{}", message),
        }
    }
}

/// Forwards events over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProviderEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProviderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ProviderEvent) {
        // Receiver dropped means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ProviderEvent) {}
}

/// Per-build context threaded through every component.
#[derive(Clone)]
pub struct ProviderContext {
    pub activity_id: Uuid,
    sink: Arc<dyn EventSink>,
}

impl ProviderContext {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            activity_id: Uuid::new_v4(),
            sink,
        }
    }

    /// Context that reports through tracing under a fresh activity id.
    pub fn tracing() -> Self {
        let activity_id = Uuid::new_v4();
        Self {
            activity_id,
            sink: Arc::new(TracingSink::new(activity_id)),
        }
    }

    pub fn null() -> Self {
        Self::new(Arc::new(NullSink))
    }

    pub fn emit(&self, event: ProviderEvent) {
        self.sink.emit(event);
    }

    pub fn sink(&self) -> Arc<dyn EventSink> {
        self.sink.clone()
    }
}

impl std::fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderContext")
            .field("activity_id", &self.activity_id)
            .finish()
    }
}

/// Installs the global tracing subscriber. Binaries only; tests and library
/// callers bring their own.
pub fn init_tracing(json: bool, default_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))?
        .add_directive("hyper=warn".parse()?)
        .add_directive("ethers=warn".parse()?);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_delivers_events_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        let ctx = ProviderContext::new(Arc::new(sink));

        ctx.emit(ProviderEvent::ShadowMatch {
            provider: "pool".into(),
            key: "k".into(),
        });
        ctx.emit(ProviderEvent::NetworkUnusable {
            chain_id: ChainId::MODE,
            reason: "missing rpc".into(),
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.level(), EventLevel::Debug);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.level(), EventLevel::Fatal);
        assert!(second.message().contains("34443"));
    }

    #[test]
    fn test_emit_after_receiver_dropped_is_silent() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(ProviderEvent::ShadowMatch {
            provider: "pool".into(),
            key: "k".into(),
        });
    }

    #[test]
    fn test_mismatch_is_warning_not_error() {
        let event = ProviderEvent::ShadowMismatch {
            provider: "quote".into(),
            key: "k".into(),
            divergence: "amount differs".into(),
        };
        assert_eq!(event.level(), EventLevel::Warn);
    }
}
