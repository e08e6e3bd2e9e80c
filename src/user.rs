use crate::corpus::PromptCorpus;
use crate::error::{AttemptError, ConfigError};
use crate::metrics::EventSink;
use crate::request::RequestBuilder;
use crate::stream::{Outcome, StreamConsumer};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Virtual User
// =============================================================================

/// Shared, read-only inputs handed to every virtual user.
#[derive(Clone)]
pub struct UserContext {
    pub corpus: Arc<PromptCorpus>,
    pub builder: Arc<RequestBuilder>,
    pub sink: Arc<dyn EventSink>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

/// One simulated client. Owns its HTTP connection pool; the pool is released
/// when the user is dropped.
pub struct VirtualUser {
    id: usize,
    consumer: StreamConsumer,
    ctx: UserContext,
}

impl VirtualUser {
    pub fn new(id: usize, ctx: UserContext) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .connect_timeout(ctx.connect_timeout)
            .build()
            .map_err(ConfigError::Client)?;

        Ok(Self {
            id,
            consumer: StreamConsumer::new(client, ctx.read_timeout),
            ctx,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// One task invocation: build a fresh attempt, run it to a terminal state,
    /// report the terminal event.
    pub async fn run_task(&self) -> Outcome {
        let content = self.ctx.corpus.next_user_content();
        let outcome = match self.ctx.builder.build(&content) {
            Ok(attempt) => self.consumer.execute(attempt, self.ctx.sink.as_ref()).await,
            Err(e) => Outcome::ProtocolError {
                elapsed: Duration::ZERO,
                cause: AttemptError::from(e),
            },
        };

        let event = outcome.to_event();
        debug!(
            "User {} finished attempt: {} in {:?} (size {})",
            self.id,
            event.kind.name(),
            outcome.elapsed(),
            event.size
        );
        self.ctx.sink.report(event);
        outcome
    }
}
