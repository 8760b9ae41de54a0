use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use sandbox_bridge_error::{ErrorReport, SandboxError};
use sandbox_bridge_schema::AgentEvent;

use crate::capabilities::Capabilities;
use crate::options::SessionOptions;
use crate::provider::SandboxProvider;
use crate::session::{Session, TurnStream};

/// Runs a single prompt in a fresh sandbox.
///
/// The returned stream yields the turn's events and releases the sandbox when
/// the turn ends or fails. Dropping the stream, or this future before it
/// resolves, releases it in the background.
pub async fn query(
    provider: Arc<dyn SandboxProvider>,
    prompt: impl Into<String>,
    options: SessionOptions,
    capabilities: Capabilities,
) -> Result<QueryStream, SandboxError> {
    let session = Session::new(provider, options, capabilities)?;
    let started = async {
        session.open().await?;
        session.run_turn(prompt).await
    }
    .await;

    match started {
        Ok(turn) => Ok(QueryStream {
            session: session.clone(),
            turn: Some(turn),
            closing: None,
            closed: false,
            warnings: Vec::new(),
        }),
        Err(err) => {
            session.close().await;
            Err(err)
        }
    }
}

pub struct QueryStream {
    session: Session,
    turn: Option<TurnStream>,
    closing: Option<BoxFuture<'static, ()>>,
    closed: bool,
    warnings: Vec<ErrorReport>,
}

impl std::fmt::Debug for QueryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStream")
            .field("session", &self.session)
            .field("closed", &self.closed)
            .finish()
    }
}

impl QueryStream {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn warnings(&self) -> &[ErrorReport] {
        &self.warnings
    }

    /// Drains the remaining events. Stops at the first error.
    pub async fn collect_events(mut self) -> Result<Vec<AgentEvent>, SandboxError> {
        let mut events = Vec::new();
        while let Some(item) = self.next().await {
            events.push(item?);
        }
        Ok(events)
    }

    fn start_close(&mut self) {
        if let Some(turn) = self.turn.take() {
            self.warnings = turn.warnings().to_vec();
        }
        if self.closing.is_none() && !self.closed {
            let session = self.session.clone();
            self.closing = Some(async move { session.close().await }.boxed());
        }
    }
}

impl Stream for QueryStream {
    type Item = Result<AgentEvent, SandboxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if let Some(closing) = this.closing.as_mut() {
                return match closing.poll_unpin(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(()) => {
                        this.closing = None;
                        this.closed = true;
                        Poll::Ready(None)
                    }
                };
            }
            if this.closed {
                return Poll::Ready(None);
            }

            let Some(turn) = this.turn.as_mut() else {
                this.start_close();
                continue;
            };
            match turn.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(event))) => {
                    if turn.is_finished() {
                        this.warnings = turn.warnings().to_vec();
                    }
                    return Poll::Ready(Some(Ok(event)));
                }
                Poll::Ready(Some(Err(err))) => {
                    this.start_close();
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.start_close();
                }
            }
        }
    }
}
