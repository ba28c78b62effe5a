//! Streaming batch API: emit request outcomes as they complete.
//!
//! ## Why stream?
//!
//! A batch of video transcodes can take hours. [`convert_stream`] yields
//! each request's outcome the moment it finishes, so callers can update a
//! job table or move files along without waiting for the slowest request.
//! Items arrive in completion order; each carries its request id.
//!
//! [`crate::convert::convert_batch`] is the eager equivalent.

use crate::config::ConversionConfig;
use crate::convert::resolve_router;
use crate::error::ConvertError;
use crate::orchestrator::FallbackOrchestrator;
use crate::output::ConversionResult;
use crate::request::ConversionRequest;
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// One finished request: its id and outcome.
pub type RequestOutcome = (String, Result<ConversionResult, ConvertError>);

/// A boxed stream of request outcomes.
pub type OutcomeStream = Pin<Box<dyn Stream<Item = RequestOutcome> + Send>>;

/// Convert `requests`, at most `config.workers` at a time, streaming
/// outcomes as they complete.
///
/// Cancelling `cancel` stops every request still running; their outcomes are
/// still emitted (as [`ConvertError::Cancelled`]). Dropping the stream
/// drops the in-flight futures, which kills their methods, but skips the
/// destination restore, so cancel and drain when destinations matter.
///
/// # Errors
/// Fails only when no router can be resolved.
///
/// # Example
/// ```rust,no_run
/// use multiconvert::{convert_stream, ConversionConfig, ConversionRequest, Format};
/// use futures::StreamExt;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let requests = vec![
///     ConversionRequest::into_dir("a.wav", "out", Format::Mp3)?,
///     ConversionRequest::into_dir("b.wav", "out", Format::Mp3)?,
/// ];
/// let config = ConversionConfig::default();
/// let mut outcomes = convert_stream(requests, &config, CancellationToken::new())?;
/// while let Some((id, outcome)) = outcomes.next().await {
///     match outcome {
///         Ok(r) => println!("{id}: done with {:?}", r.chosen_method),
///         Err(e) => eprintln!("{id}: {e}"),
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub fn convert_stream(
    requests: Vec<ConversionRequest>,
    config: &ConversionConfig,
    cancel: CancellationToken,
) -> Result<OutcomeStream, ConvertError> {
    let router = resolve_router(config)?;
    let orchestrator = Arc::new(FallbackOrchestrator::new(config, router));
    info!(
        "Starting streaming batch of {} request(s), {} worker(s)",
        requests.len(),
        config.workers
    );

    let s = stream::iter(requests.into_iter().map(move |request| {
        let orchestrator = Arc::clone(&orchestrator);
        let token = cancel.child_token();
        async move {
            let outcome = orchestrator.run(&request, &token).await;
            (request.id().to_string(), outcome)
        }
    }))
    .buffer_unordered(config.workers);

    Ok(Box::pin(s))
}
