use crate::codec::Payload;
use crate::trace::MessageContext;

use std::convert::Infallible;
use std::error::Error;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use thiserror::Error;

/// Marker trait for handler errors.
pub trait HandlerError: Error + Send + Sync + 'static {}

impl HandlerError for Infallible {}

/// Boxed error returned by closure handlers.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerFailure(Box<dyn Error + Send + Sync>);

impl HandlerFailure {
    /// Wraps any error or message.
    pub fn new(error: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self(error.into())
    }
}

impl HandlerError for HandlerFailure {}

/// Processes decoded messages of one subscription.
///
/// Runs on the subscription's dispatch task and may take its time: while it
/// runs, further deliveries queue up to the subject's in-flight bound.
/// Returning an error asks for redelivery after the handler retry wait.
#[async_trait]
pub trait Handler<T>
where
    Self: Clone + Send + Sync + 'static,
    T: Payload,
{
    /// The error type for the handler.
    type Error: HandlerError;

    /// Handles one message.
    async fn handle(&self, context: MessageContext, payload: T) -> Result<(), Self::Error>;
}

/// A [`Handler`] backed by an async closure; see [`handler_fn`].
pub struct FnHandler<F, T> {
    f: F,
    _payload: PhantomData<fn() -> T>,
}

impl<F, T> Clone for FnHandler<F, T>
where
    F: Clone,
{
    fn clone(&self) -> Self {
        Self {
            f: self.f.clone(),
            _payload: PhantomData,
        }
    }
}

impl<F, T> Debug for FnHandler<F, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

/// Turns an async closure into a [`Handler`].
///
/// ```
/// use courier::{MessageContext, handler_fn};
///
/// let handler = handler_fn(|context: MessageContext, payload: String| async move {
///     println!("{}: {payload}", context.trace);
///     Ok::<_, std::io::Error>(())
/// });
/// # let _ = handler;
/// ```
pub const fn handler_fn<F, T, Fut, E>(f: F) -> FnHandler<F, T>
where
    F: Fn(MessageContext, T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send,
    E: Into<Box<dyn Error + Send + Sync>>,
    T: Payload,
{
    FnHandler {
        f,
        _payload: PhantomData,
    }
}

#[async_trait]
impl<F, T, Fut, E> Handler<T> for FnHandler<F, T>
where
    F: Fn(MessageContext, T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send,
    E: Into<Box<dyn Error + Send + Sync>>,
    T: Payload,
{
    type Error = HandlerFailure;

    async fn handle(&self, context: MessageContext, payload: T) -> Result<(), Self::Error> {
        (self.f)(context, payload).await.map_err(HandlerFailure::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::trace::TraceContext;

    use courier_broker::Headers;

    fn context() -> MessageContext {
        MessageContext {
            trace: TraceContext::new(),
            subject: "orders.created".to_string(),
            tag: None,
            delivery_count: 1,
            headers: Headers::new(),
        }
    }

    #[tokio::test]
    async fn test_handler_fn_success() {
        let handler = handler_fn(|_context: MessageContext, payload: String| async move {
            assert_eq!(payload, "hello");
            Ok::<_, HandlerFailure>(())
        });

        handler
            .handle(context(), "hello".to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_handler_fn_error_is_boxed() {
        let handler = handler_fn(|_context: MessageContext, _payload: String| async move {
            Err::<(), _>("boom")
        });

        let error = handler
            .handle(context(), String::new())
            .await
            .unwrap_err();

        assert_eq!(error.to_string(), "boom");
    }
}
