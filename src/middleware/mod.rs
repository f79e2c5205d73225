//! Middleware pipeline: composable before/after request handler logic.
//!
//! Each middleware wraps the next layer, so it can inspect the request,
//! answer it outright (short-circuit), or decorate the downstream response.
//! The response cache is one such layer: see
//! [`CacheMiddleware`](crate::cache::CacheMiddleware).
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining chain; [`Next::run`] advances it.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`from_middleware`] / [`handler_fn`]: build handlers from a trait object
//!   or from a terminal origin handler.
//! - [`Pipeline`]: an ordered stack that dispatches requests.
//! - [`LoggerMiddleware`]: request/response logger.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Request, Response, StatusCode, context::Context};

/// Boxed future returned by every middleware layer.
pub type ResponseFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// A type-erased, reference-counted middleware function.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tiercache::{context::Context, middleware::{MiddlewareHandler, Next}};
///
/// let handler: MiddlewareHandler = Arc::new(|ctx: Context, next: Next| {
///     Box::pin(async move { next.run(ctx).await })
/// });
/// ```
pub type MiddlewareHandler = Arc<dyn Fn(Context, Next) -> ResponseFuture + Send + Sync + 'static>;

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so a layer can forward a request
/// at most once.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    // Position of the layer the next `run` call invokes.
    index: usize,
}

impl Next {
    /// Creates a cursor positioned at the start of `middlewares`.
    pub fn new(middlewares: impl Into<Arc<[MiddlewareHandler]>>) -> Self {
        Self {
            middlewares: middlewares.into(),
            index: 0,
        }
    }

    /// Invokes the next layer and returns its response.
    ///
    /// When the chain is exhausted without any layer answering, a
    /// `500 Internal Server Error` is returned.
    pub async fn run(mut self, ctx: Context) -> Response {
        if self.index < self.middlewares.len() {
            let handler = Arc::clone(&self.middlewares[self.index]);
            self.index += 1;
            handler(ctx, self).await
        } else {
            Response::new(StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline")
        }
    }
}

/// The core middleware trait.
///
/// Implementors may pass through (`next.run(ctx).await`), short-circuit by
/// returning a response without calling `next`, or decorate the downstream
/// response. Middleware is shared across Tokio tasks, hence `Send + Sync`.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> ResponseFuture;
}

/// Converts a [`Middleware`] into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// Wraps an origin handler as the terminal layer of a pipeline.
///
/// The handler never sees `Next`; whatever it returns is the response.
pub fn handler_fn<H, F>(handler: H) -> MiddlewareHandler
where
    H: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |ctx: Context, _next: Next| Box::pin(handler(ctx)))
}

/// An ordered middleware stack.
///
/// Layers run in the order they were added; the origin handler goes last.
///
/// ```rust,no_run
/// use tiercache::{Response, StatusCode};
/// use tiercache::middleware::{LoggerMiddleware, Pipeline};
///
/// let pipeline = Pipeline::new()
///     .layer(LoggerMiddleware)
///     .handler(|_ctx| async { Response::new(StatusCode::Ok).body("hello") });
/// ```
#[derive(Clone, Default)]
pub struct Pipeline {
    layers: Vec<MiddlewareHandler>,
    chain: Option<Arc<[MiddlewareHandler]>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware layer.
    #[must_use]
    pub fn layer<M>(self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.layer_arc(Arc::new(middleware))
    }

    /// Appends a middleware layer that is also held elsewhere.
    #[must_use]
    pub fn layer_arc<M>(mut self, middleware: Arc<M>) -> Self
    where
        M: Middleware + 'static,
    {
        self.layers.push(from_middleware(middleware));
        self.chain = None;
        self
    }

    /// Sets the origin handler and freezes the stack.
    #[must_use]
    pub fn handler<H, F>(mut self, handler: H) -> Self
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        self.layers.push(handler_fn(handler));
        self.chain = Some(self.layers.clone().into());
        self
    }

    /// Runs `ctx` through the stack.
    pub async fn dispatch(&self, ctx: Context) -> Response {
        let chain = match &self.chain {
            Some(chain) => Arc::clone(chain),
            None => self.layers.clone().into(),
        };
        Next::new(chain).run(ctx).await
    }

    /// Wraps `request` in a fresh [`Context`] and dispatches it.
    pub async fn handle(&self, request: Request) -> Response {
        self.dispatch(Context::new(request)).await
    }
}

/// Logs each request's method, path, status, and duration.
///
/// Emits one `tracing::info!` line after the downstream handler completes:
///
/// ```text
/// METHOD /path - STATUS (duration)
/// ```
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> ResponseFuture {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_string();
            let path = ctx.request().path().to_string();

            let response = next.run(ctx).await;

            let duration = start.elapsed();
            let status = response.status().as_u16();
            let cache = response.headers().get("x-cache").unwrap_or("-");

            tracing::info!("{} {} - {} ({:?}) cache={}", method, path, status, duration, cache);

            response
        })
    }
}
