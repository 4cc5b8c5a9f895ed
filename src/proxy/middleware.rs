//! Onion-ordered middleware pipeline.
//!
//! Handlers run in registration order. Each one gets the [`Context`] and a
//! [`Next`] holding the rest of the chain; whatever it does before awaiting
//! `next.run(ctx)` happens on the way in, whatever it does after happens on
//! the way out. The [`Forwarder`] is always the innermost stage.
//!
//! ```text
//!   A.before -> B.before -> Forwarder -> B.after -> A.after
//! ```
//!
//! A handler that never calls `next` short-circuits the rest of the chain.
//!
//! # Example
//!
//! ```ignore
//! use interpose::proxy::{Context, Middleware, Next, ProxyResult};
//!
//! struct Logger;
//!
//! #[async_trait::async_trait]
//! impl Middleware for Logger {
//!     async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> ProxyResult<()> {
//!         tracing::info!("-> {}", ctx.path());
//!         next.run(ctx).await?;
//!         tracing::info!("<- {:?}", ctx.response().map(|r| r.status()));
//!         Ok(())
//!     }
//! }
//! ```

use super::context::{Context, ProxyBody};
use super::error::{ProxyError, ProxyResult};
use super::forward::Forwarder;
use async_trait::async_trait;
use futures::FutureExt;
use hyper::Response;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// A request handler wrapped around the rest of the chain.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Handle a request, calling `next.run(ctx)` to continue inward.
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> ProxyResult<()>;
}

/// The remainder of the chain below the current handler.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    terminal: &'a Forwarder,
}

impl<'a> Next<'a> {
    /// Run the remaining handlers, then the forwarder.
    pub async fn run(self, ctx: &mut Context) -> ProxyResult<()> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    chain: rest,
                    terminal: self.terminal,
                };
                head.handle(ctx, next).await
            }
            None => self.terminal.forward(ctx).await,
        }
    }
}

/// Registered middleware composed with the forwarder.
///
/// Frozen once the proxy starts listening.
#[derive(Clone)]
pub struct Pipeline {
    middleware: Arc<[Arc<dyn Middleware>]>,
    forwarder: Arc<Forwarder>,
}

impl Pipeline {
    /// Compose `middleware` (outermost first) around `forwarder`.
    pub fn new(middleware: Vec<Arc<dyn Middleware>>, forwarder: Arc<Forwarder>) -> Self {
        Self {
            middleware: middleware.into(),
            forwarder,
        }
    }

    /// Number of user handlers.
    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    /// Whether no user handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// The innermost stage.
    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    /// Run the full chain for one request.
    ///
    /// Errors and panics from any stage are caught here once and routed to
    /// [`Context::on_error`]; the returned response is always well formed.
    pub async fn run(&self, mut ctx: Context) -> Response<ProxyBody> {
        let next = Next {
            chain: &self.middleware,
            terminal: &self.forwarder,
        };

        let outcome = AssertUnwindSafe(next.run(&mut ctx)).catch_unwind().await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => ctx.on_error(&e),
            Err(panic) => ctx.on_error(&ProxyError::Panic(panic_message(panic.as_ref()))),
        }

        ctx.into_response()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::context::{empty_body, status_response, Transport};
    use hyper::{Request, StatusCode};
    use std::sync::Mutex;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> ProxyResult<()> {
            self.log.lock().unwrap().push(format!("{}-before", self.name));
            tokio::time::sleep(Duration::from_millis(5)).await;
            next.run(ctx).await?;
            tokio::task::yield_now().await;
            self.log.lock().unwrap().push(format!("{}-after", self.name));
            Ok(())
        }
    }

    /// Innermost stand-in for the forwarder: answers without touching the
    /// network and records when it ran.
    struct Terminal {
        log: Log,
    }

    #[async_trait]
    impl Middleware for Terminal {
        async fn handle(&self, ctx: &mut Context, _next: Next<'_>) -> ProxyResult<()> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.log.lock().unwrap().push("terminal".to_string());
            ctx.respond(status_response(StatusCode::OK));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Middleware for Failing {
        async fn handle(&self, _ctx: &mut Context, _next: Next<'_>) -> ProxyResult<()> {
            Err(ProxyError::middleware("handler failed"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl Middleware for Panicking {
        async fn handle(&self, _ctx: &mut Context, _next: Next<'_>) -> ProxyResult<()> {
            panic!("handler panicked");
        }
    }

    fn context() -> Context {
        let (parts, _) = Request::builder().uri("/").body(()).unwrap().into_parts();
        Context::from_parts(
            parts,
            empty_body(),
            Transport::Plain,
            "127.0.0.1:40000".parse().unwrap(),
        )
    }

    fn pipeline(middleware: Vec<Arc<dyn Middleware>>) -> Pipeline {
        Pipeline::new(middleware, Arc::new(Forwarder::default()))
    }

    #[tokio::test]
    async fn test_onion_ordering_across_suspensions() {
        let log: Log = Arc::default();
        let pipeline = pipeline(vec![
            Arc::new(Recorder { name: "A", log: log.clone() }),
            Arc::new(Recorder { name: "B", log: log.clone() }),
            Arc::new(Terminal { log: log.clone() }),
        ]);

        let response = pipeline.run(context()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["A-before", "B-before", "terminal", "B-after", "A-after"]
        );
    }

    #[tokio::test]
    async fn test_concurrent_requests_keep_their_own_order() {
        let log_one: Log = Arc::default();
        let log_two: Log = Arc::default();
        let one = pipeline(vec![
            Arc::new(Recorder { name: "A", log: log_one.clone() }),
            Arc::new(Terminal { log: log_one.clone() }),
        ]);
        let two = pipeline(vec![
            Arc::new(Recorder { name: "A", log: log_two.clone() }),
            Arc::new(Terminal { log: log_two.clone() }),
        ]);

        tokio::join!(one.run(context()), two.run(context()));

        for log in [log_one, log_two] {
            assert_eq!(*log.lock().unwrap(), vec!["A-before", "terminal", "A-after"]);
        }
    }

    #[tokio::test]
    async fn test_error_becomes_500_and_skips_after_logic() {
        let log: Log = Arc::default();
        let pipeline = pipeline(vec![
            Arc::new(Recorder { name: "A", log: log.clone() }),
            Arc::new(Failing),
        ]);

        let response = pipeline.run(context()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(*log.lock().unwrap(), vec!["A-before"]);
    }

    #[tokio::test]
    async fn test_panic_becomes_500() {
        let pipeline = pipeline(vec![Arc::new(Panicking)]);
        let response = pipeline.run(context()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_forwarder_without_host_is_500() {
        let response = pipeline(Vec::new()).run(context()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_pipeline_len() {
        let log: Log = Arc::default();
        let pipeline = pipeline(vec![Arc::new(Terminal { log })]);
        assert_eq!(pipeline.len(), 1);
        assert!(!pipeline.is_empty());
    }
}
