//! Middleware stacks and priorities.
//!
//! Modules contribute [`Middleware`]s tagged with a stack and a priority. Within
//! a stack the highest priority runs first; ties keep their contribution order.
//!
//! Pre-router and default middlewares are axum `(Request, Next)` functions.
//! Multipart middlewares see the populated [`RequestContext`] and decide what
//! happens to the response through their [`Outcome`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::context::RequestContext;
use crate::http::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MiddlewareStack {
    /// Runs on every request, before routing.
    PreRouter,
    /// Runs on every routed request.
    Default,
    /// Runs on multipart routes, after the context is built.
    Multipart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum MiddlewarePriority {
    VeryLow,
    Low,
    #[default]
    Medium,
    High,
    VeryHigh,
}

/// How a multipart chain finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Outputs are registered on the context; send them back.
    Output,
    /// Answer 204 and clean up now.
    NoContent,
    /// Answer 204; someone else now owns the context and its cleanup.
    Detached,
}

pub type HttpMiddlewareFn = Arc<dyn Fn(Request, Next) -> BoxFuture<'static, Response> + Send + Sync>;

pub type FormMiddlewareFn = Arc<
    dyn Fn(Arc<RequestContext>, FormNext) -> BoxFuture<'static, Result<Outcome, ApiError>>
        + Send
        + Sync,
>;

pub(crate) type FormTerminalFn =
    Arc<dyn Fn(Arc<RequestContext>) -> BoxFuture<'static, Result<Outcome, ApiError>> + Send + Sync>;

#[derive(Clone)]
enum Kind {
    Http(HttpMiddlewareFn),
    Form(FormMiddlewareFn),
}

#[derive(Clone)]
pub struct Middleware {
    stack: MiddlewareStack,
    priority: MiddlewarePriority,
    kind: Kind,
}

impl Middleware {
    fn http<F, Fut>(stack: MiddlewareStack, priority: MiddlewarePriority, f: F) -> Self
    where
        F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        Self {
            stack,
            priority,
            kind: Kind::Http(Arc::new(move |req, next| f(req, next).boxed())),
        }
    }

    pub fn pre_router<F, Fut>(priority: MiddlewarePriority, f: F) -> Self
    where
        F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        Self::http(MiddlewareStack::PreRouter, priority, f)
    }

    pub fn default_stack<F, Fut>(priority: MiddlewarePriority, f: F) -> Self
    where
        F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        Self::http(MiddlewareStack::Default, priority, f)
    }

    pub fn multipart<F, Fut>(priority: MiddlewarePriority, f: F) -> Self
    where
        F: Fn(Arc<RequestContext>, FormNext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Outcome, ApiError>> + Send + 'static,
    {
        Self {
            stack: MiddlewareStack::Multipart,
            priority,
            kind: Kind::Form(Arc::new(move |ctx, next| f(ctx, next).boxed())),
        }
    }

    pub fn stack(&self) -> MiddlewareStack {
        self.stack
    }

    pub fn priority(&self) -> MiddlewarePriority {
        self.priority
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware")
            .field("stack", &self.stack)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Collected middlewares, each stack sorted by descending priority.
#[derive(Clone, Default)]
pub struct MiddlewareStacks {
    pub pre_router: Vec<HttpMiddlewareFn>,
    pub default: Vec<HttpMiddlewareFn>,
    pub multipart: Vec<FormMiddlewareFn>,
}

impl MiddlewareStacks {
    pub fn from_middlewares(mut middlewares: Vec<Middleware>) -> Self {
        // Stable: equal priorities keep contribution order.
        middlewares.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut stacks = Self::default();
        for middleware in middlewares {
            match (middleware.stack, middleware.kind) {
                (MiddlewareStack::PreRouter, Kind::Http(f)) => stacks.pre_router.push(f),
                (MiddlewareStack::Default, Kind::Http(f)) => stacks.default.push(f),
                (MiddlewareStack::Multipart, Kind::Form(f)) => stacks.multipart.push(f),
                (stack, _) => unreachable!("middleware kind does not match stack {stack:?}"),
            }
        }
        stacks
    }
}

/// The rest of a multipart chain.
#[derive(Clone)]
pub struct FormNext {
    chain: Arc<[FormMiddlewareFn]>,
    index: usize,
    terminal: FormTerminalFn,
}

impl FormNext {
    pub(crate) fn new(chain: Arc<[FormMiddlewareFn]>, terminal: FormTerminalFn) -> Self {
        Self {
            chain,
            index: 0,
            terminal,
        }
    }

    /// Run the remaining middlewares, then the route handler.
    pub fn run(self, ctx: Arc<RequestContext>) -> BoxFuture<'static, Result<Outcome, ApiError>> {
        match self.chain.get(self.index).cloned() {
            Some(middleware) => {
                let next = FormNext {
                    index: self.index + 1,
                    ..self
                };
                middleware(ctx, next)
            }
            None => (self.terminal)(ctx),
        }
    }
}
