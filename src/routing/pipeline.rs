//! Turning a route into an axum handler.
//!
//! Multipart routes go through [`FormPipeline`]: build the context, run the
//! multipart stack, run the handler under the hard timeout, then answer with
//! the output file, a 204, or an error.

use std::sync::Arc;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::FutureExt;

use super::middleware::{FormMiddlewareFn, FormNext, FormTerminalFn, Outcome};
use super::{FormHandlerFn, HttpHandlerFn};
use crate::context::{ContextGuard, IngestOptions, RequestContext};
use crate::http::error::ApiError;
use crate::http::request::RequestState;
use crate::http::response::attachment;
use crate::resilience::TimeoutGuard;

/// Serve a plain route under the hard timeout.
pub(crate) async fn serve_http(handler: HttpHandlerFn, guard: TimeoutGuard, request: Request) -> Response {
    match guard.run(handler(request)).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

pub(crate) struct FormPipeline {
    ingest: Arc<IngestOptions>,
    chain: Arc<[FormMiddlewareFn]>,
    terminal: FormTerminalFn,
}

impl FormPipeline {
    pub(crate) fn new(
        ingest: Arc<IngestOptions>,
        chain: Arc<[FormMiddlewareFn]>,
        handler: FormHandlerFn,
        guard: TimeoutGuard,
    ) -> Self {
        let terminal: FormTerminalFn = Arc::new(move |ctx: Arc<RequestContext>| {
            let handler = handler.clone();
            async move {
                guard.run(handler(ctx)).await?;
                Ok::<_, ApiError>(Outcome::Output)
            }
            .boxed()
        });

        Self {
            ingest,
            chain,
            terminal,
        }
    }

    pub(crate) async fn serve(&self, request: Request) -> Response {
        let trace = request
            .extensions()
            .get::<RequestState>()
            .map(|state| state.trace.clone())
            .unwrap_or_default();

        let ctx = match RequestContext::from_request(request, &self.ingest, trace).await {
            Ok(ctx) => Arc::new(ctx),
            Err(err) => return err.into_response(),
        };
        let guard = ContextGuard::new(ctx.clone());

        let next = FormNext::new(self.chain.clone(), self.terminal.clone());
        match next.run(ctx.clone()).await {
            Ok(Outcome::Output) => match respond_with_output(&ctx, guard).await {
                Ok(response) => response,
                Err(err) => err.into_response(),
            },
            Ok(Outcome::NoContent) => StatusCode::NO_CONTENT.into_response(),
            Ok(Outcome::Detached) => {
                guard.disarm();
                StatusCode::NO_CONTENT.into_response()
            }
            Err(err) => err.into_response(),
        }
    }
}

async fn respond_with_output(ctx: &RequestContext, guard: ContextGuard) -> Result<Response, ApiError> {
    let path = ctx.build_output_file().await?;
    let filename = ctx.output_filename(&path);
    attachment(&path, &filename, guard).await
}
