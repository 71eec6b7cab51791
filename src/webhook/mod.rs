//! Webhook module.
//!
//! Adds a very-high-priority multipart middleware. Requests carrying
//! `Gotenberg-Webhook-Url` get a 204 and their outcome (output file or error
//! envelope) is delivered to the caller's URLs. Async deliveries are counted so
//! shutdown can wait for them.

pub mod client;
pub mod middleware;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lifecycle::AsyncJobs;
use crate::modules::{
    AsyncCounter, MiddlewareProvider, Module, ModuleDescriptor, ModuleError, ProvisionContext,
};
use crate::resilience::{RetryPolicy, RetryingClient};
use crate::routing::{Middleware, MiddlewarePriority};
use crate::security::url_filter::UrlFilter;

pub use client::{DeliveryError, WebhookClient, WebhookTarget};
use middleware::Dispatcher;

pub const MODULE_ID: &str = "webhook";

/// Flags under `[modules.webhook]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookFlags {
    pub allow_list: String,
    pub deny_list: String,
    pub error_allow_list: String,
    pub error_deny_list: String,
    pub max_retry: u32,
    pub retry_min_wait_ms: u64,
    pub retry_max_wait_ms: u64,
    /// Bounds every delivery attempt.
    pub client_timeout_secs: u64,
    pub disable: bool,
}

impl Default for WebhookFlags {
    fn default() -> Self {
        Self {
            allow_list: String::new(),
            deny_list: String::new(),
            error_allow_list: String::new(),
            error_deny_list: String::new(),
            max_retry: 4,
            retry_min_wait_ms: 1000,
            retry_max_wait_ms: 30000,
            client_timeout_secs: 30,
            disable: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct Webhook {
    flags: WebhookFlags,
    dispatcher: Option<Arc<Dispatcher>>,
    jobs: AsyncJobs,
}

pub fn descriptor() -> Result<ModuleDescriptor, ModuleError> {
    ModuleDescriptor::new(MODULE_ID, Webhook::default).with_flags(&WebhookFlags::default())
}

impl Module for Webhook {
    fn provision(&mut self, ctx: &ProvisionContext<'_>) -> Result<(), ModuleError> {
        self.flags = ctx.flags()?;
        if self.flags.disable {
            return Ok(());
        }

        let compile = |allow: &str, deny: &str| {
            UrlFilter::new(allow, deny).map_err(|e| ModuleError::invalid(format!("bad URL filter: {e}")))
        };
        let filter = compile(&self.flags.allow_list, &self.flags.deny_list)?;
        let error_filter = compile(&self.flags.error_allow_list, &self.flags.error_deny_list)?;

        let policy = RetryPolicy {
            max_retry: self.flags.max_retry,
            min_wait: Duration::from_millis(self.flags.retry_min_wait_ms),
            max_wait: Duration::from_millis(self.flags.retry_max_wait_ms),
        };
        let http = RetryingClient::new(
            policy,
            Some(Duration::from_secs(self.flags.client_timeout_secs)),
        )
        .map_err(|e| ModuleError::invalid(e.to_string()))?;

        self.dispatcher = Some(Arc::new(Dispatcher {
            filter,
            error_filter,
            client: WebhookClient::new(http),
            jobs: self.jobs.clone(),
        }));
        Ok(())
    }

    fn validate(&self) -> Result<(), ModuleError> {
        if self.flags.retry_min_wait_ms > self.flags.retry_max_wait_ms {
            return Err(ModuleError::invalid(
                "retry_min_wait_ms must not exceed retry_max_wait_ms",
            ));
        }
        if self.flags.client_timeout_secs == 0 {
            return Err(ModuleError::invalid("client_timeout_secs must be positive"));
        }
        Ok(())
    }

    fn as_middleware_provider(&self) -> Option<&dyn MiddlewareProvider> {
        Some(self)
    }

    fn as_async_counter(&self) -> Option<&dyn AsyncCounter> {
        Some(self)
    }
}

impl MiddlewareProvider for Webhook {
    fn middlewares(&self) -> Result<Vec<Middleware>, ModuleError> {
        let middleware = match &self.dispatcher {
            Some(dispatcher) => {
                let dispatcher = dispatcher.clone();
                Middleware::multipart(MiddlewarePriority::VeryHigh, move |ctx, next| {
                    middleware::dispatch(dispatcher.clone(), ctx, next)
                })
            }
            None => Middleware::multipart(MiddlewarePriority::VeryHigh, middleware::reject),
        };
        Ok(vec![middleware])
    }
}

impl AsyncCounter for Webhook {
    fn async_count(&self) -> i64 {
        self.jobs.count()
    }
}
