//! HTTP basic authentication module.
//!
//! Off by default. When enabled, every routed request except the health route
//! must carry `Authorization: Basic` credentials matching the username and
//! password read from the environment.

use std::sync::Arc;

use axum::extract::Request;
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::modules::{MiddlewareProvider, Module, ModuleDescriptor, ModuleError, ProvisionContext};
use crate::routing::{Middleware, MiddlewarePriority, HEALTH_PATH};

pub const MODULE_ID: &str = "basic-auth";
pub const USERNAME_ENV: &str = "API_BASIC_AUTH_USERNAME";
pub const PASSWORD_ENV: &str = "API_BASIC_AUTH_PASSWORD";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicAuthFlags {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Credentials {
    username: String,
    password: String,
}

#[derive(Debug, Default)]
pub struct BasicAuth {
    credentials: Option<Arc<Credentials>>,
    health_path: String,
}

pub fn descriptor() -> Result<ModuleDescriptor, ModuleError> {
    ModuleDescriptor::new(MODULE_ID, BasicAuth::default).with_flags(&BasicAuthFlags::default())
}

impl Module for BasicAuth {
    fn provision(&mut self, ctx: &ProvisionContext<'_>) -> Result<(), ModuleError> {
        let flags: BasicAuthFlags = ctx.flags()?;
        self.health_path = format!(
            "{}{}",
            ctx.config().api.root_path.trim_end_matches('/'),
            HEALTH_PATH
        );

        if flags.enabled {
            let read = |name: &str| std::env::var(name).unwrap_or_default();
            self.credentials = Some(Arc::new(Credentials {
                username: read(USERNAME_ENV),
                password: read(PASSWORD_ENV),
            }));
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ModuleError> {
        match &self.credentials {
            Some(creds) if creds.username.is_empty() || creds.password.is_empty() => {
                Err(ModuleError::invalid(format!(
                    "basic auth is enabled but {USERNAME_ENV} or {PASSWORD_ENV} is not set"
                )))
            }
            _ => Ok(()),
        }
    }

    fn as_middleware_provider(&self) -> Option<&dyn MiddlewareProvider> {
        Some(self)
    }
}

impl MiddlewareProvider for BasicAuth {
    fn middlewares(&self) -> Result<Vec<Middleware>, ModuleError> {
        let Some(credentials) = self.credentials.clone() else {
            return Ok(Vec::new());
        };
        let health_path = Arc::new(self.health_path.clone());

        Ok(vec![Middleware::default_stack(
            MiddlewarePriority::VeryHigh,
            move |request: Request, next: Next| {
                let credentials = credentials.clone();
                let health_path = health_path.clone();
                async move {
                    if request.uri().path() == health_path.as_str()
                        || authorized(&request, &credentials)
                    {
                        return next.run(request).await;
                    }
                    unauthorized()
                }
            },
        )])
    }
}

fn authorized(request: &Request, credentials: &Credentials) -> bool {
    let Some(encoded) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    else {
        return false;
    };

    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };

    match decoded.split_once(':') {
        Some((username, password)) => {
            username == credentials.username && password == credentials.password
        }
        None => false,
    }
}

fn unauthorized() -> Response {
    let mut response = (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"Restricted\""),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::MiddlewareStacks;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn guarded() -> Router {
        let module = BasicAuth {
            credentials: Some(Arc::new(Credentials {
                username: "alice".to_string(),
                password: "s3cret".to_string(),
            })),
            health_path: "/health".to_string(),
        };
        let stacks = MiddlewareStacks::from_middlewares(module.middlewares().unwrap());

        let mut router = Router::new()
            .route("/health", get(|| async { "up" }))
            .route("/forms/x", get(|| async { "ok" }));
        for middleware in stacks.default.into_iter().rev() {
            router = router.layer(axum::middleware::from_fn(
                move |req: Request, next: Next| middleware(req, next),
            ));
        }
        router
    }

    async fn status(router: Router, uri: &str, auth: Option<&str>) -> StatusCode {
        let mut request = Request::builder().uri(uri);
        if let Some(auth) = auth {
            request = request.header(header::AUTHORIZATION, auth);
        }
        router
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn requires_matching_credentials() {
        let good = format!("Basic {}", STANDARD.encode("alice:s3cret"));
        let bad = format!("Basic {}", STANDARD.encode("alice:nope"));

        assert_eq!(status(guarded(), "/forms/x", None).await, StatusCode::UNAUTHORIZED);
        assert_eq!(status(guarded(), "/forms/x", Some(&bad)).await, StatusCode::UNAUTHORIZED);
        assert_eq!(status(guarded(), "/forms/x", Some("Bearer x")).await, StatusCode::UNAUTHORIZED);
        assert_eq!(status(guarded(), "/forms/x", Some(&good)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn health_is_exempt() {
        assert_eq!(status(guarded(), "/health", None).await, StatusCode::OK);
    }

    #[test]
    fn disabled_module_contributes_nothing() {
        assert!(BasicAuth::default().middlewares().unwrap().is_empty());
        assert!(BasicAuth::default().validate().is_ok());
    }

    #[test]
    fn enabled_without_credentials_is_invalid() {
        let module = BasicAuth {
            credentials: Some(Arc::new(Credentials {
                username: String::new(),
                password: String::new(),
            })),
            health_path: "/health".to_string(),
        };
        assert!(module.validate().is_err());
    }
}
