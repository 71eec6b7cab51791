use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::try_join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Module, ModuleError};
use crate::config::ServerConfig;
use crate::health::HealthCheck;
use crate::routing::{Middleware, MiddlewareStacks, Route};

type Constructor = Box<dyn Fn() -> Box<dyn Module> + Send + Sync>;

/// How to build a module, and its default flags.
pub struct ModuleDescriptor {
    id: String,
    flags: toml::Table,
    new: Constructor,
}

impl ModuleDescriptor {
    pub fn new<F, M>(id: impl Into<String>, constructor: F) -> Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: Module + 'static,
    {
        Self {
            id: id.into(),
            flags: toml::Table::new(),
            new: Box::new(move || Box::new(constructor())),
        }
    }

    /// Default flags, overridable from `[modules.<id>]`.
    pub fn with_flags<T: Serialize>(mut self, defaults: &T) -> Result<Self, ModuleError> {
        match toml::Value::try_from(defaults) {
            Ok(toml::Value::Table(table)) => {
                self.flags = table;
                Ok(self)
            }
            Ok(other) => Err(ModuleError::Flags(format!(
                "defaults for '{}' must be a table, got {}",
                self.id,
                other.type_str()
            ))),
            Err(e) => Err(ModuleError::Flags(e.to_string())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn flags(&self) -> &toml::Table {
        &self.flags
    }
}

impl std::fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Append-only set of module descriptors, handed to the server at startup.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    descriptors: BTreeMap<String, ModuleDescriptor>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ModuleDescriptor) -> Result<(), ModuleError> {
        if descriptor.id.trim().is_empty() {
            return Err(ModuleError::EmptyId);
        }
        if self.descriptors.contains_key(&descriptor.id) {
            return Err(ModuleError::Duplicate(descriptor.id));
        }
        self.descriptors.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        self.descriptors.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Construct, provision and validate every module in id order.
    pub fn provision(&self, config: &ServerConfig) -> Result<Modules, ModuleError> {
        let mut instances = Vec::with_capacity(self.descriptors.len());

        for (id, descriptor) in &self.descriptors {
            let ctx = ProvisionContext {
                id,
                flags: merged_flags(&descriptor.flags, config.modules.get(id)),
                config,
            };

            let mut module = (descriptor.new)();
            module
                .provision(&ctx)
                .map_err(|e| e.during(id, "provision"))?;
            module.validate().map_err(|e| e.during(id, "validate"))?;

            tracing::debug!(module = %id, "Module provisioned");
            let module: Arc<dyn Module> = Arc::from(module);
            instances.push((id.clone(), module));
        }

        Ok(Modules { instances })
    }
}

fn merged_flags(defaults: &toml::Table, overrides: Option<&toml::Value>) -> toml::Table {
    let mut flags = defaults.clone();
    if let Some(toml::Value::Table(overrides)) = overrides {
        for (key, value) in overrides {
            flags.insert(key.clone(), value.clone());
        }
    }
    flags
}

/// What a module sees while provisioning.
pub struct ProvisionContext<'a> {
    id: &'a str,
    flags: toml::Table,
    config: &'a ServerConfig,
}

impl<'a> ProvisionContext<'a> {
    pub fn id(&self) -> &str {
        self.id
    }

    /// Deserialize the module's defaults merged with `[modules.<id>]`.
    pub fn flags<T: DeserializeOwned>(&self) -> Result<T, ModuleError> {
        toml::Value::Table(self.flags.clone())
            .try_into()
            .map_err(|e: toml::de::Error| ModuleError::Flags(e.to_string()))
    }

    pub fn config(&self) -> &'a ServerConfig {
        self.config
    }
}

/// Everything modules contribute to the HTTP surface.
#[derive(Default)]
pub struct Contributions {
    pub routes: Vec<Route>,
    pub middlewares: MiddlewareStacks,
    pub health_checks: Vec<HealthCheck>,
}

/// Provisioned module instances, in id order.
#[derive(Clone)]
pub struct Modules {
    instances: Vec<(String, Arc<dyn Module>)>,
}

impl Modules {
    /// Gather routes, middlewares and health checks. The first error aborts.
    pub fn collect(&self) -> Result<Contributions, ModuleError> {
        let mut routes = Vec::new();
        let mut middlewares: Vec<Middleware> = Vec::new();
        let mut health_checks = Vec::new();

        for (id, module) in &self.instances {
            if let Some(router) = module.as_router() {
                routes.extend(router.routes().map_err(|e| e.during(id, "contribute routes"))?);
            }
            if let Some(provider) = module.as_middleware_provider() {
                middlewares.extend(
                    provider
                        .middlewares()
                        .map_err(|e| e.during(id, "contribute middlewares"))?,
                );
            }
            if let Some(checker) = module.as_health_checker() {
                health_checks.extend(
                    checker
                        .checks()
                        .map_err(|e| e.during(id, "contribute health checks"))?,
                );
            }
        }

        Ok(Contributions {
            routes,
            middlewares: MiddlewareStacks::from_middlewares(middlewares),
            health_checks,
        })
    }

    pub fn start_all(&self) -> Result<(), ModuleError> {
        for (id, module) in &self.instances {
            module.start().map_err(|e| e.during(id, "start"))?;
            tracing::info!(module = %id, "Module started");
        }
        Ok(())
    }

    /// Stop every module, even when some fail. Returns the number of failures.
    pub fn stop_all(&self) -> usize {
        let mut failures = 0;
        for (id, module) in self.instances.iter().rev() {
            match module.stop() {
                Ok(()) => tracing::info!(module = %id, "Module stopped"),
                Err(e) => {
                    failures += 1;
                    tracing::error!(module = %id, error = %e, "Failed to stop module");
                }
            }
        }
        failures
    }

    /// Wait until every health checker reports ready, bounded by `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), ModuleError> {
        let checks = self.instances.iter().filter_map(|(id, module)| {
            module.as_health_checker().map(|checker| {
                let ready = checker.ready();
                let id = id.clone();
                async move {
                    ready.await.map_err(|e| ModuleError::NotReady {
                        id,
                        reason: e.to_string(),
                    })
                }
            })
        });

        match tokio::time::timeout(timeout, try_join_all(checks)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(ModuleError::NotReady {
                id: "*".to_string(),
                reason: format!("not ready after {timeout:?}"),
            }),
        }
    }

    /// Background jobs still running across every module.
    pub fn async_count(&self) -> i64 {
        self.instances
            .iter()
            .filter_map(|(_, module)| module.as_async_counter().map(|c| c.async_count()))
            .sum()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.instances.iter().map(|(id, _)| id.as_str()).collect()
    }
}
