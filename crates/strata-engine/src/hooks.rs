//! Named resource hooks run around lifecycle operations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use strata_core::{HookType, PropertyMap, ResourceHooks, Urn};

use crate::error::HookError;
use crate::BoxFuture;

/// What a hook sees about the resource it runs for.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub urn: Urn,
    pub hook_type: HookType,
    pub id: Option<String>,
    pub inputs: PropertyMap,
    pub outputs: PropertyMap,
}

type HookFn = Arc<dyn Fn(HookContext) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<String, HookFn>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` under `name`. A hook reports failure with an error
    /// message.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, hook: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let hook: HookFn =
            Arc::new(move |ctx| -> BoxFuture<'static, Result<(), String>> { Box::pin(hook(ctx)) });
        self.hooks.insert(name.into(), hook);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hooks.contains_key(name)
    }

    /// Names in `hooks` that are not registered.
    pub fn unknown<'a>(&self, hooks: &'a ResourceHooks) -> Vec<&'a str> {
        hooks
            .values()
            .flatten()
            .map(String::as_str)
            .filter(|name| !self.contains(name))
            .collect()
    }

    /// Run the hooks of `hook_type` in declaration order, stopping at the
    /// first failure.
    pub async fn run(&self, hooks: &ResourceHooks, ctx: HookContext) -> Result<(), HookError> {
        let Some(names) = hooks.get(&ctx.hook_type) else {
            return Ok(());
        };
        for name in names {
            let hook = self
                .hooks
                .get(name)
                .ok_or_else(|| HookError::Unknown(name.clone()))?;
            tracing::debug!(urn = %ctx.urn, hook = %name, hook_type = ?ctx.hook_type, "running hook");
            hook(ctx.clone())
                .await
                .map_err(|message| HookError::failed(name.clone(), message))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.hooks.keys().collect();
        names.sort();
        f.debug_struct("HookRegistry").field("hooks", &names).finish()
    }
}
