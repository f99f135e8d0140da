//! The resource execution loop.
//!
//! For one resource: evaluate the guard predicate, select a provider,
//! check, diff, and apply only when the diff reports drift. Every outcome
//! is a `ResourceResult`; errors never escape as `Err`. Notifications are
//! enqueued only when a real apply reports a change (check mode attaches
//! the handler name for display but enqueues nothing).

use std::sync::Arc;

use tracing::{debug, warn};

use crate::common::Stopwatch;
use crate::error::ProviderError;
use crate::handlers::{HandlerQueue, NotifyTiming};
use crate::ssh::Session;

use super::registry::ProviderRegistry;
use super::{ExecutionContext, Resource, ResourceResult, ResourceStatus};

/// Drives check/diff/apply for resources on one host.
pub struct ResourceExecutor {
    registry: Arc<ProviderRegistry>,
}

impl ResourceExecutor {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    /// Executes one resource, producing exactly one result.
    pub async fn execute(
        &self,
        resource: &Resource,
        session: &dyn Session,
        ctx: &ExecutionContext,
        handlers: &HandlerQueue,
    ) -> ResourceResult {
        let description = resource.describe();

        if let Some(when) = &resource.when {
            if !when.evaluate(&ctx.facts) {
                debug!(resource = %description, "Skipping: condition not met");
                return ResourceResult::skipped(description, "condition not met");
            }
        }

        if ctx.cancel.is_cancelled() {
            return ResourceResult::failed(description, "cancelled");
        }

        let stopwatch = Stopwatch::start();

        let provider = match self.registry.provider_for(&resource.kind, &ctx.facts) {
            Ok(provider) => provider,
            Err(err) => {
                let mut result = ResourceResult::failed(description, err.to_string());
                result.duration_ms = stopwatch.elapsed_ms();
                return result;
            }
        };

        let current = match provider.check(&resource.kind, session, ctx).await {
            Ok(current) => current,
            Err(err) => {
                let message = match &err {
                    ProviderError::CheckFailed(_) => err.to_string(),
                    other => format!("check failed: {other}"),
                };
                let mut result = ResourceResult::failed(description, message);
                result.duration_ms = stopwatch.elapsed_ms();
                return result;
            }
        };

        let diff = provider.diff(&resource.kind, &current);

        if !diff.changed {
            let mut result = ResourceResult::ok(description).with_clean_diff(diff);
            result.duration_ms = stopwatch.elapsed_ms();
            return result;
        }

        if ctx.check_mode {
            let mut result =
                ResourceResult::changed(description, diff).with_message("would change");
            // Attach the handler so tooling can show what would fire, but
            // do not enqueue it.
            result.notify = resource.notify.clone();
            result.duration_ms = stopwatch.elapsed_ms();
            return result;
        }

        match provider.apply(&resource.kind, session, ctx).await {
            Ok(mut result) => {
                result.description = resource.describe();
                if result.diff.is_none() {
                    result.diff = Some(diff);
                }
                if result.status == ResourceStatus::Changed {
                    if let Some(handler) = &resource.notify {
                        handlers.enqueue(handler, NotifyTiming::End);
                        result.notify = Some(handler.clone());
                        debug!(resource = %result.description, handler = %handler, "Notified handler");
                    }
                }
                result.duration_ms = stopwatch.elapsed_ms();
                result
            }
            Err(err) => {
                let message = match &err {
                    ProviderError::ApplyFailed(_) => err.to_string(),
                    other => format!("apply failed: {other}"),
                };
                warn!(resource = %description, error = %message, "Apply failed");
                let mut result = ResourceResult::failed(description, message);
                result.duration_ms = stopwatch.elapsed_ms();
                result
            }
        }
    }

    /// Executes resources in order, stopping at the first failure unless
    /// `continue_on_error` is set. Results gathered so far are always
    /// returned.
    pub async fn execute_all(
        &self,
        resources: &[Resource],
        session: &dyn Session,
        ctx: &ExecutionContext,
        handlers: &HandlerQueue,
        continue_on_error: bool,
    ) -> Vec<ResourceResult> {
        let mut results = Vec::with_capacity(resources.len());
        for resource in resources {
            let result = self.execute(resource, session, ctx, handlers).await;
            let failed = result.is_failed();
            results.push(result);
            if failed && !continue_on_error {
                break;
            }
        }
        results
    }
}
