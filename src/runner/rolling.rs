//! Rolling rollout: batched execution with post-batch health gates.
//!
//! The task's steps are partitioned into regular steps and wait-for
//! health checks. Each batch runs the regular steps in parallel, then
//! every health check must pass on every batch member before the next
//! batch starts. On a gate failure with `continue_on_error` unset, later
//! batches are neither attempted nor reported.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{Host, Step, Task};
use crate::handlers::HandlerQueue;

use super::{HostResult, HostStatus, RunOptions, TaskRunner};

impl TaskRunner {
    pub(crate) async fn run_rolling(
        &self,
        task: &Task,
        hosts: &[Host],
        handlers: &Arc<HandlerQueue>,
        opts: &RunOptions,
    ) -> (Vec<HostResult>, Vec<String>) {
        let (regular, checks): (Vec<Step>, Vec<Step>) = task
            .steps
            .iter()
            .cloned()
            .partition(|step| !matches!(step, Step::WaitFor(_)));

        let batch_size = task.batch_size.max(1);
        let total_batches = hosts.len().div_ceil(batch_size);

        let mut results = Vec::with_capacity(hosts.len());
        let mut notified = Vec::new();

        for (batch_index, batch) in hosts.chunks(batch_size).enumerate() {
            info!(
                task = %task.name,
                batch = batch_index + 1,
                of = total_batches,
                hosts = batch.len(),
                "Rolling batch"
            );

            let (mut batch_results, mut batch_notified) = self
                .run_hosts_bounded(task, &regular, batch, handlers, opts)
                .await;
            notified.append(&mut batch_notified);

            let mut gate_failed = batch_results.iter().any(|r| !r.is_ok());

            if !gate_failed && !checks.is_empty() {
                for (index, host) in batch.iter().enumerate() {
                    let (check_result, _) =
                        self.run_host(task, &checks, host, handlers, opts).await;
                    let host_result = &mut batch_results[index];
                    let passed = check_result.is_ok();
                    host_result.steps.extend(check_result.steps);
                    if !passed {
                        warn!(task = %task.name, host = %host.name, "Health check failed");
                        host_result.status = HostStatus::Error;
                        gate_failed = true;
                    }
                }
            }

            results.append(&mut batch_results);

            if gate_failed && !opts.continue_on_error {
                let remaining = hosts.len() - results.len();
                if remaining > 0 {
                    warn!(
                        task = %task.name,
                        remaining,
                        "Stopping rollout; remaining batches not attempted"
                    );
                }
                break;
            }
        }

        (results, notified)
    }
}
