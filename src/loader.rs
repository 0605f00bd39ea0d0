//! Periodic resource loader
//!
//! The loader populates the cache through the fetcher on a fixed schedule.
//! Each pass expands its rules: a static rule fetches one named resource, a
//! single rule instantiates one resource from a template out of a base
//! payload, and a list rule instantiates one resource per array element.
//! Rules within a pass run in parallel on a bounded worker set; passes never
//! overlap; a failed rule is logged and never aborts the pass.

use crate::error::SsrError;
use crate::fetcher::{Fetcher, Resource};
use crate::template::{flatten_primitives, select_path, substitute_params};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Scheduling and rule configuration for the loader.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoaderConfig {
    /// Seconds after startup before the first pass.
    #[serde(default = "default_exec_startup")]
    pub exec_startup: u64,
    /// Seconds between passes.
    #[serde(default = "default_exec_interval")]
    pub exec_interval: u64,
    /// Parallelism within a pass.
    #[serde(default = "default_exec_workers")]
    pub exec_workers: usize,
    /// Rules executed on every pass.
    #[serde(default)]
    pub rules: Vec<LoaderRule>,
}

fn default_exec_startup() -> u64 {
    15
}

fn default_exec_interval() -> u64 {
    60
}

fn default_exec_workers() -> usize {
    4
}

/// One loader rule, tagged by kind.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LoaderRule {
    /// Fetch a registered resource once per pass.
    Static {
        /// Name of the registered resource to fetch.
        resource: String,
    },
    /// Fetch a base resource, select one object out of its JSON payload and
    /// instantiate a templated resource from its primitive fields.
    Single {
        /// Name of the base resource to fetch and decode.
        resource: String,
        /// Dotted path selecting the payload item object.
        #[serde(default)]
        resource_payload_item: String,
        /// Template used to instantiate the item resource.
        template: String,
        /// Name pattern of the instantiated resource (`$field` placeholders).
        resource_name: String,
        /// TTL applied to the instantiated resource's payload.
        #[serde(default)]
        ttl: i64,
    },
    /// Like `single`, but the payload path selects an array and one
    /// resource is instantiated per element.
    List {
        /// Name of the base resource to fetch and decode.
        resource: String,
        /// Dotted path selecting the payload item array.
        #[serde(default)]
        resource_payload_items: String,
        /// Template used to instantiate each item resource.
        template: String,
        /// Name pattern of the instantiated resources (`$field` placeholders).
        resource_name: String,
        /// TTL applied to each instantiated resource's payload.
        #[serde(default)]
        ttl: i64,
    },
}

impl LoaderRule {
    /// Name of the template this rule instantiates, if any.
    pub fn template_name(&self) -> Option<&str> {
        match self {
            LoaderRule::Static { .. } => None,
            LoaderRule::Single { template, .. } | LoaderRule::List { template, .. } => {
                Some(template)
            }
        }
    }
}

/// Handle to a started loader; dropping it does not stop the scheduler.
pub struct LoaderHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LoaderHandle {
    /// Signals the scheduler to stop after the current tick and waits for
    /// it to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

/// Periodic scheduler expanding loader rules through the fetcher.
pub struct Loader {
    fetcher: Arc<Fetcher>,
    rules: Arc<Vec<LoaderRule>>,
    startup: Duration,
    interval: Duration,
    workers: usize,
}

impl Loader {
    /// Creates a loader over the given fetcher.
    pub fn new(config: &LoaderConfig, fetcher: Arc<Fetcher>) -> Self {
        Self {
            fetcher,
            rules: Arc::new(config.rules.clone()),
            startup: Duration::from_secs(config.exec_startup),
            interval: Duration::from_secs(config.exec_interval.max(1)),
            workers: config.exec_workers.max(1),
        }
    }

    /// Spawns the scheduler task: wait for the startup delay, then run one
    /// pass per interval tick. A new tick is only processed after the
    /// previous pass has drained its results.
    pub fn start(self: Arc<Self>) -> LoaderHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(self.startup) => {}
                _ = stop_rx.changed() => return,
            }

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut pass = 0u64;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pass += 1;
                        self.run_pass(pass).await;
                    }
                    _ = stop_rx.changed() => return,
                }
            }
        });
        LoaderHandle {
            stop: stop_tx,
            handle,
        }
    }

    /// Runs one pass: every rule index goes into a bounded channel, worker
    /// tasks drain it, and the per-rule results are collated and logged.
    /// Returns the (succeeded, failed) counts.
    pub async fn run_pass(&self, pass: u64) -> (usize, usize) {
        let rule_count = self.rules.len();
        if rule_count == 0 {
            return (0, 0);
        }
        let workers = self.workers.min(rule_count);

        let (job_tx, job_rx) = mpsc::channel::<usize>(rule_count);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<(usize, Result<(), SsrError>)>(rule_count);

        let mut worker_handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let fetcher = Arc::clone(&self.fetcher);
            let rules = Arc::clone(&self.rules);
            worker_handles.push(tokio::spawn(async move {
                loop {
                    let next = { job_rx.lock().await.recv().await };
                    let Some(idx) = next else { break };
                    let outcome = load_rule(&fetcher, &rules[idx]).await;
                    if result_tx.send((idx, outcome)).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        for idx in 0..rule_count {
            if job_tx.send(idx).await.is_err() {
                break;
            }
        }
        drop(job_tx);

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        while let Some((idx, outcome)) = result_rx.recv().await {
            match outcome {
                Ok(()) => succeeded += 1,
                Err(err) => {
                    failed += 1;
                    tracing::warn!(
                        target: "vitrine::loader",
                        pass,
                        rule = idx,
                        error = %err,
                        "rule failed"
                    );
                }
            }
        }
        for handle in worker_handles {
            let _ = handle.await;
        }

        tracing::info!(
            target: "vitrine::loader",
            pass,
            succeeded,
            failed,
            "pass complete"
        );
        (succeeded, failed)
    }
}

async fn load_rule(fetcher: &Fetcher, rule: &LoaderRule) -> Result<(), SsrError> {
    match rule {
        LoaderRule::Static { resource } => fetcher.fetch(resource).await,
        LoaderRule::Single {
            resource,
            resource_payload_item,
            template,
            resource_name,
            ttl,
        } => {
            let payload = fetch_payload(fetcher, resource).await?;
            let item = select_path(&payload, resource_payload_item).ok_or_else(|| {
                SsrError::Payload {
                    resource: resource.clone(),
                    detail: format!("path '{resource_payload_item}' not found"),
                }
            })?;
            if !item.is_object() {
                return Err(SsrError::Payload {
                    resource: resource.clone(),
                    detail: format!("path '{resource_payload_item}' is not an object"),
                });
            }
            let instantiated =
                instantiate_item(fetcher, template, resource_name, *ttl, item)?;
            fetcher.register(instantiated.clone());
            fetcher.fetch(&instantiated.name).await
        }
        LoaderRule::List {
            resource,
            resource_payload_items,
            template,
            resource_name,
            ttl,
        } => {
            let payload = fetch_payload(fetcher, resource).await?;
            let items = select_path(&payload, resource_payload_items)
                .and_then(|v| v.as_array())
                .ok_or_else(|| SsrError::Payload {
                    resource: resource.clone(),
                    detail: format!("path '{resource_payload_items}' is not an array"),
                })?;
            for item in items {
                if !item.is_object() {
                    tracing::debug!(
                        target: "vitrine::loader",
                        resource = %resource,
                        "skipping non-object payload item"
                    );
                    continue;
                }
                let instantiated =
                    instantiate_item(fetcher, template, resource_name, *ttl, item)?;
                fetcher.register(instantiated.clone());
                fetcher.fetch(&instantiated.name).await?;
            }
            Ok(())
        }
    }
}

async fn fetch_payload(
    fetcher: &Fetcher,
    resource: &str,
) -> Result<serde_json::Value, SsrError> {
    fetcher.fetch(resource).await?;
    let body = fetcher.get(resource)?;
    Ok(serde_json::from_slice(&body)?)
}

/// Builds the per-item resource: flatten the item's primitive fields and
/// substitute them into the template's name pattern, URL, params and
/// headers.
fn instantiate_item(
    fetcher: &Fetcher,
    template: &str,
    resource_name: &str,
    ttl: i64,
    item: &serde_json::Value,
) -> Result<Resource, SsrError> {
    let fields = flatten_primitives(item);
    let name = substitute_params(resource_name, &fields);
    let mut resource =
        fetcher.create_resource_from_template(template, &name, &fields, &Default::default())?;
    resource.url = substitute_params(&resource.url, &fields);
    for value in resource.params.values_mut() {
        *value = substitute_params(value, &fields);
    }
    for value in resource.headers.values_mut() {
        *value = substitute_params(value, &fields);
    }
    resource.ttl = ttl;
    Ok(resource)
}
