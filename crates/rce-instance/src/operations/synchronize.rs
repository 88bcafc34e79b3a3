//! Coalescing of concurrent requests for the same profile

use super::{InstanceOperations, InstanceOutcome, OperationReport, Result};
use crate::error::InstanceOperationError;
use crate::output::TextOutputReceiver;
use crate::profile::profile_name;
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Action {
    Start,
    Shutdown,
}

type BatchResult = std::result::Result<Arc<OperationReport>, Arc<InstanceOperationError>>;
type SharedBatch = Shared<BoxFuture<'static, BatchResult>>;

struct InFlight {
    batch: SharedBatch,
    references: usize,
}

type InFlightMap = Arc<Mutex<HashMap<(Action, String), InFlight>>>;

/// Drops this caller's references when it is done, even if it is cancelled
struct Registration {
    in_flight: InFlightMap,
    keys: Vec<(Action, String)>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        for key in &self.keys {
            if let Some(entry) = in_flight.get_mut(key) {
                entry.references -= 1;
                if entry.references == 0 {
                    in_flight.remove(key);
                }
            }
        }
    }
}

/// Makes concurrent callers naming the same profile share one underlying request
///
/// Profiles are identified by name, so two paths ending in the same profile
/// directory name are treated as one profile. Every request in flight carries a
/// reference count of the callers waiting for it.
pub struct SynchronizingOperations {
    inner: Arc<dyn InstanceOperations>,
    in_flight: InFlightMap,
}

pub fn synchronized(inner: Arc<dyn InstanceOperations>) -> Arc<dyn InstanceOperations> {
    Arc::new(SynchronizingOperations::new(inner))
}

impl SynchronizingOperations {
    pub fn new(inner: Arc<dyn InstanceOperations>) -> Self {
        Self {
            inner,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Requests currently shared by at least one caller
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// References held on the request for `profile`, if one is in flight
    fn references(&self, action: Action, profile: &str) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(action, profile.to_string()))
            .map_or(0, |e| e.references)
    }

    pub fn start_references(&self, profile: &str) -> usize {
        self.references(Action::Start, profile)
    }

    async fn run<F>(&self, action: Action, profiles: Vec<PathBuf>, launch: F) -> Result<OperationReport>
    where
        F: FnOnce(Vec<PathBuf>) -> BoxFuture<'static, Result<OperationReport>>,
    {
        // one canonical path per profile name
        let mut canonical: BTreeMap<String, PathBuf> = BTreeMap::new();
        for profile in profiles {
            canonical.entry(profile_name(&profile)).or_insert(profile);
        }

        let mut awaited: Vec<(SharedBatch, Vec<String>)> = Vec::new();
        let registration = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            let mut keys = Vec::new();
            let mut fresh = Vec::new();

            for (name, path) in canonical {
                let key = (action, name.clone());
                match in_flight.get_mut(&key) {
                    Some(entry) => {
                        debug!(profile = %name, ?action, "Joining request already in flight");
                        entry.references += 1;
                        match awaited.iter_mut().find(|(b, _)| b.ptr_eq(&entry.batch)) {
                            Some((_, names)) => names.push(name),
                            None => awaited.push((entry.batch.clone(), vec![name])),
                        }
                    }
                    None => fresh.push((name, path)),
                }
                keys.push(key);
            }

            if !fresh.is_empty() {
                let paths = fresh.iter().map(|(_, p)| p.clone()).collect();
                // runs to completion even when every caller goes away, so locks get released
                let task = tokio::spawn(launch(paths));
                let batch = async move {
                    match task.await {
                        Ok(result) => result.map(Arc::new).map_err(Arc::new),
                        Err(e) => Err(Arc::new(InstanceOperationError::Interrupted(e.to_string()))),
                    }
                }
                .boxed()
                .shared();
                for (name, _) in &fresh {
                    in_flight.insert(
                        (action, name.clone()),
                        InFlight {
                            batch: batch.clone(),
                            references: 1,
                        },
                    );
                }
                awaited.push((batch, fresh.into_iter().map(|(n, _)| n).collect()));
            }

            Registration {
                in_flight: self.in_flight.clone(),
                keys,
            }
        };

        let results = join_all(
            awaited
                .into_iter()
                .map(|(batch, names)| async move { (batch.await, names) }),
        )
        .await;
        drop(registration);

        let mut report = OperationReport::new();
        let mut failure = None;
        for (result, names) in results {
            match result {
                Ok(shared_report) => {
                    for name in names {
                        let outcome = shared_report.outcome(&name).cloned().unwrap_or_else(|| {
                            InstanceOutcome::Failed("No outcome reported for this profile".into())
                        });
                        report.record(name, outcome);
                    }
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(Arc::try_unwrap(e).unwrap_or_else(InstanceOperationError::Batch)),
            None => Ok(report),
        }
    }
}

#[async_trait]
impl InstanceOperations for SynchronizingOperations {
    async fn start_instances(
        &self,
        profiles: Vec<PathBuf>,
        installation: PathBuf,
        timeout: Duration,
        output: Arc<dyn TextOutputReceiver>,
    ) -> Result<OperationReport> {
        let inner = self.inner.clone();
        self.run(Action::Start, profiles, move |paths| {
            async move { inner.start_instances(paths, installation, timeout, output).await }.boxed()
        })
        .await
    }

    async fn shutdown_instances(
        &self,
        profiles: Vec<PathBuf>,
        timeout: Duration,
        output: Arc<dyn TextOutputReceiver>,
    ) -> Result<OperationReport> {
        let inner = self.inner.clone();
        self.run(Action::Shutdown, profiles, move |paths| {
            async move { inner.shutdown_instances(paths, timeout, output).await }.boxed()
        })
        .await
    }
}
