//! # Shared Resource Collector
//!
//! Pull-based Prometheus collector reporting how many `SharedSecret` and
//! `SharedConfigMap` objects exist. Counts are taken from the reflector caches
//! when a scrape arrives, never from the live API and never on watch events.
//!
//! ## Metrics Exposed
//!
//! - `openshift_csi_share_secret_total` - Number of SharedSecret objects
//! - `openshift_csi_share_configmap_total` - Number of SharedConfigMap objects
//!
//! The collector is an explicit instance owned by the orchestrator. It is
//! registered once through [`ShareCollector::create`], handed its listers once
//! the reflectors are running, and can be torn down with
//! [`ShareCollector::clear_state`] and registered again.

use crate::crd::{SharedConfigMap, SharedSecret};
use kube_runtime::reflector::{Lookup, Store};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{IntGauge, Opts, Registry};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

pub const SHARED_SECRET_METRIC: &str = "openshift_csi_share_secret_total";
pub const SHARED_SECRET_HELP: &str =
    "Counts Secret objects shared by the CSI shared resource driver";
pub const SHARED_CONFIGMAP_METRIC: &str = "openshift_csi_share_configmap_total";
pub const SHARED_CONFIGMAP_HELP: &str =
    "Counts ConfigMap objects shared by the CSI shared resource driver";

#[derive(Debug, Error)]
pub enum ListerError {
    #[error("lister unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view over a cached collection
pub trait ShareLister<K>: Send + Sync {
    fn list(&self) -> Result<Vec<Arc<K>>, ListerError>;
}

impl<K> ShareLister<K> for Store<K>
where
    K: Lookup + Clone + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Send + Sync,
{
    fn list(&self) -> Result<Vec<Arc<K>>, ListerError> {
        Ok(self.state())
    }
}

#[derive(Clone)]
struct Listers {
    secrets: Arc<dyn ShareLister<SharedSecret>>,
    config_maps: Arc<dyn ShareLister<SharedConfigMap>>,
}

#[derive(Default)]
struct CollectorState {
    /// Guards registration; held across the registry call so concurrent
    /// `create` calls register exactly once
    created: Mutex<bool>,
    listers: RwLock<Option<Listers>>,
}

#[derive(Clone)]
pub struct ShareCollector {
    state: Arc<CollectorState>,
    secret_desc: Desc,
    config_map_desc: Desc,
}

impl std::fmt::Debug for ShareCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareCollector")
            .field("created", &self.is_created())
            .field("has_listers", &self.has_listers())
            .finish_non_exhaustive()
    }
}

impl ShareCollector {
    pub fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            state: Arc::new(CollectorState::default()),
            secret_desc: Desc::new(
                SHARED_SECRET_METRIC.to_string(),
                SHARED_SECRET_HELP.to_string(),
                Vec::new(),
                HashMap::new(),
            )?,
            config_map_desc: Desc::new(
                SHARED_CONFIGMAP_METRIC.to_string(),
                SHARED_CONFIGMAP_HELP.to_string(),
                Vec::new(),
                HashMap::new(),
            )?,
        })
    }

    /// Register with `registry` unless already registered
    ///
    /// Returns `true` when this call performed the registration.
    pub fn create(&self, registry: &Registry) -> Result<bool, prometheus::Error> {
        let mut created = self
            .state
            .created
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *created {
            debug!("Share collector already registered");
            return Ok(false);
        }
        registry.register(Box::new(self.clone()))?;
        *created = true;
        Ok(true)
    }

    pub fn is_created(&self) -> bool {
        *self
            .state
            .created
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Unregister and forget the listers so the collector can be created again
    pub fn clear_state(&self, registry: &Registry) {
        let mut created = self
            .state
            .created
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *created {
            if let Err(e) = registry.unregister(Box::new(self.clone())) {
                warn!("Failed to unregister share collector: {}", e);
            }
            *created = false;
        }
        *self
            .state
            .listers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }

    /// Attach the caches counted on every scrape
    pub fn set_listers(
        &self,
        secrets: Arc<dyn ShareLister<SharedSecret>>,
        config_maps: Arc<dyn ShareLister<SharedConfigMap>>,
    ) {
        *self
            .state
            .listers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Listers {
            secrets,
            config_maps,
        });
    }

    pub fn has_listers(&self) -> bool {
        self.state
            .listers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some()
    }

    fn gauge(name: &str, help: &str, count: usize) -> Vec<MetricFamily> {
        let gauge = match IntGauge::with_opts(Opts::new(name, help)) {
            Ok(gauge) => gauge,
            Err(e) => {
                warn!(metric = name, "Failed to build gauge: {}", e);
                return Vec::new();
            }
        };
        gauge.set(i64::try_from(count).unwrap_or(i64::MAX));
        gauge.collect()
    }
}

impl Collector for ShareCollector {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.secret_desc, &self.config_map_desc]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        // Clone the handles so listing happens without holding the lock
        let listers = self
            .state
            .listers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let Some(listers) = listers else {
            debug!("Share collector scraped before listers were attached");
            return Vec::new();
        };

        let mut families = Vec::with_capacity(2);
        match listers.secrets.list() {
            Ok(items) => families.extend(Self::gauge(
                SHARED_SECRET_METRIC,
                SHARED_SECRET_HELP,
                items.len(),
            )),
            Err(e) => warn!(kind = "SharedSecret", "Failed to list shares: {}", e),
        }
        match listers.config_maps.list() {
            Ok(items) => families.extend(Self::gauge(
                SHARED_CONFIGMAP_METRIC,
                SHARED_CONFIGMAP_HELP,
                items.len(),
            )),
            Err(e) => warn!(kind = "SharedConfigMap", "Failed to list shares: {}", e),
        }
        families
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ShareReference, SharedConfigMapSpec, SharedSecretSpec};
    use prometheus::{Encoder, TextEncoder};

    struct FixedLister<K>(Vec<Arc<K>>);

    impl<K: Send + Sync> ShareLister<K> for FixedLister<K> {
        fn list(&self) -> Result<Vec<Arc<K>>, ListerError> {
            Ok(self.0.clone())
        }
    }

    struct FailingLister;

    impl<K> ShareLister<K> for FailingLister {
        fn list(&self) -> Result<Vec<Arc<K>>, ListerError> {
            Err(ListerError::Unavailable("cache not synced".to_string()))
        }
    }

    fn secret(name: &str) -> Arc<SharedSecret> {
        Arc::new(SharedSecret::new(
            name,
            SharedSecretSpec {
                secret_ref: ShareReference {
                    name: "source".to_string(),
                    namespace: "default".to_string(),
                },
                description: None,
            },
        ))
    }

    fn config_map(name: &str) -> Arc<SharedConfigMap> {
        Arc::new(SharedConfigMap::new(
            name,
            SharedConfigMapSpec {
                config_map_ref: ShareReference {
                    name: "source".to_string(),
                    namespace: "default".to_string(),
                },
                description: None,
            },
        ))
    }

    fn render(registry: &Registry) -> String {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_create_is_idempotent() {
        let registry = Registry::new();
        let collector = ShareCollector::new().unwrap();
        assert!(!collector.is_created());
        assert!(collector.create(&registry).unwrap());
        assert!(!collector.create(&registry).unwrap());
        assert!(collector.is_created());
    }

    #[test]
    fn test_clear_state_allows_recreation() {
        let registry = Registry::new();
        let collector = ShareCollector::new().unwrap();
        collector.create(&registry).unwrap();
        collector.set_listers(
            Arc::new(FixedLister(vec![secret("a")])),
            Arc::new(FixedLister(Vec::new())),
        );

        collector.clear_state(&registry);
        assert!(!collector.is_created());
        assert!(!collector.has_listers());
        assert!(collector.create(&registry).unwrap());
    }

    #[test]
    fn test_nothing_emitted_before_listers_attached() {
        let collector = ShareCollector::new().unwrap();
        assert_eq!(collector.desc().len(), 2);
        assert!(collector.collect().is_empty());
    }

    #[test]
    fn test_counts_follow_cache_contents() {
        let registry = Registry::new();
        let collector = ShareCollector::new().unwrap();
        collector.create(&registry).unwrap();
        collector.set_listers(
            Arc::new(FixedLister(vec![secret("a"), secret("b")])),
            Arc::new(FixedLister(Vec::new())),
        );

        let text = render(&registry);
        assert!(text.contains("# TYPE openshift_csi_share_secret_total gauge"));
        assert!(text.contains("openshift_csi_share_secret_total 2\n"));
        assert!(text.contains("openshift_csi_share_configmap_total 0\n"));
    }

    #[test]
    fn test_failing_lister_omits_only_its_kind() {
        let registry = Registry::new();
        let collector = ShareCollector::new().unwrap();
        collector.create(&registry).unwrap();
        collector.set_listers(
            Arc::new(FailingLister),
            Arc::new(FixedLister(Vec::new())),
        );

        let text = render(&registry);
        assert!(!text.contains("openshift_csi_share_secret_total"));
        assert!(text.contains("openshift_csi_share_configmap_total 0\n"));
    }

    #[test]
    fn test_scrapes_during_lifecycle_changes_see_whole_states() {
        let registry = Registry::new();
        let collector = ShareCollector::new().unwrap();
        let secrets: Arc<dyn ShareLister<SharedSecret>> =
            Arc::new(FixedLister(vec![secret("a")]));
        let config_maps: Arc<dyn ShareLister<SharedConfigMap>> =
            Arc::new(FixedLister(vec![config_map("a"), config_map("b")]));

        std::thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        collector.create(&registry).unwrap();
                        collector.set_listers(Arc::clone(&secrets), Arc::clone(&config_maps));
                        collector.clear_state(&registry);
                    }
                });
            }
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..500 {
                        let families = collector.collect();
                        let values: Vec<(String, f64)> = families
                            .iter()
                            .map(|family| {
                                (
                                    family.name().to_string(),
                                    family.get_metric()[0].get_gauge().value(),
                                )
                            })
                            .collect();
                        assert!(
                            values.is_empty()
                                || values
                                    == vec![
                                        (SHARED_SECRET_METRIC.to_string(), 1.0),
                                        (SHARED_CONFIGMAP_METRIC.to_string(), 2.0),
                                    ],
                            "partial scrape: {values:?}"
                        );

                        let text = render(&registry);
                        assert_eq!(
                            text.contains(SHARED_SECRET_METRIC),
                            text.contains(SHARED_CONFIGMAP_METRIC),
                            "partial gather: {text}"
                        );
                    }
                });
            }
        });

        collector.clear_state(&registry);
        assert!(!collector.is_created());
        assert!(collector.create(&registry).unwrap());
    }
}
