//! Service registry with two-phase reserve/attach

use crate::service::{CloseFn, OpenFn, Service};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

/// Service registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("service name {0:?} already exists")]
    AlreadyExists(String),
}

/// Name → service table
///
/// A name is reserved with [`prepare`](Self::prepare) before the exposing
/// client has set up its session, so a second exposer of the same name is
/// rejected up front. [`add`](Self::add) then binds the backend.
#[derive(Default)]
pub struct ServiceRegistry {
    services: Mutex<BTreeMap<String, Arc<Service>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<Service>>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `name` with an empty attribute and no backend
    pub fn prepare(&self, name: &str) -> Result<Arc<Service>, RegistryError> {
        let mut services = self.lock();

        if name.is_empty() || services.contains_key(name) {
            return Err(RegistryError::AlreadyExists(name.to_string()));
        }

        let service = Arc::new(Service::new(name.to_string()));
        services.insert(name.to_string(), service.clone());

        debug!(name = %name, "Service reserved");
        Ok(service)
    }

    /// Bind backend functions to a prepared service
    ///
    /// Returns false if `name` was never prepared. A service keeps the first
    /// pair of functions it is given.
    pub fn add(&self, name: &str, open: OpenFn, close: CloseFn) -> bool {
        let services = self.lock();

        match services.get(name) {
            Some(service) => {
                if service.bind(open, close) {
                    debug!(name = %name, "Service ready");
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.lock().get(name).cloned()
    }

    /// Delete `name`, closing its backend if one was bound
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.lock().remove(name);

        match removed {
            Some(service) => {
                if service.is_ready() {
                    if let Err(e) = service.close() {
                        warn!(name = %name, "Failed to close service: {}", e);
                    }
                }
                debug!(name = %name, "Service removed");
                true
            }
            None => false,
        }
    }

    /// Snapshot of every service, sorted by name
    pub fn all(&self) -> Vec<Arc<Service>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exposer_transport::BoxConnection;
    use futures::FutureExt;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tagged_open(tag: Arc<AtomicUsize>, value: usize) -> OpenFn {
        Arc::new(move || {
            tag.store(value, Ordering::SeqCst);
            async {
                let (a, _b) = tokio::io::duplex(16);
                Ok::<_, io::Error>(Box::new(a) as BoxConnection)
            }
            .boxed()
        })
    }

    fn counting_close(counter: Arc<AtomicUsize>) -> CloseFn {
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), io::Error>(())
        })
    }

    #[test]
    fn test_prepare_duplicate() {
        let registry = ServiceRegistry::new();

        registry.prepare("svc").unwrap();
        assert_eq!(
            registry.prepare("svc").unwrap_err(),
            RegistryError::AlreadyExists("svc".to_string())
        );
    }

    #[test]
    fn test_prepare_empty_name() {
        let registry = ServiceRegistry::new();
        assert!(registry.prepare("").is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_add_before_prepare() {
        let registry = ServiceRegistry::new();
        let close = counting_close(Arc::new(AtomicUsize::new(0)));
        let open = tagged_open(Arc::new(AtomicUsize::new(0)), 1);

        assert!(!registry.add("svc", open, close));
    }

    #[tokio::test]
    async fn test_add_keeps_first_binding() {
        let registry = ServiceRegistry::new();
        let tag = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        registry.prepare("svc").unwrap();
        assert!(registry.add(
            "svc",
            tagged_open(tag.clone(), 1),
            counting_close(closed.clone())
        ));
        assert!(registry.add(
            "svc",
            tagged_open(tag.clone(), 2),
            counting_close(closed.clone())
        ));

        registry.get("svc").unwrap().open().await.unwrap();
        assert_eq!(tag.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_closes_bound_service() {
        let registry = ServiceRegistry::new();
        let closed = Arc::new(AtomicUsize::new(0));

        registry.prepare("svc").unwrap();
        registry.add(
            "svc",
            tagged_open(Arc::new(AtomicUsize::new(0)), 1),
            counting_close(closed.clone()),
        );

        assert!(registry.remove("svc"));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(registry.get("svc").is_none());
        assert!(!registry.remove("svc"));

        // The name is free again
        registry.prepare("svc").unwrap();
    }

    #[test]
    fn test_remove_ignores_close_error() {
        let registry = ServiceRegistry::new();

        registry.prepare("svc").unwrap();
        registry.add(
            "svc",
            tagged_open(Arc::new(AtomicUsize::new(0)), 1),
            Arc::new(|| Err::<(), _>(io::Error::other("already closed"))),
        );

        assert!(registry.remove("svc"));
    }

    #[test]
    fn test_remove_unbound_service() {
        let registry = ServiceRegistry::new();
        registry.prepare("svc").unwrap();
        assert!(registry.remove("svc"));
    }

    #[test]
    fn test_all_sorted_by_name() {
        let registry = ServiceRegistry::new();
        for name in ["web", "db", "api"] {
            registry.prepare(name).unwrap();
        }

        let names: Vec<_> = registry
            .all()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["api", "db", "web"]);
    }
}
