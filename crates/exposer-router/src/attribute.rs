//! Lock-guarded service metadata

use exposer_proto::Attribute;
use std::convert::Infallible;
use std::sync::{PoisonError, RwLock};

/// Thread-safe holder of one service's [`Attribute`]
///
/// The attribute is only reachable inside `view`/`update` closures. The lock
/// is held for the duration of the closure, so closures must not block.
#[derive(Debug, Default)]
pub struct AttributeStore {
    inner: RwLock<Attribute>,
}

impl AttributeStore {
    /// Read under a shared lock
    pub fn view<T, E>(&self, f: impl FnOnce(&Attribute) -> Result<T, E>) -> Result<T, E> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Mutate under an exclusive lock
    pub fn update<T, E>(&self, f: impl FnOnce(&mut Attribute) -> Result<T, E>) -> Result<T, E> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Copy of the current value
    pub fn snapshot(&self) -> Attribute {
        match self.view(|attr| Ok::<_, Infallible>(attr.clone())) {
            Ok(attr) => attr,
            Err(never) => match never {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_view_returns_closure_error() {
        let store = AttributeStore::default();
        let result: Result<(), &str> = store.view(|_| Err("boom"));
        assert_eq!(result, Err("boom"));
    }

    #[test]
    fn test_update_then_view() {
        let store = AttributeStore::default();
        store
            .update(|attr| {
                attr.http.is = true;
                attr.http.host = "internal.test".to_string();
                Ok::<_, Infallible>(())
            })
            .unwrap();

        let host = store
            .view(|attr| Ok::<_, Infallible>(attr.http_host().to_string()))
            .unwrap();
        assert_eq!(host, "internal.test");
        assert!(store.snapshot().is_http());
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let store = Arc::new(AttributeStore::default());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store
                            .update(|attr| {
                                attr.http.host.push('x');
                                Ok::<_, Infallible>(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.snapshot().http.host.len(), 800);
    }
}
