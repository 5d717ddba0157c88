//! Exposed services

use crate::attribute::AttributeStore;
use exposer_transport::{BoxConnection, Dialer};
use std::io;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Opens a new connection to the service backend
pub type OpenFn = Dialer;

/// Tears down the service backend binding
pub type CloseFn = Arc<dyn Fn() -> io::Result<()> + Send + Sync>;

/// Service errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service {0:?} is not ready")]
    NotReady(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

struct Binding {
    open: OpenFn,
    close: CloseFn,
}

/// A named backend registered by an expose session
pub struct Service {
    name: String,
    attribute: AttributeStore,
    binding: OnceLock<Binding>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("attribute", &self.attribute)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Service {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            attribute: AttributeStore::default(),
            binding: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attribute(&self) -> &AttributeStore {
        &self.attribute
    }

    /// Whether open/close functions have been attached
    pub fn is_ready(&self) -> bool {
        self.binding.get().is_some()
    }

    /// Attach the backend functions; only the first call has any effect
    pub(crate) fn bind(&self, open: OpenFn, close: CloseFn) -> bool {
        self.binding.set(Binding { open, close }).is_ok()
    }

    /// Open a connection to the backend
    pub async fn open(&self) -> Result<BoxConnection, ServiceError> {
        let open = match self.binding.get() {
            Some(binding) => binding.open.clone(),
            None => return Err(ServiceError::NotReady(self.name.clone())),
        };

        Ok(open().await?)
    }

    /// Close the backend binding
    pub fn close(&self) -> Result<(), ServiceError> {
        match self.binding.get() {
            Some(binding) => Ok((binding.close)()?),
            None => Err(ServiceError::NotReady(self.name.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_open(counter: Arc<AtomicUsize>) -> OpenFn {
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                let (a, _b) = tokio::io::duplex(16);
                Ok::<_, io::Error>(Box::new(a) as BoxConnection)
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_not_ready_before_bind() {
        let service = Service::new("svc".to_string());

        assert!(matches!(
            service.open().await,
            Err(ServiceError::NotReady(name)) if name == "svc"
        ));
        assert!(matches!(service.close(), Err(ServiceError::NotReady(_))));
        assert_eq!(
            service.close().unwrap_err().to_string(),
            r#"service "svc" is not ready"#
        );
    }

    #[tokio::test]
    async fn test_open_invokes_bound_function_once_per_call() {
        let service = Service::new("svc".to_string());
        let opened = Arc::new(AtomicUsize::new(0));

        assert!(service.bind(counting_open(opened.clone()), Arc::new(|| Ok::<(), io::Error>(()))));
        assert!(service.is_ready());

        service.open().await.unwrap();
        service.open().await.unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }
}
