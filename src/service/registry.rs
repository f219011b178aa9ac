//! Registry mapping service names to descriptors.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::builder::Service;
use super::method::MethodDescriptor;
use crate::error::{Result, RpcError};

/// Per-server map of registered services.
///
/// Reads (the dispatch path) take the shared side of the lock; registration
/// takes the exclusive side. Services are never removed once installed.
#[derive(Default)]
pub struct Registry {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under its own name.
    pub fn register(&self, service: Service) -> Result<Arc<Service>> {
        let name = service.name().to_string();
        self.register_with_name(service, &name)
    }

    /// Register a service under an explicit name.
    pub fn register_with_name(&self, service: Service, name: &str) -> Result<Arc<Service>> {
        if !name.chars().next().is_some_and(char::is_uppercase) {
            return Err(RpcError::Register(format!(
                "Register: type {} is not exported",
                name
            )));
        }
        let mut services = self.services.write().expect("registry lock poisoned");
        if services.contains_key(name) {
            return Err(RpcError::Register(format!(
                "Service already defined: {}",
                name
            )));
        }
        let service = Arc::new(service);
        services.insert(name.to_string(), service.clone());
        Ok(service)
    }

    /// Look up a service and one of its methods.
    ///
    /// The method slot is `None` when the service exists but the method does
    /// not, so callers can tell the two failures apart.
    pub fn get_service_method(
        &self,
        service_name: &str,
        method_name: &str,
    ) -> (Option<Arc<Service>>, Option<Arc<MethodDescriptor>>) {
        let services = self.services.read().expect("registry lock poisoned");
        match services.get(service_name) {
            Some(service) => {
                let method = service.method(method_name);
                (Some(service.clone()), method)
            }
            None => (None, None),
        }
    }
}
