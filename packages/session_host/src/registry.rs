//! Process-wide service registry.
//!
//! `ServiceRegistry` is the mutable builder used during process
//! configuration. Every binding is added with "add if absent" semantics and
//! recorded under a [`BindingKey`], so the registry's contents are a pure
//! function of call order. [`ServiceRegistry::build`] freezes it into a
//! [`ServiceProvider`] once configuration is over.

use std::any::{Any, TypeId};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};

use crate::endpoint::EndpointStartupTable;
use crate::error::SessionError;
use crate::scope::ScopeProvider;

pub(crate) type AnyService = Arc<dyn Any + Send + Sync>;

pub type SingletonFactory =
    Arc<dyn Fn(&ServiceProvider) -> Result<AnyService, SessionError> + Send + Sync>;

pub type ScopedFactory =
    Arc<dyn Fn(&ScopeProvider) -> Result<AnyService, SessionError> + Send + Sync>;

/// How long a bound instance lives
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Lifetime {
    /// One instance for the whole process
    Singleton,
    /// One instance per session scope
    Scoped,
}

/// Identifies one binding in the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BindingKey {
    pub service: &'static str,
    pub lifetime: Lifetime,
}

impl BindingKey {
    fn of<T: Any>(lifetime: Lifetime) -> Self {
        Self {
            service: std::any::type_name::<T>(),
            lifetime,
        }
    }
}

enum SingletonBinding {
    Instance(AnyService),
    Factory(SingletonFactory),
}

struct NamedSingleton {
    service: &'static str,
    binding: SingletonBinding,
}

pub(crate) struct ScopedBinding {
    pub(crate) service: &'static str,
    pub(crate) factory: ScopedFactory,
}

/// Scoped factories shared by every session scope
#[derive(Default)]
pub(crate) struct ScopedBindings {
    factories: HashMap<TypeId, ScopedBinding>,
}

impl ScopedBindings {
    pub(crate) fn get(&self, key: TypeId) -> Option<&ScopedBinding> {
        self.factories.get(&key)
    }
}

#[derive(Default)]
pub struct ServiceRegistry {
    singletons: HashMap<TypeId, NamedSingleton>,
    scoped: ScopedBindings,
    keys: BTreeSet<BindingKey>,
    endpoints: EndpointStartupTable,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `value` as the process-wide `T` unless a `T` singleton exists.
    ///
    /// Returns whether the binding was added.
    pub fn try_add_singleton<T: Any + Send + Sync>(&mut self, value: T) -> bool {
        self.insert_singleton::<T>(SingletonBinding::Instance(Arc::new(value)))
    }

    /// Bind a lazily constructed process-wide `T` unless a `T` singleton exists.
    pub fn try_add_singleton_with<T, F>(&mut self, factory: F) -> bool
    where
        T: Any + Send + Sync,
        F: Fn(&ServiceProvider) -> Result<T, SessionError> + Send + Sync + 'static,
    {
        let factory: SingletonFactory =
            Arc::new(move |provider| factory(provider).map(|v| Arc::new(v) as AnyService));
        self.insert_singleton::<T>(SingletonBinding::Factory(factory))
    }

    /// Bind a per-session `T` unless a scoped `T` exists.
    pub fn try_add_scoped<T, F>(&mut self, factory: F) -> bool
    where
        T: Any + Send + Sync,
        F: Fn(&ScopeProvider) -> Result<Arc<T>, SessionError> + Send + Sync + 'static,
    {
        let key = TypeId::of::<T>();
        if self.scoped.factories.contains_key(&key) {
            return false;
        }
        let factory: ScopedFactory = Arc::new(move |scope| factory(scope).map(|v| v as AnyService));
        self.scoped.factories.insert(
            key,
            ScopedBinding {
                service: std::any::type_name::<T>(),
                factory,
            },
        );
        self.keys.insert(BindingKey::of::<T>(Lifetime::Scoped));
        true
    }

    /// The `T` singleton bound as an instance, if any
    pub fn singleton<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match &self.singletons.get(&TypeId::of::<T>())?.binding {
            SingletonBinding::Instance(value) => value.clone().downcast::<T>().ok(),
            SingletonBinding::Factory(_) => None,
        }
    }

    pub fn contains(&self, key: &BindingKey) -> bool {
        self.keys.contains(key)
    }

    pub fn bindings(&self) -> &BTreeSet<BindingKey> {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn endpoints(&self) -> &EndpointStartupTable {
        &self.endpoints
    }

    pub fn endpoints_mut(&mut self) -> &mut EndpointStartupTable {
        &mut self.endpoints
    }

    /// Freeze the registry. Endpoint bindings are read-only from here on.
    pub fn build(self) -> Arc<ServiceProvider> {
        let singletons = self
            .singletons
            .into_iter()
            .map(|(key, named)| {
                let slot = match named.binding {
                    SingletonBinding::Instance(value) => SingletonSlot {
                        service: named.service,
                        value: OnceLock::from(value),
                        factory: None,
                    },
                    SingletonBinding::Factory(factory) => SingletonSlot {
                        service: named.service,
                        value: OnceLock::new(),
                        factory: Some(factory),
                    },
                };
                (key, slot)
            })
            .collect();

        Arc::new(ServiceProvider {
            singletons,
            scoped: Arc::new(self.scoped),
            endpoints: Arc::new(self.endpoints),
            keys: self.keys,
        })
    }

    fn insert_singleton<T: Any>(&mut self, binding: SingletonBinding) -> bool {
        let key = TypeId::of::<T>();
        if self.singletons.contains_key(&key) {
            return false;
        }
        self.singletons.insert(
            key,
            NamedSingleton {
                service: std::any::type_name::<T>(),
                binding,
            },
        );
        self.keys.insert(BindingKey::of::<T>(Lifetime::Singleton));
        true
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("bindings", &self.keys)
            .field("endpoints", &self.endpoints.endpoints().collect::<Vec<_>>())
            .finish()
    }
}

struct SingletonSlot {
    service: &'static str,
    value: OnceLock<AnyService>,
    factory: Option<SingletonFactory>,
}

/// Frozen, process-wide view of a [`ServiceRegistry`].
pub struct ServiceProvider {
    singletons: HashMap<TypeId, SingletonSlot>,
    scoped: Arc<ScopedBindings>,
    endpoints: Arc<EndpointStartupTable>,
    keys: BTreeSet<BindingKey>,
}

impl ServiceProvider {
    /// Resolve the process-wide `T`, constructing it on first access.
    pub fn get<T: Any + Send + Sync>(&self) -> Result<Arc<T>, SessionError> {
        let not_registered = || SessionError::ServiceNotRegistered {
            service: std::any::type_name::<T>(),
        };
        let slot = self
            .singletons
            .get(&TypeId::of::<T>())
            .ok_or_else(not_registered)?;

        let value = match slot.value.get() {
            Some(value) => value.clone(),
            None => {
                let factory = slot
                    .factory
                    .as_ref()
                    .ok_or(SessionError::ServiceNotRegistered {
                        service: slot.service,
                    })?;
                let created = factory(self)?;
                slot.value.get_or_init(|| created).clone()
            }
        };
        value.downcast::<T>().map_err(|_| not_registered())
    }

    pub fn endpoints(&self) -> &Arc<EndpointStartupTable> {
        &self.endpoints
    }

    pub(crate) fn scoped_bindings(&self) -> &Arc<ScopedBindings> {
        &self.scoped
    }

    pub fn bindings(&self) -> &BTreeSet<BindingKey> {
        &self.keys
    }
}
