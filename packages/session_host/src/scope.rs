//! Per-session resolution scope.
//!
//! A `ScopeProvider` is created alongside its [`Session`] and caches one
//! instance of every scoped service it resolves. Instances are created on
//! first resolution by the factories registered in the process-wide
//! [`ServiceRegistry`](crate::registry::ServiceRegistry) and released on
//! [`ScopeProvider::dispose`].
//!
//! The scope refers to its session weakly: the session's dispatcher owns the
//! scope, so dropping the last session handle ends the dispatcher and
//! disposes the scope.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

use crate::config::HostOptions;
use crate::error::SessionError;
use crate::interop::InteropAccessor;
use crate::navigation::NavigationHelper;
use crate::registry::{AnyService, ScopedBindings};
use crate::session::{Session, SessionId};

pub struct ScopeProvider {
    session: Weak<Session>,
    session_id: SessionId,
    options: Arc<HostOptions>,
    bindings: Arc<ScopedBindings>,
    instances: Mutex<HashMap<TypeId, AnyService>>,
    disposed: AtomicBool,
}

impl ScopeProvider {
    pub(crate) fn new(
        session: &Arc<Session>,
        options: Arc<HostOptions>,
        bindings: Arc<ScopedBindings>,
    ) -> Self {
        Self {
            session: Arc::downgrade(session),
            session_id: session.id(),
            options,
            bindings,
            instances: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// The session this scope belongs to, while any handle to it is alive
    pub fn session(&self) -> Result<Arc<Session>, SessionError> {
        self.session
            .upgrade()
            .ok_or(SessionError::SessionTerminated(self.session_id))
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn options(&self) -> &HostOptions {
        &self.options
    }

    /// Resolve the scope's instance of `T`, creating it on first access.
    ///
    /// Every later call in this scope returns the same `Arc`.
    pub fn resolve<T: Any + Send + Sync>(&self) -> Result<Arc<T>, SessionError> {
        let key = TypeId::of::<T>();
        if let Some(existing) = self.cached(key)? {
            return downcast(existing);
        }

        let binding = self
            .bindings
            .get(key)
            .ok_or(SessionError::ServiceNotRegistered {
                service: std::any::type_name::<T>(),
            })?;

        // The factory may resolve other services from this scope, so the
        // table is not locked while it runs.
        let created = (binding.factory)(self)?;
        // Caching the session here would keep it alive for as long as its
        // own dispatcher runs.
        if key == TypeId::of::<Session>() {
            return downcast(created);
        }

        let instance = {
            let mut instances = self.lock();
            if self.is_disposed() {
                return Err(SessionError::ScopeDisposed(self.session_id));
            }
            instances.entry(key).or_insert(created).clone()
        };
        debug!(
            session_id = %self.session_id,
            service = binding.service,
            "Resolved scoped service"
        );
        downcast(instance)
    }

    /// Return the cached instance of `T` without creating it
    pub fn try_get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.cached(TypeId::of::<T>())
            .ok()
            .flatten()
            .and_then(|instance| instance.downcast::<T>().ok())
    }

    pub fn interop(&self) -> Result<Arc<InteropAccessor>, SessionError> {
        self.resolve::<InteropAccessor>()
    }

    pub fn navigation(&self) -> Result<Arc<NavigationHelper>, SessionError> {
        self.resolve::<NavigationHelper>()
    }

    /// Release every cached instance. Safe to call more than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let released: Vec<AnyService> = self.lock().drain().map(|(_, v)| v).collect();
        debug!(
            session_id = %self.session_id,
            released = released.len(),
            "Scope disposed"
        );
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn cached(&self, key: TypeId) -> Result<Option<AnyService>, SessionError> {
        if self.is_disposed() {
            return Err(SessionError::ScopeDisposed(self.session_id));
        }
        Ok(self.lock().get(&key).cloned())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TypeId, AnyService>> {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn downcast<T: Any + Send + Sync>(instance: AnyService) -> Result<Arc<T>, SessionError> {
    instance
        .downcast::<T>()
        .map_err(|_| SessionError::ServiceNotRegistered {
            service: std::any::type_name::<T>(),
        })
}
