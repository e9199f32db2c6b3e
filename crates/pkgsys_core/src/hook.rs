//! Adapter between a host's symbol lookup and the engine.

use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use pkgsys_loader::ModuleHandle;
use pkgsys_registry::Transport;

use crate::engine::ResolutionEngine;
use crate::request::ResolutionRequest;
use crate::ResolveError;

/// A callback a host consults when a name is looked up.
///
/// Returning `None` means the name is not handled here and the host should
/// fall through to its default lookup.
pub trait ImportHook: Send + Sync {
    fn find(&self, name: &str) -> Option<BoxFuture<'_, Result<ModuleHandle, ResolveError>>>;
}

/// Routes `provider.unit[@version]` names of registered providers to the
/// engine.
pub struct ProviderImportHook<T: Transport> {
    engine: Arc<ResolutionEngine<T>>,
}

impl<T: Transport> ProviderImportHook<T> {
    pub fn new(engine: Arc<ResolutionEngine<T>>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<ResolutionEngine<T>> {
        &self.engine
    }

    /// The request for `name`, if this hook handles it.
    pub fn recognize(&self, name: &str) -> Option<ResolutionRequest> {
        let request = ResolutionRequest::parse(name).ok()?;
        self.engine
            .registry()
            .contains(&request.provider)
            .then_some(request)
    }
}

impl<T: Transport> ImportHook for ProviderImportHook<T> {
    fn find(&self, name: &str) -> Option<BoxFuture<'_, Result<ModuleHandle, ResolveError>>> {
        let request = self.recognize(name)?;
        Some(async move { self.engine.resolve(&request).await }.boxed())
    }
}
