use std::sync::Arc;

use hopper_core::agent::ContainerAgent;
use hopper_core::auth::TokenSigner;
use hopper_core::inbox::Inbox;
use hopper_core::store::Store;

/// Shared handles for every request handler.
#[derive(Clone)]
pub struct AppState {
    pub inbox: Arc<Inbox>,
    pub store: Arc<dyn Store>,
    pub agent: Arc<ContainerAgent>,
    /// `None` leaves every route open.
    pub auth: Option<Arc<TokenSigner>>,
}

impl AppState {
    pub fn new(inbox: Arc<Inbox>, store: Arc<dyn Store>, agent: Arc<ContainerAgent>) -> Self {
        Self {
            inbox,
            store,
            agent,
            auth: None,
        }
    }

    pub fn with_auth(mut self, signer: TokenSigner) -> Self {
        self.auth = Some(Arc::new(signer));
        self
    }
}
