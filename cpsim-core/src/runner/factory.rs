use std::sync::Arc;

use crate::config::SessionSettings;
use crate::connection::Connector;
use crate::identity::IdentityProvider;
use crate::script::SessionScript;
use crate::session::VirtualClientSession;

/// Builds the session for a freshly allocated client index.
pub trait SessionFactory: Send + Sync + 'static {
    fn create(&self, client_index: u64) -> VirtualClientSession;
}

impl<F> SessionFactory for F
where
    F: Fn(u64) -> VirtualClientSession + Send + Sync + 'static,
{
    fn create(&self, client_index: u64) -> VirtualClientSession {
        self(client_index)
    }
}

/// Every client plays the same script against the same endpoint; only the identity varies.
#[derive(Clone)]
pub struct ScriptedSessionFactory {
    identities: IdentityProvider,
    script: Arc<SessionScript>,
    connector: Arc<dyn Connector>,
    settings: Arc<SessionSettings>,
}

impl ScriptedSessionFactory {
    pub fn new(
        identities: IdentityProvider,
        script: Arc<SessionScript>,
        connector: Arc<dyn Connector>,
        settings: Arc<SessionSettings>,
    ) -> Self {
        Self {
            identities,
            script,
            connector,
            settings,
        }
    }
}

impl SessionFactory for ScriptedSessionFactory {
    fn create(&self, client_index: u64) -> VirtualClientSession {
        VirtualClientSession::new(
            self.identities.identity_for(client_index),
            self.script.clone(),
            self.connector.clone(),
            self.settings.clone(),
        )
    }
}
