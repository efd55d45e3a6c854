use std::sync::Arc;

use anyhow::Result;
use log::{log, Level};

use crate::{
    blob::{BlobStore, HttpBlobStore},
    config::Config,
    error::CampusResult,
    identity::TokenVerifier,
    session::{Session, SessionUser, UserDirectory},
    store::{postgres::PgStore, DocumentStore},
    sync::{MutationCoordinator, SubscriptionManager},
};

/// Everything a page needs, shared between pages.
#[derive(Clone)]
pub struct CampusContext {
    pub store: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub session: Arc<Session>,
    pub users: Arc<UserDirectory>,
    pub subscriptions: SubscriptionManager,
    pub coordinator: MutationCoordinator,
    pub verifier: TokenVerifier,
}

impl CampusContext {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        verifier: TokenVerifier,
    ) -> Self {
        Self {
            subscriptions: SubscriptionManager::new(store.clone()),
            store,
            blobs,
            session: Arc::new(Session::new()),
            users: Arc::new(UserDirectory::new()),
            coordinator: MutationCoordinator::new(),
            verifier,
        }
    }

    /// Postgres-backed context with an HTTP blob store.
    pub async fn connect(config: &Config) -> Result<Self> {
        let store = PgStore::connect(&config.database_url).await?;
        let blobs = HttpBlobStore::new(&config.blob_endpoint, config.blob_token.clone());
        let verifier = TokenVerifier::new(config.jwks_url.clone(), config.token_audience.clone());
        log!(Level::Info, "Campus context ready");
        Ok(Self::new(Arc::new(store), Arc::new(blobs), verifier))
    }

    /// Verifies an ID token and starts a session for its subject.
    pub async fn sign_in(&self, id_token: &str) -> CampusResult<SessionUser> {
        let identity = self.verifier.verify(id_token).await?;
        self.session.sign_in(identity, self.store.as_ref()).await
    }

    pub fn sign_out(&self) {
        self.session.sign_out();
    }
}
