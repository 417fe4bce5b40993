//! Registration and removal tokens
//!
//! Tokens are requested fresh for every reconcile pass and never cached
//! between passes; a pass reuses the token it fetched for all its runners.

use crate::clients::{ClientError, RegistrationService};
use crate::config::GithubPath;
use crate::retry::RetryPolicy;
use crate::{FleetError, Result};
use std::sync::Arc;

pub struct TokenBroker {
    registry: Arc<dyn RegistrationService>,
    path: GithubPath,
    retry: RetryPolicy,
}

impl TokenBroker {
    pub fn new(registry: Arc<dyn RegistrationService>, path: GithubPath, retry: RetryPolicy) -> Self {
        Self {
            registry,
            path,
            retry,
        }
    }

    /// Token used by new runners to register themselves.
    pub async fn registration_token(&self) -> Result<String> {
        let registry = &self.registry;
        let path = &self.path;
        self.retry
            .run(
                "registration token request",
                || async move {
                    match path {
                        GithubPath::Repo(repo) => {
                            registry.create_registration_token_for_repo(repo).await
                        }
                        GithubPath::Org(org) => registry.create_registration_token_for_org(org).await,
                    }
                },
                ClientError::is_retryable,
            )
            .await
            .map_err(|err| FleetError::Token(format!("registration token for {}: {}", path, err)))
    }

    /// Token used to deregister runners.
    pub async fn removal_token(&self) -> Result<String> {
        let registry = &self.registry;
        let path = &self.path;
        self.retry
            .run(
                "removal token request",
                || async move {
                    match path {
                        GithubPath::Repo(repo) => registry.create_remove_token_for_repo(repo).await,
                        GithubPath::Org(org) => registry.create_remove_token_for_org(org).await,
                    }
                },
                ClientError::is_retryable,
            )
            .await
            .map_err(|err| FleetError::Token(format!("removal token for {}: {}", path, err)))
    }
}
