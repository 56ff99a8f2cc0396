//! Caller namespace-scope resolution.

use async_trait::async_trait;
use kube::{
    api::{Api, ListParams},
    config::AuthInfo,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client, Config, ResourceExt,
};
use metrics_proxy_core::{Error, NamespaceSet};
use secrecy::SecretString;
use tracing::{debug, instrument};

/// Resolves the set of namespaces a caller may observe.
///
/// One resolution per inbound request; results are never cached across
/// requests, so a revoked token loses access on its next call.
#[async_trait]
pub trait NamespaceResolver: Send + Sync + 'static {
    async fn resolve(&self, bearer_token: &str) -> Result<NamespaceSet, Error>;
}

/// Lists `project.openshift.io/v1` Projects with the caller's own bearer
/// token, so the cluster's RBAC decides what the caller can see. The proxy
/// never grants access the token does not already have.
#[derive(Clone)]
pub struct ProjectResolver {
    base: Config,
}

// === impl ProjectResolver ===

impl ProjectResolver {
    /// `base` supplies the API server address and TLS roots; its identity is
    /// replaced per request with the caller's token.
    pub fn new(base: Config) -> Self {
        Self { base }
    }

    fn client_for(&self, token: &str) -> Result<Client, Error> {
        let mut config = self.base.clone();
        config.auth_info = AuthInfo {
            token: Some(SecretString::from(token.to_string())),
            ..AuthInfo::default()
        };
        Client::try_from(config).map_err(|error| Error::UpstreamUnavailable(error.to_string()))
    }
}

#[async_trait]
impl NamespaceResolver for ProjectResolver {
    #[instrument(skip_all)]
    async fn resolve(&self, bearer_token: &str) -> Result<NamespaceSet, Error> {
        if bearer_token.is_empty() {
            return Err(Error::Unauthenticated);
        }

        let client = self.client_for(bearer_token)?;
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(
            "project.openshift.io",
            "v1",
            "Project",
        ));
        let api = Api::<DynamicObject>::all_with(client, &resource);
        let projects = api
            .list(&ListParams::default())
            .await
            .map_err(map_list_error)?;

        let namespaces = projects
            .items
            .iter()
            .map(|project| project.name_any())
            .collect::<NamespaceSet>();
        debug!(namespaces = namespaces.len(), "Resolved caller scope");
        Ok(namespaces)
    }
}

fn map_list_error(error: kube::Error) -> Error {
    match error {
        kube::Error::Api(rsp) if rsp.code == 401 => Error::Unauthenticated,
        error => crate::map_kube_error(error),
    }
}
