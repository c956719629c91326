use anyhow::Result;
use kapply_core::{Document, Fingerprint, Identity, LiveObject, Patch, RemoteError, TypeCategory};
use kube::{
    api::{Api, DeleteParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::Remote;

/// Remote backed by a live cluster. Discovery runs once, on first use.
pub struct KubeRemote {
    client: Client,
    resources: OnceCell<Vec<(ApiResource, bool)>>,
}

impl KubeRemote {
    pub fn new(client: Client) -> Self {
        Self { client, resources: OnceCell::new() }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    pub fn client(&self) -> Client { self.client.clone() }

    async fn discovered(&self) -> Result<&Vec<(ApiResource, bool)>, RemoteError> {
        self.resources
            .get_or_try_init(|| async {
                let discovery = Discovery::new(self.client.clone()).run().await.map_err(map_kube_error)?;
                let mut out = Vec::new();
                for group in discovery.groups() {
                    for (ar, caps) in group.recommended_resources() {
                        out.push((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
                    }
                }
                info!(count = out.len(), "discovered served resources");
                Ok::<_, RemoteError>(out)
            })
            .await
    }

    async fn find_api_resource(&self, ty: &TypeCategory) -> Result<(ApiResource, bool), RemoteError> {
        let resources = self.discovered().await?;
        let exact = resources
            .iter()
            .find(|(ar, _)| ar.group == ty.group && ar.version == ty.version && ar.kind == ty.kind);
        let same_kind = || resources.iter().find(|(ar, _)| ar.group == ty.group && ar.kind == ty.kind);
        match exact.or_else(same_kind) {
            Some((ar, namespaced)) => {
                // Keep the requested version when the server serves it under another preferred one.
                let mut ar = ar.clone();
                if ar.version != ty.version {
                    ar = ApiResource::from_gvk_with_plural(
                        &kube::core::GroupVersionKind { group: ty.group.clone(), version: ty.version.clone(), kind: ty.kind.clone() },
                        &ar.plural,
                    );
                }
                Ok((ar, *namespaced))
            }
            None => Err(RemoteError::Rejected(format!("kind not served by cluster: {}", ty))),
        }
    }

    async fn api(&self, identity: &Identity, ty: &TypeCategory) -> Result<(Api<DynamicObject>, bool), RemoteError> {
        let (ar, namespaced) = self.find_api_resource(ty).await?;
        let api = if namespaced {
            Api::namespaced_with(self.client.clone(), &identity.namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok((api, namespaced))
    }
}

/// Translate a kube client error into the reconciler's remote taxonomy.
pub fn map_kube_error(e: kube::Error) -> RemoteError {
    match e {
        kube::Error::Api(resp) => match resp.code {
            404 => RemoteError::NotFound,
            409 if resp.reason == "AlreadyExists" => RemoteError::AlreadyExists,
            409 => RemoteError::Conflict,
            400 | 422 => RemoteError::Rejected(resp.message),
            429 | 500..=599 => RemoteError::Unavailable(resp.message),
            _ => RemoteError::Other(format!("{} ({})", resp.message, resp.code)),
        },
        other => RemoteError::Unavailable(other.to_string()),
    }
}

fn fingerprint_of(obj: &DynamicObject) -> Fingerprint {
    Fingerprint(obj.metadata.resource_version.clone().unwrap_or_default())
}

fn to_dynamic(doc: &Document, namespaced: bool) -> Result<DynamicObject, RemoteError> {
    let mut obj: DynamicObject = serde_json::from_value(doc.clone())
        .map_err(|e| RemoteError::Rejected(format!("document is not a valid object: {}", e)))?;
    if !namespaced {
        obj.metadata.namespace = None;
    }
    Ok(obj)
}

fn to_live(obj: &DynamicObject) -> Result<LiveObject, RemoteError> {
    let doc = serde_json::to_value(obj).map_err(|e| RemoteError::Other(format!("serializing DynamicObject: {}", e)))?;
    Ok(LiveObject { doc, fingerprint: fingerprint_of(obj) })
}

#[async_trait::async_trait]
impl Remote for KubeRemote {
    async fn is_namespaced(&self, ty: &TypeCategory) -> bool {
        match self.find_api_resource(ty).await {
            Ok((_, namespaced)) => namespaced,
            Err(e) => {
                debug!(kind = %ty, error = %e, "scope not discovered; using built-in table");
                ty.builtin_namespaced()
            }
        }
    }

    async fn get(&self, identity: &Identity, ty: &TypeCategory) -> Result<Option<LiveObject>, RemoteError> {
        let (api, _) = self.api(identity, ty).await?;
        match api.get_opt(&identity.name).await.map_err(map_kube_error)? {
            Some(obj) => Ok(Some(to_live(&obj)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, identity: &Identity, ty: &TypeCategory, doc: &Document) -> Result<Fingerprint, RemoteError> {
        let (api, namespaced) = self.api(identity, ty).await?;
        let obj = to_dynamic(doc, namespaced)?;
        let created = api.create(&PostParams::default(), &obj).await.map_err(map_kube_error)?;
        counter!("kube_writes_total", 1u64, "verb" => "create");
        Ok(fingerprint_of(&created))
    }

    async fn patch(
        &self,
        identity: &Identity,
        ty: &TypeCategory,
        patch: &Patch,
        precondition: &Fingerprint,
    ) -> Result<Fingerprint, RemoteError> {
        let (api, namespaced) = self.api(identity, ty).await?;
        let current = api.get_opt(&identity.name).await.map_err(map_kube_error)?.ok_or(RemoteError::NotFound)?;
        if &fingerprint_of(&current) != precondition {
            return Err(RemoteError::Conflict);
        }
        // Computed client-side; the server rejects the replace with 409 if the
        // object moved past `precondition` in the meantime.
        let mut next = to_live(&current)?.doc;
        patch.apply_to(&mut next);
        let mut obj = to_dynamic(&next, namespaced)?;
        obj.metadata.resource_version = Some(precondition.0.clone());
        debug!(identity = %identity, kind = %ty, ops = patch.len(), "replacing with precondition");
        let replaced = api.replace(&identity.name, &PostParams::default(), &obj).await.map_err(map_kube_error)?;
        counter!("kube_writes_total", 1u64, "verb" => "replace");
        Ok(fingerprint_of(&replaced))
    }

    async fn delete(&self, identity: &Identity, ty: &TypeCategory) -> Result<bool, RemoteError> {
        let (api, _) = self.api(identity, ty).await?;
        match api.delete(&identity.name, &DeleteParams::background()).await {
            Ok(_) => {
                counter!("kube_writes_total", 1u64, "verb" => "delete");
                Ok(true)
            }
            Err(e) => match map_kube_error(e) {
                RemoteError::NotFound => Ok(false),
                other => Err(other),
            },
        }
    }
}
