//! HTTP implementation of [`ProviderApi`] against the Outscale API.
//!
//! Every verb is a signed `POST {endpoint}/api/v1/{Action}` with a JSON body.
//! Failures are classified once, here, into [`CloudError`] so the retry layer
//! above only ever looks at status codes and error codes.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

use super::api::*;
use super::sign::Signer;
use super::CloudError;

pub const ENV_ACCESS_KEY: &str = "OSC_ACCESS_KEY";
pub const ENV_SECRET_KEY: &str = "OSC_SECRET_KEY";
pub const ENV_REGION: &str = "OSC_REGION";
pub const ENV_REGION_FALLBACK: &str = "AWS_REGION";
pub const ENV_ENDPOINT: &str = "OSC_ENDPOINT_API";

const SERVICE: &str = "oapi";

/// API credentials and location.
#[derive(Clone)]
pub struct OscCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    /// Overrides `https://api.{region}.outscale.com`.
    pub endpoint: Option<String>,
}

impl std::fmt::Debug for OscCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OscCredentials")
            .field("access_key", &self.access_key)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl OscCredentials {
    /// Read credentials from the environment.  `region` wins over the
    /// environment when given.
    pub fn from_env(region: Option<&str>) -> Result<Self, CloudError> {
        let var = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());
        let access_key = var(ENV_ACCESS_KEY)
            .ok_or_else(|| CloudError::Config(format!("{ENV_ACCESS_KEY} is not set")))?;
        let secret_key = var(ENV_SECRET_KEY)
            .ok_or_else(|| CloudError::Config(format!("{ENV_SECRET_KEY} is not set")))?;
        let region = region
            .map(str::to_owned)
            .or_else(|| var(ENV_REGION))
            .or_else(|| var(ENV_REGION_FALLBACK))
            .ok_or_else(|| CloudError::Config("no region configured".to_owned()))?;
        Ok(Self {
            access_key,
            secret_key,
            region,
            endpoint: var(ENV_ENDPOINT),
        })
    }
}

pub struct OscApi {
    client: reqwest::Client,
    credentials: OscCredentials,
    base_url: String,
    host: String,
}

impl OscApi {
    pub fn new(credentials: OscCredentials) -> Result<Self, CloudError> {
        let base_url = credentials
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://api.{}.outscale.com", credentials.region));
        let base_url = base_url.trim_end_matches('/').to_owned();
        let host = reqwest::Url::parse(&base_url)
            .ok()
            .and_then(|u| {
                u.host_str().map(|h| match u.port() {
                    Some(p) => format!("{h}:{p}"),
                    None => h.to_owned(),
                })
            })
            .ok_or_else(|| CloudError::Config(format!("invalid endpoint {base_url}")))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| CloudError::Network(e.to_string()))?;
        Ok(Self {
            client,
            credentials,
            base_url,
            host,
        })
    }

    pub fn region(&self) -> &str {
        &self.credentials.region
    }

    #[instrument(skip(self, body), fields(region = %self.credentials.region))]
    async fn call<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        action: &str,
        body: &B,
    ) -> Result<R, CloudError> {
        let payload =
            serde_json::to_vec(body).map_err(|e| CloudError::InvalidResponse(e.to_string()))?;
        let path = format!("/api/v1/{action}");
        let signer = Signer {
            access_key: &self.credentials.access_key,
            secret_key: &self.credentials.secret_key,
            region: &self.credentials.region,
            service: SERVICE,
        };
        let signed = signer.sign_post(&self.host, &path, &payload, chrono::Utc::now());

        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header("Content-Type", "application/json")
            .header("X-Amz-Date", signed.amz_date)
            .header("Authorization", signed.authorization)
            .body(payload)
            .send()
            .await
            .map_err(|e| CloudError::Network(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| CloudError::Network(e.to_string()))?;
        debug!(action, status = status.as_u16(), "provider call finished");

        if !status.is_success() {
            return Err(classify_failure(status.as_u16(), &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| CloudError::InvalidResponse(format!("{action}: {e}")))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorEntry {
    #[serde(default)]
    code: String,
    #[serde(default, rename = "Type")]
    kind: String,
    #[serde(default)]
    details: String,
}

/// Map a non-success response onto [`CloudError`].
fn classify_failure(status: u16, body: &str) -> CloudError {
    let entry = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.errors.into_iter().next());
    let (code, message) = match entry {
        Some(e) => {
            let code = if e.kind.is_empty() { e.code } else { e.kind };
            (code, e.details)
        }
        None => (String::new(), body.to_owned()),
    };
    if status == 404 || code.ends_with("NotFound") {
        return CloudError::NotFound(if message.is_empty() { code } else { message });
    }
    CloudError::Api {
        status,
        code,
        message,
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VolumeResponse {
    volume: ApiVolume,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VolumesResponse {
    #[serde(default)]
    volumes: Vec<ApiVolume>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SnapshotResponse {
    snapshot: ApiSnapshot,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SnapshotsResponse {
    #[serde(default)]
    snapshots: Vec<ApiSnapshot>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VmsResponse {
    #[serde(default)]
    vms: Vec<ApiVm>,
}

/// Responses whose payload the driver ignores.
#[derive(Deserialize)]
struct Ignored {}

#[async_trait]
impl ProviderApi for OscApi {
    async fn create_volume(&self, input: CreateVolumeInput) -> Result<ApiVolume, CloudError> {
        let resp: VolumeResponse = self.call("CreateVolume", &input).await?;
        Ok(resp.volume)
    }

    async fn read_volumes(&self, filter: VolumeFilter) -> Result<Vec<ApiVolume>, CloudError> {
        let resp: VolumesResponse = self
            .call("ReadVolumes", &json!({ "Filters": filter }))
            .await?;
        Ok(resp.volumes)
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), CloudError> {
        let _: Ignored = self
            .call("DeleteVolume", &json!({ "VolumeId": volume_id }))
            .await?;
        Ok(())
    }

    async fn link_volume(
        &self,
        volume_id: &str,
        vm_id: &str,
        device_name: &str,
    ) -> Result<(), CloudError> {
        let _: Ignored = self
            .call(
                "LinkVolume",
                &json!({ "VolumeId": volume_id, "VmId": vm_id, "DeviceName": device_name }),
            )
            .await?;
        Ok(())
    }

    async fn unlink_volume(&self, volume_id: &str) -> Result<(), CloudError> {
        let _: Ignored = self
            .call("UnlinkVolume", &json!({ "VolumeId": volume_id }))
            .await?;
        Ok(())
    }

    async fn update_volume(&self, volume_id: &str, size_gib: u64) -> Result<ApiVolume, CloudError> {
        let resp: VolumeResponse = self
            .call(
                "UpdateVolume",
                &json!({ "VolumeId": volume_id, "Size": size_gib }),
            )
            .await?;
        Ok(resp.volume)
    }

    async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
    ) -> Result<ApiSnapshot, CloudError> {
        let resp: SnapshotResponse = self
            .call(
                "CreateSnapshot",
                &json!({ "VolumeId": volume_id, "Description": description }),
            )
            .await?;
        Ok(resp.snapshot)
    }

    async fn read_snapshots(&self, query: SnapshotQuery) -> Result<SnapshotListing, CloudError> {
        let mut body = json!({ "Filters": query.filter });
        if let Some(n) = query.results_per_page {
            body["ResultsPerPage"] = json!(n);
        }
        if let Some(token) = query.next_page_token {
            body["NextPageToken"] = json!(token);
        }
        let resp: SnapshotsResponse = self.call("ReadSnapshots", &body).await?;
        Ok(SnapshotListing {
            snapshots: resp.snapshots,
            next_page_token: resp.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError> {
        let _: Ignored = self
            .call("DeleteSnapshot", &json!({ "SnapshotId": snapshot_id }))
            .await?;
        Ok(())
    }

    async fn create_tags(
        &self,
        resource_ids: &[String],
        tags: &[ResourceTag],
    ) -> Result<(), CloudError> {
        let _: Ignored = self
            .call(
                "CreateTags",
                &json!({ "ResourceIds": resource_ids, "Tags": tags }),
            )
            .await?;
        Ok(())
    }

    async fn read_vms(&self, vm_ids: &[String]) -> Result<Vec<ApiVm>, CloudError> {
        let resp: VmsResponse = self
            .call("ReadVms", &json!({ "Filters": { "VmIds": vm_ids } }))
            .await?;
        Ok(resp.vms)
    }
}
