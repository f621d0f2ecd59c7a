//! Client for the Godot asset library REST API.

mod types;

pub use types::{
    AssetQueryParams, AssetRecord, AssetType, DEFAULT_MAX_RESULTS, SortKey, SupportLevel,
};

use serde::de::DeserializeOwned;

use crate::config::RemoteSource;
use crate::error::{GdpmError, Result};
use crate::http::{HttpClient, RequestParams};
use crate::ui::prelude::*;

const ASSET_LIST_PATH: &str = "asset";
const ASSET_TEMPLATE: &str = "asset/{id}";

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

pub fn list_url(base: &str, params: &AssetQueryParams) -> String {
    format!("{}?{}", join_url(base, ASSET_LIST_PATH), params.to_query_string())
}

pub fn asset_url(base: &str, asset_id: &str) -> String {
    join_url(
        base,
        &ASSET_TEMPLATE.replace("{id}", &urlencoding::encode(asset_id)),
    )
}

#[derive(Debug, Clone)]
pub struct AssetClient {
    http: HttpClient,
    params: RequestParams,
}

impl AssetClient {
    pub fn new(http: HttpClient, params: RequestParams) -> Self {
        Self { http, params }
    }

    fn params_for(&self, remote: &RemoteSource) -> RequestParams {
        let mut params = self.params.clone();
        if let Some(token) = remote.token.as_deref().filter(|t| !t.is_empty()) {
            params = params.header("Authorization", format!("Bearer {token}"));
        }
        params
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        remote: &RemoteSource,
        url: &str,
        envelope_key: Option<&str>,
    ) -> Result<T> {
        let response = self.http.get(url, &self.params_for(remote)).await;
        if let Some(cause) = response.failure() {
            return Err(GdpmError::Network {
                url: url.to_string(),
                cause,
            });
        }

        if self.params.verbose > 1 {
            emit(
                Level::Debug,
                "rest_api.body",
                &format!("JSON response from {url}:\n{}", response.body),
                None,
            );
        }

        parse_body(url, &response.body, envelope_key)
    }

    /// Search the asset list of `remote`
    pub async fn list_assets(
        &self,
        remote: &RemoteSource,
        params: &AssetQueryParams,
    ) -> Result<Vec<AssetRecord>> {
        if params.max_results == 0 {
            return Ok(Vec::new());
        }
        let url = list_url(&remote.url, params);
        let page: types::AssetListPage = self.get_json(remote, &url, Some("result")).await?;
        Ok(page.result)
    }

    /// Fetch the full record (including download URL) of one asset
    pub async fn get_asset(&self, remote: &RemoteSource, asset_id: &str) -> Result<AssetRecord> {
        let url = asset_url(&remote.url, asset_id);
        self.get_json(remote, &url, None).await
    }

    pub async fn register_account(&self, _username: &str, _password: &str, _email: &str) -> Result<()> {
        Err(GdpmError::NotImplemented("account registration"))
    }

    pub async fn login(&self, _username: &str, _password: &str) -> Result<()> {
        Err(GdpmError::NotImplemented("login"))
    }

    pub async fn logout(&self) -> Result<()> {
        Err(GdpmError::NotImplemented("logout"))
    }

    pub async fn delete_asset(&self, _asset_id: &str) -> Result<()> {
        Err(GdpmError::NotImplemented("asset deletion"))
    }

    pub async fn undelete_asset(&self, _asset_id: &str) -> Result<()> {
        Err(GdpmError::NotImplemented("asset restoration"))
    }

    pub async fn set_support_level(&self, _asset_id: &str, _level: SupportLevel) -> Result<()> {
        Err(GdpmError::NotImplemented("support level moderation"))
    }

    pub async fn review_asset_edit(&self, _edit_id: &str) -> Result<()> {
        Err(GdpmError::NotImplemented("asset edit review"))
    }
}

fn parse_body<T: DeserializeOwned>(url: &str, body: &str, envelope_key: Option<&str>) -> Result<T> {
    let malformed = |reason: String| GdpmError::RemoteMalformed {
        url: url.to_string(),
        reason,
    };

    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| malformed(format!("invalid JSON: {e}")))?;
    let Some(object) = value.as_object() else {
        return Err(malformed("expected a JSON object".to_string()));
    };
    if let Some(key) = envelope_key {
        match object.get(key) {
            Some(serde_json::Value::Array(_)) => {}
            Some(_) => return Err(malformed(format!("`{key}` is not an array"))),
            None => return Err(malformed(format!("missing `{key}`"))),
        }
    }

    serde_json::from_value(value).map_err(|e| malformed(e.to_string()))
}
