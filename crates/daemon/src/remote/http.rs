// JSON-over-HTTPS transport to the central service.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use loam_common::protocol::mutations::{Mutation, MutationResult, SubmitMutationsRequest, SubmitMutationsResponse};
use loam_common::protocol::sync::{PullRequest, PullResponse};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use url::Url;

use super::{MutationRemote, PullSource};
use crate::config::{validate_server_url, EngineConfig};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: Url,
    account_id: String,
    token: String,
}

impl HttpRemote {
    pub fn new(base_url: &str, account_id: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        validate_server_url(base_url)?;
        let base_url = Url::parse(base_url).with_context(|| format!("invalid server url `{base_url}`"))?;
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build().context("failed to build http client")?;
        Ok(Self { client, base_url, account_id: account_id.into(), token: token.into() })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        Self::new(
            config.server_url.as_deref().unwrap_or_default(),
            config.account_id.clone().unwrap_or_default(),
            config.token.clone().unwrap_or_default(),
        )
    }

    /// `{base}/v1/accounts/{account}/{path}`
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow::anyhow!("server url `{}` cannot be a base", self.base_url))?
            .pop_if_empty()
            .extend(["v1", "accounts", self.account_id.as_str()])
            .extend(path.split('/'));
        Ok(url)
    }

    async fn post_json<Req, Res>(&self, path: &str, body: &Req) -> Result<Res>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        debug!(%url, "posting to central service");
        let response = self
            .client
            .post(url.clone())
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to `{url}` failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("central service returned {status} for `{url}`: {body}");
        }
        response.json().await.with_context(|| format!("invalid response body from `{url}`"))
    }
}

impl MutationRemote for HttpRemote {
    async fn submit(&self, batch: Vec<Mutation>) -> Result<Vec<MutationResult>> {
        let request = SubmitMutationsRequest { mutations: batch };
        let response: SubmitMutationsResponse = self.post_json("mutations", &request).await?;
        Ok(response.results)
    }
}

impl PullSource for HttpRemote {
    async fn pull(&self, request: PullRequest) -> Result<PullResponse> {
        self.post_json("sync/pull", &request).await
    }
}
