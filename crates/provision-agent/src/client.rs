//! HTTP implementation of [`AgentApi`]

use crate::api::{AgentApi, JobAction, JobPlan, Predicate, WaitOutcome};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use provision_models::{Job, Machine, ModelError, Stage};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How often `wait_for` re-reads the machine
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Talks to the provisioning server's REST API
#[derive(Clone)]
pub struct HttpApi {
    client: Client,
    endpoint: String,
    token: Option<String>,
    poll_interval: Duration,
}

impl HttpApi {
    /// `endpoint` is the API root, e.g. `https://10.0.0.1:8092/api/v3`
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
            poll_interval: POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = self.url(path);
        debug!(method = %method, url = %url, "API request");
        let req = self.client.request(method, url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder, model: &str, key: &str) -> Result<T> {
        let response = req.send().await?;
        let response = check(response, model, key).await?;
        Ok(response.json().await?)
    }

    async fn patch<T: Serialize + DeserializeOwned>(&self, path: &str, old: &T, new: &T, model: &str, key: &str) -> Result<T> {
        let patch = json_patch::diff(&serde_json::to_value(old)?, &serde_json::to_value(new)?);
        let body = serde_json::to_vec(&patch)?;
        let req = self
            .request(Method::PATCH, path)
            .header(reqwest::header::CONTENT_TYPE, "application/json-patch+json")
            .body(body);
        self.send(req, model, key).await
    }
}

/// Turn a non-success response into an [`AgentError::Api`]
async fn check(response: Response, model: &str, key: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let error = serde_json::from_str::<ModelError>(&body).unwrap_or_else(|_| {
        ModelError::new(status.as_u16(), status.as_str(), model, key).with(body)
    });
    Err(AgentError::Api {
        status: status.as_u16(),
        error,
    })
}

#[async_trait]
impl AgentApi for HttpApi {
    async fn get_machine(&self, uuid: &str) -> Result<Machine> {
        let req = self.request(Method::GET, &format!("machines/{}", uuid));
        self.send(req, "machines", uuid).await
    }

    async fn patch_machine(&self, old: &Machine, new: &Machine) -> Result<Machine> {
        let key = old.uuid.to_string();
        self.patch(&format!("machines/{}", key), old, new, "machines", &key).await
    }

    async fn get_job(&self, uuid: &str) -> Result<Option<Job>> {
        let req = self.request(Method::GET, &format!("jobs/{}", uuid));
        match self.send(req, "jobs", uuid).await {
            Ok(job) => Ok(Some(job)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn patch_job(&self, old: &Job, new: &Job) -> Result<Job> {
        let key = old.uuid.to_string();
        self.patch(&format!("jobs/{}", key), old, new, "jobs", &key).await
    }

    async fn get_stage(&self, name: &str) -> Result<Stage> {
        let req = self.request(Method::GET, &format!("stages/{}", name));
        self.send(req, "stages", name).await
    }

    async fn change_stage_map(&self, machine: &Machine) -> Result<BTreeMap<String, String>> {
        let key = machine.uuid.to_string();
        let req = self
            .request(Method::GET, &format!("machines/{}/params/change-stage/map", key))
            .query(&[("aggregate", "true")]);
        match self.send::<Option<BTreeMap<String, String>>>(req, "machines", &key).await {
            Ok(map) => Ok(map.unwrap_or_default()),
            Err(e) if e.is_not_found() => Ok(BTreeMap::new()),
            Err(e) => Err(e),
        }
    }

    async fn next_boot_pxe(&self, machine: &Machine) -> Result<()> {
        let key = machine.uuid.to_string();
        let path = format!("machines/{}/actions/nextbootpxe", key);
        let probe = self.request(Method::GET, &path).send().await?;
        if !probe.status().is_success() {
            debug!(machine = %key, status = %probe.status(), "nextbootpxe action not available");
            return Ok(());
        }
        let req = self.request(Method::POST, &path).json(&serde_json::json!({}));
        let response = req.send().await?;
        check(response, "machines", &key).await?;
        Ok(())
    }

    async fn wait_for(
        &self,
        machine: &Machine,
        pred: &Predicate,
        timeout: Duration,
    ) -> Result<(WaitOutcome, Machine)> {
        let key = machine.uuid.to_string();
        let deadline = Instant::now() + timeout;
        let mut latest = machine.clone();
        let interrupted = tokio::signal::ctrl_c();
        tokio::pin!(interrupted);
        loop {
            match self.get_machine(&key).await {
                Ok(m) => latest = m,
                Err(e) if e.is_not_found() => {
                    return Err(AgentError::Wait(format!("machine {} is gone", key)));
                }
                Err(e) => warn!(machine = %key, error = %e, "failed to read machine while waiting"),
            }
            if pred.matches_machine(&latest) {
                return Ok((WaitOutcome::Complete, latest));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok((WaitOutcome::Timeout, latest));
            }
            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = &mut interrupted => return Ok((WaitOutcome::Interrupt, latest)),
            }
        }
    }

    async fn next_job(&self, machine: &Machine) -> Result<Option<JobPlan>> {
        let key = machine.uuid.to_string();
        let body = serde_json::json!({ "Machine": key });
        let response = self.request(Method::POST, "jobs").json(&body).send().await?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::ACCEPTED => return Ok(None),
            _ => {}
        }
        let job: Job = check(response, "jobs", "").await?.json().await?;
        let job_key = job.uuid.to_string();
        let req = self.request(Method::GET, &format!("jobs/{}/actions", job_key));
        let actions: Vec<JobAction> = match self.send(req, "jobs", &job_key).await {
            Ok(actions) => actions,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        Ok(Some(JobPlan::new(job, actions)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let api = HttpApi::new("https://10.0.0.1:8092/api/v3/", Some("t0k3n".to_string())).unwrap();
        assert_eq!(api.url("machines/abc"), "https://10.0.0.1:8092/api/v3/machines/abc");
        assert_eq!(api.url("/jobs"), "https://10.0.0.1:8092/api/v3/jobs");
    }
}
