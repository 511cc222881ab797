use super::{
    join_path, path_segments, RemoteStore, Result, Snapshot, StoreError, Subscription,
};
use crate::config::StoreConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Adapter over a realtime-database REST endpoint.
///
/// Nodes are addressed as `{base_url}/{path}.json`. Subscriptions are a
/// refresh loop: the collection is fetched on every tick and delivered only
/// when it differs from the last delivered snapshot. A failed fetch leaves the
/// last snapshot in place and the loop simply tries again on the next tick.
#[derive(Clone)]
pub struct RestStore {
    base_url: String,
    auth_token: Option<String>,
    refresh_interval: Duration,
    client: reqwest::Client,
}

impl RestStore {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self> {
        Self::with_timing(
            base_url,
            auth_token,
            Duration::from_millis(2000),
            Duration::from_secs(15),
        )
    }

    pub fn with_timing(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        refresh_interval: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(StoreError::Unavailable("store base url is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            base_url,
            auth_token,
            refresh_interval,
            client,
        })
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| StoreError::Unavailable("store.base_url not configured".into()))?;
        Self::with_timing(
            base_url,
            config.auth_token.clone(),
            Duration::from_millis(config.refresh_interval_ms),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("PINLOCK_STORE_URL")
            .map_err(|_| StoreError::Unavailable("PINLOCK_STORE_URL not set".into()))?;
        let auth_token = std::env::var("PINLOCK_STORE_AUTH").ok().filter(|t| !t.is_empty());
        Self::new(base_url, auth_token)
    }

    fn node_url(&self, path: &str) -> Result<String> {
        let segments = path_segments(path)?;
        Ok(format!("{}/{}.json", self.base_url, segments.join("/")))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.auth_token {
            Some(token) => builder.query(&[("auth", token.as_str())]),
            None => builder,
        }
    }

    async fn fetch(&self, path: &str) -> Result<Option<Value>> {
        let url = self.node_url(path)?;
        let response = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Status {
                status: response.status().as_u16(),
                path: path.to_string(),
            });
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        Ok(match value {
            Value::Null => None,
            other => Some(other),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let url = self.node_url(path)?;
        let response = self
            .request(reqwest::Method::DELETE, &url)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Status {
                status: response.status().as_u16(),
                path: path.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for RestStore {
    fn name(&self) -> &str {
        "rest"
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription> {
        path_segments(path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.clone();
        let path = path.trim_matches('/').to_string();

        let handle = tokio::spawn(async move {
            let mut last: Option<Snapshot> = None;
            let mut timer = interval(store.refresh_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                timer.tick().await;

                match store.fetch(&path).await {
                    Ok(value) => {
                        let snapshot = Snapshot::from_value(path.clone(), value.as_ref());
                        if last.as_ref() == Some(&snapshot) {
                            continue;
                        }
                        if tx.send(snapshot.clone()).is_err() {
                            break;
                        }
                        last = Some(snapshot);
                    }
                    Err(e) => {
                        log::warn!("rest store: refresh of {path} failed, keeping last snapshot: {e}");
                    }
                }

                if tx.is_closed() {
                    break;
                }
            }
        });

        let abort = handle.abort_handle();
        Ok(Subscription::new(rx, move || abort.abort()))
    }

    async fn read_value(&self, path: &str) -> Result<Option<Value>> {
        self.fetch(path).await
    }

    async fn write_value(&self, path: &str, value: Value) -> Result<()> {
        let url = self.node_url(path)?;
        let response = self
            .request(reqwest::Method::PUT, &url)
            .json(&value)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Status {
                status: response.status().as_u16(),
                path: path.to_string(),
            });
        }
        Ok(())
    }

    async fn remove_matching(&self, path: &str, field: &str, value: &str) -> Result<usize> {
        let children = Snapshot::from_value(path, self.fetch(path).await?.as_ref());
        let matching: Vec<String> = children
            .records()
            .filter(|(_, record)| record.get(field).and_then(Value::as_str) == Some(value))
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = 0;
        for key in matching {
            self.delete(&join_path(path, &key)).await?;
            log::debug!("rest store: removed {path}/{key} ({field} = {value})");
            removed += 1;
        }
        Ok(removed)
    }
}
