//! HTTP delivery of JSON-RPC calls: auth, throttling, id allocation and
//! batch reassembly.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::try_join_all;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{CoreError, RpcError};

use super::credentials::Credentials;
use super::envelope::{Call, Envelope, Reply};

pub(super) struct Transport {
    http: reqwest::Client,
    endpoint: Url,
    credentials: Option<Credentials>,
    /// One permit per HTTP request, so a batch costs the same as a call.
    throttle: Option<DefaultDirectRateLimiter>,
    max_batch: usize,
    next_id: AtomicU64,
}

impl Transport {
    pub(super) fn new(
        endpoint: Url,
        credentials: Option<Credentials>,
        requests_per_second: Option<u32>,
        max_batch: usize,
    ) -> Result<Self, CoreError> {
        if max_batch == 0 {
            return Err(CoreError::Config("rpc batch size must be at least 1".to_owned()));
        }
        let throttle = requests_per_second
            .map(|rate| {
                NonZeroU32::new(rate)
                    .map(|rate| RateLimiter::direct(Quota::per_second(rate)))
                    .ok_or_else(|| {
                        CoreError::Config("rpc requests per second must be at least 1".to_owned())
                    })
            })
            .transpose()?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| CoreError::Config(format!("cannot build rpc http client: {e}")))?;

        Ok(Self {
            http,
            endpoint,
            credentials,
            throttle,
            max_batch,
            next_id: AtomicU64::new(1),
        })
    }

    pub(super) async fn call(&self, call: Call) -> Result<Value, CoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(rpc.id = id, rpc.method = call.method, rpc.params = call.params.len(), "rpc call");
        let reply: Reply = self.exchange(&Envelope::wrap(id, &call), call.method).await?;
        reply.into_result()
    }

    /// Run `calls` as JSON-RPC batches of at most `max_batch` entries each,
    /// sent concurrently. Results come back in call order.
    pub(super) async fn batch(&self, calls: &[Call]) -> Result<Vec<Value>, CoreError> {
        let chunks = calls.chunks(self.max_batch).map(|chunk| self.batch_once(chunk));
        let results = try_join_all(chunks).await?;
        Ok(results.into_iter().flatten().collect())
    }

    async fn batch_once(&self, calls: &[Call]) -> Result<Vec<Value>, CoreError> {
        let first = self.next_id.fetch_add(calls.len() as u64, Ordering::Relaxed);
        let envelopes: Vec<Envelope<'_>> = (first..)
            .zip(calls)
            .map(|(id, call)| Envelope::wrap(id, call))
            .collect();
        debug!(rpc.first_id = first, rpc.batch = calls.len(), "rpc batch");

        let replies: Vec<Reply> = self.exchange(&envelopes, "batch").await?;
        let mut by_id = HashMap::with_capacity(replies.len());
        for reply in replies {
            by_id.insert(reply.id()?, reply);
        }

        (first..first + calls.len() as u64)
            .map(|id| {
                by_id
                    .remove(&id)
                    .ok_or(RpcError::MissingBatchItem { id })?
                    .into_result()
            })
            .collect()
    }

    /// POST `body` and decode the reply. Bitcoin Core answers JSON-RPC
    /// failures with a 4xx/5xx status and a JSON body, so only an
    /// authentication refusal (empty body) is decided on status alone.
    async fn exchange<B, R>(&self, body: &B, label: &str) -> Result<R, CoreError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if let Some(throttle) = &self.throttle {
            throttle.until_ready().await;
        }

        let mut request = self.http.post(self.endpoint.clone()).json(body);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.user, Some(&creds.password));
        }
        let response = request.send().await.map_err(RpcError::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(RpcError::Transport)?;
        trace!(rpc.label = label, %status, body = %text, "rpc reply");

        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(RpcError::InvalidResponse(format!(
                "HTTP status {status}: node rejected the rpc credentials"
            ))
            .into());
        }
        serde_json::from_str(&text).map_err(|e| {
            RpcError::InvalidResponse(format!("{label} reply ({status}) is not JSON-RPC: {e}"))
                .into()
        })
    }
}
