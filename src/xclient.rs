//! The load-balanced client.
//!
//! An [`XClient`] sits above the single-connection [`Client`]: it asks a
//! [`Discovery`] for endpoints, keeps one pooled client per endpoint, and
//! routes calls to the endpoint the selection policy picks. `broadcast`
//! fans a call out to every known endpoint at once and aggregates the
//! results under a shared deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::Client;
use crate::discovery::{Discovery, SelectMode};
use crate::error::{Result, RpcError};
use crate::options::Options;
use crate::server::DEFAULT_HTTP_PATH;

/// A client that balances calls over a discovered set of servers.
pub struct XClient<D: Discovery> {
    discovery: D,
    mode: SelectMode,
    options: Options,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl<D: Discovery> XClient<D> {
    pub fn new(discovery: D, mode: SelectMode, options: Options) -> Self {
        XClient {
            discovery,
            mode,
            options,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Borrows the pooled client for an endpoint, dialing one if the
    /// cache has none. A cached client that went unavailable is closed
    /// and replaced.
    async fn client_for(&self, endpoint: &str) -> Result<Arc<Client>> {
        let mut cache = self.clients.lock().await;
        if let Some(client) = cache.get(endpoint) {
            if client.is_available() {
                return Ok(Arc::clone(client));
            }
            debug!("rpc xclient: evicting dead client for {}", endpoint);
            if let Some(dead) = cache.remove(endpoint) {
                let _ = dead.close().await;
            }
        }
        let client = Arc::new(dial_endpoint(endpoint, self.options.clone()).await?);
        cache.insert(endpoint.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Invokes a method on one endpoint chosen by the selection policy.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_timeout(None, service_method, args).await
    }

    /// [`XClient::call`] with a per-call deadline.
    pub async fn call_timeout<A, R>(
        &self,
        limit: Option<Duration>,
        service_method: &str,
        args: &A,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let endpoint = self.discovery.get(self.mode).await?;
        let client = self.client_for(&endpoint).await?;
        client.call_timeout(limit, service_method, args).await
    }

    /// Invokes a method on every discovered endpoint concurrently.
    ///
    /// The first successful reply wins and is returned; later successes
    /// are discarded. The first failing sub-call cancels the rest and its
    /// error is returned instead. Callers that only care about the side
    /// effects simply ignore the returned value.
    pub async fn broadcast<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned + Send,
    {
        self.broadcast_timeout(None, service_method, args).await
    }

    /// [`XClient::broadcast`] under a shared deadline: the bound covers
    /// the whole fan-out, and expiry cancels every sub-call still in
    /// flight.
    pub async fn broadcast_timeout<A, R>(
        &self,
        limit: Option<Duration>,
        service_method: &str,
        args: &A,
    ) -> Result<R>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned + Send,
    {
        let endpoints = self.discovery.get_all().await?;
        let fanout = async {
            let mut subcalls = FuturesUnordered::new();
            for endpoint in endpoints {
                subcalls.push(async move {
                    // each sub-call decodes into its own fresh reply
                    let client = self.client_for(&endpoint).await?;
                    client.call::<A, R>(service_method, args).await
                });
            }
            let mut winner: Option<R> = None;
            while let Some(result) = subcalls.next().await {
                match result {
                    Ok(reply) => {
                        if winner.is_none() {
                            winner = Some(reply);
                        }
                    }
                    // dropping the set cancels the remaining sub-calls,
                    // which detaches their pending entries
                    Err(e) => return Err(e),
                }
            }
            winner.ok_or(RpcError::NoAvailableServers)
        };
        match limit {
            None => fanout.await,
            Some(d) => match tokio::time::timeout(d, fanout).await {
                Ok(res) => res,
                Err(elapsed) => Err(RpcError::CallFailed(elapsed.to_string())),
            },
        }
    }

    /// Closes and evicts every pooled client.
    pub async fn close(&self) -> Result<()> {
        let mut cache = self.clients.lock().await;
        for (_, client) in cache.drain() {
            let _ = client.close().await;
        }
        Ok(())
    }
}

/// Dials an endpoint string of the form `protocol@addr`. Bare addresses
/// dial plain TCP; `http@` endpoints tunnel through CONNECT first.
async fn dial_endpoint(endpoint: &str, options: Options) -> Result<Client> {
    match endpoint.split_once('@') {
        Some(("http", addr)) => Client::dial_http(addr, DEFAULT_HTTP_PATH, options).await,
        Some(("tcp", addr)) => Client::dial(addr, options).await,
        Some((protocol, _)) => Err(RpcError::Protocol(format!(
            "unsupported endpoint protocol {protocol}"
        ))),
        None => Client::dial(endpoint, options).await,
    }
}
