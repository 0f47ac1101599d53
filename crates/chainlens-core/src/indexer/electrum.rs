use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::error::{CoreError, IndexerError};

use super::{AddressIndexer, Balance, HistoryEntry, ScriptHash, ServerVersion, UnspentEntry};

const CLIENT_NAME: &str = concat!("chainlens/", env!("CARGO_PKG_VERSION"));
const PROTOCOL_VERSION: &str = "1.4";

/// Connection settings for an Electrum-protocol server (electrs, Fulcrum,
/// ElectrumX) reachable over plain TCP.
#[derive(Debug, Clone)]
pub struct ElectrumConfig {
    /// `host:port`.
    pub addr: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl ElectrumConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
        }
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Newline-delimited JSON-RPC client for the Electrum protocol.
///
/// Requests are serialized over one TCP connection. A broken or timed-out
/// connection is dropped and re-established on the next call; retrying the
/// failed call itself is the gateway's job.
pub struct ElectrumClient {
    config: ElectrumConfig,
    conn: Mutex<Option<Connection>>,
    next_id: AtomicU64,
}

#[derive(serde::Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Vec<serde_json::Value>,
}

#[derive(serde::Deserialize)]
struct Response {
    id: Option<serde_json::Value>,
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
}

impl ElectrumClient {
    /// Connect and negotiate the protocol version. Fails fast so a
    /// misconfigured indexer address is reported at startup.
    pub async fn connect(config: ElectrumConfig) -> Result<Self, CoreError> {
        let client = Self {
            config,
            conn: Mutex::new(None),
            next_id: AtomicU64::new(1),
        };
        let version = client.server_version().await?;
        info!(
            indexer.addr = %client.config.addr,
            indexer.software = %version.software,
            indexer.protocol = %version.protocol,
            "connected to electrum server"
        );
        Ok(client)
    }

    async fn open(&self) -> Result<Connection, IndexerError> {
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.addr),
        )
        .await
        .map_err(|_| IndexerError::Connect {
            addr: self.config.addr.clone(),
            reason: "connect timed out".into(),
        })?
        .map_err(|e| IndexerError::Connect {
            addr: self.config.addr.clone(),
            reason: e.to_string(),
        })?;
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        Ok(Connection {
            reader: BufReader::new(read),
            writer: write,
        })
    }

    async fn call(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, CoreError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(IndexerError::ConnectionLost("no connection".into()).into());
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(indexer.id = id, indexer.method = method, "electrum call");

        let outcome = tokio::time::timeout(
            self.config.request_timeout,
            exchange(conn, id, method, params),
        )
        .await;
        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => {
                if err.is_transient() {
                    warn!(indexer.method = method, error = %err, "dropping electrum connection");
                    *guard = None;
                }
                Err(err.into())
            }
            Err(_) => {
                *guard = None;
                Err(IndexerError::Timeout {
                    method: method.to_owned(),
                }
                .into())
            }
        }
    }

    async fn call_typed<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<T, CoreError> {
        let raw = self.call(method, params).await?;
        serde_json::from_value(raw).map_err(|e| {
            IndexerError::Protocol(format!("unexpected `{method}` result shape: {e}")).into()
        })
    }
}

/// Write one request line and read lines until the matching response.
/// Subscription notifications (no `id`) are skipped.
async fn exchange(
    conn: &mut Connection,
    id: u64,
    method: &str,
    params: Vec<serde_json::Value>,
) -> Result<serde_json::Value, IndexerError> {
    let mut line = serde_json::to_vec(&Request {
        jsonrpc: "2.0",
        id,
        method,
        params,
    })
    .map_err(|e| IndexerError::Protocol(format!("encode request: {e}")))?;
    line.push(b'\n');
    conn.writer
        .write_all(&line)
        .await
        .map_err(|e| IndexerError::ConnectionLost(e.to_string()))?;

    let mut buf = String::new();
    loop {
        buf.clear();
        let read = conn
            .reader
            .read_line(&mut buf)
            .await
            .map_err(|e| IndexerError::ConnectionLost(e.to_string()))?;
        if read == 0 {
            return Err(IndexerError::ConnectionLost("server closed connection".into()));
        }
        trace!(indexer.id = id, body = %buf.trim_end(), "electrum line");

        let response: Response = serde_json::from_str(&buf)
            .map_err(|e| IndexerError::Protocol(format!("decode response line: {e}")))?;
        match response.id.as_ref().and_then(serde_json::Value::as_u64) {
            Some(got) if got == id => {}
            Some(other) => {
                debug!(indexer.id = id, stale_id = other, "skipping stale electrum response");
                continue;
            }
            None => continue,
        }

        if let Some(err) = response.error {
            return Err(parse_server_error(err));
        }
        return Ok(response.result.unwrap_or(serde_json::Value::Null));
    }
}

fn parse_server_error(err: serde_json::Value) -> IndexerError {
    #[derive(serde::Deserialize)]
    struct ServerError {
        code: i64,
        message: String,
    }

    match serde_json::from_value::<ServerError>(err.clone()) {
        Ok(parsed) => IndexerError::Server {
            code: parsed.code,
            message: parsed.message,
        },
        // Some servers send a bare string.
        Err(_) => IndexerError::Server {
            code: 0,
            message: err.as_str().map_or_else(|| err.to_string(), str::to_owned),
        },
    }
}

#[async_trait]
impl AddressIndexer for ElectrumClient {
    async fn get_history(&self, scripthash: &ScriptHash) -> Result<Vec<HistoryEntry>, CoreError> {
        self.call_typed(
            "blockchain.scripthash.get_history",
            vec![serde_json::json!(scripthash.to_string())],
        )
        .await
    }

    async fn list_unspent(
        &self,
        scripthash: &ScriptHash,
    ) -> Result<Vec<UnspentEntry>, CoreError> {
        self.call_typed(
            "blockchain.scripthash.listunspent",
            vec![serde_json::json!(scripthash.to_string())],
        )
        .await
    }

    async fn get_balance(&self, scripthash: &ScriptHash) -> Result<Balance, CoreError> {
        self.call_typed(
            "blockchain.scripthash.get_balance",
            vec![serde_json::json!(scripthash.to_string())],
        )
        .await
    }

    async fn server_version(&self) -> Result<ServerVersion, CoreError> {
        let (software, protocol): (String, String) = self
            .call_typed(
                "server.version",
                vec![
                    serde_json::json!(CLIENT_NAME),
                    serde_json::json!(PROTOCOL_VERSION),
                ],
            )
            .await?;
        Ok(ServerVersion { software, protocol })
    }
}
