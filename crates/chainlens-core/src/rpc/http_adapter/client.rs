use std::num::NonZeroUsize;
use std::path::Path;

use async_trait::async_trait;
use bitcoin::{BlockHash, OutPoint, Txid};
use futures::future::try_join_all;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{CoreError, RpcError};
use crate::types::{BlockHeight, TxNode, TxOutput};

use super::super::types::ChainInfo;
use super::super::BitcoinRpc;
use super::credentials::{endpoint_url, Credentials};
use super::decode::{unspent_output, VerboseTx};
use super::envelope::Call;
use super::transport::Transport;

/// Confirmed block hashes whose height we remember.
const HEIGHT_CACHE_ENTRIES: usize = 10_000;

/// Bitcoin Core JSON-RPC client over HTTP(S).
///
/// Transactions are requested at verbosity 2 so inputs arrive with their
/// prevout already attached. Nodes older than v25 ignore the prevout part,
/// and the gateway resolves those inputs itself. Nodes older than v26 omit
/// `blockheight`; the height is then looked up once per block and cached.
pub struct HttpRpcClient {
    transport: Transport,
    heights: Mutex<LruCache<BlockHash, BlockHeight>>,
}

impl HttpRpcClient {
    /// Create a client for an `http://` or `https://` node URL.
    ///
    /// Credentials come from `user` and `pass` when both are given, else
    /// from bitcoind's cookie file, else none are sent. `requests_per_second`
    /// caps outbound HTTP requests and `batch_chunk_size` bounds how many
    /// calls travel in one batch request.
    pub fn new(
        connection: &str,
        user: Option<&str>,
        pass: Option<&str>,
        cookie_file: Option<&Path>,
        requests_per_second: Option<u32>,
        batch_chunk_size: usize,
    ) -> Result<Self, CoreError> {
        let endpoint = endpoint_url(connection)?;
        let credentials = Credentials::resolve(user, pass, cookie_file)?;
        let transport = Transport::new(endpoint, credentials, requests_per_second, batch_chunk_size)?;
        let capacity = NonZeroUsize::new(HEIGHT_CACHE_ENTRIES).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            transport,
            heights: Mutex::new(LruCache::new(capacity)),
        })
    }

    async fn decode_tx(&self, raw: Value) -> Result<TxNode, CoreError> {
        let verbose = VerboseTx::from_reply(raw)?;
        let height = match verbose.block_needing_height() {
            Some(block) => self.block_height(block).await?,
            None => None,
        };
        verbose.into_node(height)
    }

    async fn block_height(&self, block: BlockHash) -> Result<Option<BlockHeight>, CoreError> {
        if let Some(height) = self.heights.lock().get(&block).copied() {
            return Ok(Some(height));
        }

        let header = self
            .transport
            .call(Call::new("getblockheader", vec![json!(block.to_string()), json!(true)]))
            .await?;
        let height = header
            .get("height")
            .and_then(Value::as_u64)
            .and_then(|h| u32::try_from(h).ok())
            .map(BlockHeight);
        if let Some(height) = height {
            debug!(%block, height = height.0, "cached block height");
            self.heights.lock().put(block, height);
        }
        Ok(height)
    }
}

#[async_trait]
impl BitcoinRpc for HttpRpcClient {
    async fn get_transaction(&self, txid: &Txid) -> Result<TxNode, CoreError> {
        let raw = self
            .transport
            .call(raw_tx_call(txid))
            .await
            .map_err(|err| missing_tx_as_not_found(txid, err))?;
        self.decode_tx(raw).await
    }

    async fn get_transactions(&self, txids: &[Txid]) -> Result<Vec<TxNode>, CoreError> {
        let calls: Vec<Call> = txids.iter().map(raw_tx_call).collect();
        let raws = match self.transport.batch(&calls).await {
            Ok(raws) => raws,
            // One unknown txid fails its whole batch; fetching one by one
            // pins the failure on the right txid with a typed error.
            Err(err) => {
                warn!(
                    tx_count = txids.len(),
                    error = %err,
                    "batched getrawtransaction failed; retrying one by one"
                );
                let mut nodes = Vec::with_capacity(txids.len());
                for txid in txids {
                    nodes.push(self.get_transaction(txid).await?);
                }
                return Ok(nodes);
            }
        };
        try_join_all(raws.into_iter().map(|raw| self.decode_tx(raw))).await
    }

    async fn get_tx_out(&self, txid: &Txid, vout: u32) -> Result<Option<TxOutput>, CoreError> {
        let raw = self
            .transport
            .call(utxo_call(&OutPoint::new(*txid, vout)))
            .await?;
        unspent_output(raw)
    }

    async fn get_tx_outs(
        &self,
        outpoints: &[OutPoint],
    ) -> Result<Vec<Option<TxOutput>>, CoreError> {
        let calls: Vec<Call> = outpoints.iter().map(utxo_call).collect();
        self.transport
            .batch(&calls)
            .await?
            .into_iter()
            .map(unspent_output)
            .collect()
    }

    async fn get_block_count(&self) -> Result<u64, CoreError> {
        let raw = self.transport.call(Call::bare("getblockcount")).await?;
        raw.as_u64().ok_or_else(|| {
            RpcError::InvalidResponse(format!("getblockcount answered {raw}")).into()
        })
    }

    async fn get_blockchain_info(&self) -> Result<ChainInfo, CoreError> {
        let raw = self.transport.call(Call::bare("getblockchaininfo")).await?;
        serde_json::from_value(raw)
            .map_err(|e| CoreError::InvalidTxData(format!("getblockchaininfo reply: {e}")))
    }
}

fn raw_tx_call(txid: &Txid) -> Call {
    Call::new("getrawtransaction", vec![json!(txid.to_string()), json!(2)])
}

/// `include_mempool` is set so outputs created by unconfirmed transactions
/// and outputs spent in the mempool are both reported as the node sees them.
fn utxo_call(outpoint: &OutPoint) -> Call {
    Call::new(
        "gettxout",
        vec![json!(outpoint.txid.to_string()), json!(outpoint.vout), json!(true)],
    )
}

/// Bitcoin Core reports an unknown txid as RPC_INVALID_ADDRESS_OR_KEY (-5).
/// That is permanent, so it becomes `TxNotFound` and is never retried.
fn missing_tx_as_not_found(txid: &Txid, err: CoreError) -> CoreError {
    match err {
        CoreError::Rpc(RpcError::ServerError { code: -5, ref message }) => {
            let message = message.to_ascii_lowercase();
            if message.contains("no such") || message.contains("not found") {
                CoreError::TxNotFound(*txid)
            } else {
                err
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;

    use super::*;

    fn txid(byte: u8) -> Txid {
        Txid::from_byte_array([byte; 32])
    }

    fn server_error(code: i64, message: &str) -> CoreError {
        RpcError::ServerError {
            code,
            message: message.to_owned(),
        }
        .into()
    }

    #[test]
    fn unknown_txid_becomes_tx_not_found() {
        let id = txid(1);
        let mapped = missing_tx_as_not_found(
            &id,
            server_error(-5, "No such mempool or blockchain transaction. Use gettransaction for wallet transactions."),
        );
        assert!(matches!(mapped, CoreError::TxNotFound(found) if found == id));
    }

    #[test]
    fn other_failures_pass_through() {
        let id = txid(2);
        assert!(matches!(
            missing_tx_as_not_found(&id, server_error(-5, "Invalid or non-wallet transaction id")),
            CoreError::Rpc(RpcError::ServerError { code: -5, .. })
        ));
        assert!(matches!(
            missing_tx_as_not_found(&id, server_error(-28, "Loading block index...")),
            CoreError::Rpc(RpcError::ServerError { code: -28, .. })
        ));
        assert!(matches!(
            missing_tx_as_not_found(&id, CoreError::InvalidTxData("truncated".into())),
            CoreError::InvalidTxData(_)
        ));
    }

    #[test]
    fn calls_request_prevouts_and_mempool_view() {
        let id = txid(3);
        assert_eq!(raw_tx_call(&id).params, vec![json!(id.to_string()), json!(2)]);
        assert_eq!(
            utxo_call(&OutPoint::new(id, 4)).params,
            vec![json!(id.to_string()), json!(4), json!(true)]
        );
    }

    #[test]
    fn construction_validates_before_connecting() {
        let err = HttpRpcClient::new("http://127.0.0.1:18443", Some("u"), None, None, None, 10)
            .err()
            .expect("partial credentials rejected");
        assert!(matches!(err, CoreError::Config(_)));
        assert!(HttpRpcClient::new("ftp://127.0.0.1", None, None, None, None, 10).is_err());
        assert!(HttpRpcClient::new("http://127.0.0.1:18443", None, None, None, None, 0).is_err());
    }
}
