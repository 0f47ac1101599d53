use bitcoin::{OutPoint, Txid};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed identifier, address, out-of-range vout, or depth above the
    /// hard ceiling. Always raised before any upstream call.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transaction not found: {0}")]
    TxNotFound(Txid),

    /// The node reports the output as spent but no address indexer is
    /// configured to tell us where it went.
    #[error("spend of {0} is not indexed (no address indexer configured)")]
    NotIndexed(OutPoint),

    /// The spender search fetched its maximum number of candidates from the
    /// output's address history without finding the spender.
    #[error("spender of {outpoint} not among the {scanned} history transactions scanned")]
    SpendScanCapped { outpoint: OutPoint, scanned: usize },

    /// An optional collaborator required by the operation is missing.
    #[error("{0} requires an address indexer, none is configured")]
    IndexerRequired(&'static str),

    #[error("upstream unavailable while {context}: {reason}")]
    Unavailable { context: String, reason: String },

    #[error("operation cancelled: {0}")]
    Cancelled(&'static str),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Indexer(#[from] IndexerError),

    #[error("invalid transaction data: {0}")]
    InvalidTxData(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed entity label file.
    #[error("entity labels {file}:{line}: {message}")]
    EntityParse {
        file: String,
        line: usize,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Whether a retry has a reasonable chance of succeeding.
    ///
    /// `TxNotFound` and `InvalidInput` are never transient: they indicate bad
    /// input rather than a flaky upstream.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable { .. } => true,
            Self::Rpc(err) => err.is_transient(),
            Self::Indexer(err) => err.is_transient(),
            Self::Io(_) => true,
            _ => false,
        }
    }

    pub(crate) fn unavailable(context: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            context: context.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("RPC transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("RPC server error {code}: {message}")]
    ServerError { code: i64, message: String },

    #[error("invalid RPC response: {0}")]
    InvalidResponse(String),

    #[error("batch response is missing item with id {id}")]
    MissingBatchItem { id: u64 },
}

impl RpcError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            // -28: node is still warming up (loading block index, verifying).
            Self::ServerError { code, .. } => *code == -28,
            Self::InvalidResponse(_) | Self::MissingBatchItem { .. } => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    #[error("could not connect to indexer at {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("indexer request `{method}` timed out")]
    Timeout { method: String },

    #[error("indexer connection dropped: {0}")]
    ConnectionLost(String),

    #[error("indexer server error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("invalid indexer response: {0}")]
    Protocol(String),
}

impl IndexerError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Timeout { .. } | Self::ConnectionLost(_)
        )
    }
}
