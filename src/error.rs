use thiserror::Error;

use crate::address::Address;

/// Errors from fixed-point balance arithmetic. Always fatal to the operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalanceError {
    #[error("scale mismatch: {left} decimals vs {right} decimals")]
    ScaleMismatch { left: u8, right: u8 },
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    #[error("arithmetic overflow")]
    Overflow,
    #[error("arithmetic underflow")]
    Underflow,
    #[error("division by zero")]
    DivisionByZero,
    #[error("cannot parse token amount {input:?}: {reason}")]
    Parse { input: String, reason: String },
}

/// Errors at the RPC boundary.
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("cannot decode node response: {0}")]
    Decode(String),
}

impl ChainError {
    /// Node rejections that are resolved by resending with the next nonce.
    pub fn is_nonce_conflict(&self) -> bool {
        match self {
            ChainError::Rpc { message, .. } => {
                let message = message.to_ascii_lowercase();
                message.contains("nonce too low")
                    || message.contains("replacement transaction underpriced")
            }
            _ => false,
        }
    }

    pub fn is_revert(&self) -> bool {
        match self {
            ChainError::Rpc { message, .. } => message.to_ascii_lowercase().contains("revert"),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(e: reqwest::Error) -> Self {
        ChainError::Transport(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("corrupt record for {account}: {reason}")]
    Corrupt { account: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval of {spender} by {owner} on {token} reverted in tx {tx}")]
    Reverted {
        token: Address,
        owner: Address,
        spender: Address,
        tx: String,
    },
    #[error("approval submission failed: {0}")]
    Submit(#[source] Box<ActionError>),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApprovalError {
    /// A failed submission is as severe as whatever made it fail.
    pub fn severity(&self) -> Severity {
        match self {
            ApprovalError::Reverted { .. } => Severity::Recoverable,
            ApprovalError::Submit(inner) => inner.severity(),
            ApprovalError::Store(_) => Severity::Fatal,
        }
    }
}

/// How the step loop should treat a failed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The agent does not act this step; the run continues.
    Recoverable,
    /// The run cannot continue.
    Fatal,
}

/// Failure of a single chain-mutating action.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("transaction {tx} reverted")]
    Reverted { tx: String },
    #[error("no receipt for {tx} after {waited_ms}ms")]
    ReceiptTimeout { tx: String, waited_ms: u64 },
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error(transparent)]
    Balance(#[from] BalanceError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ActionError {
    pub fn severity(&self) -> Severity {
        match self {
            ActionError::Reverted { .. }
            | ActionError::ReceiptTimeout { .. }
            | ActionError::Precondition(_) => Severity::Recoverable,
            ActionError::Approval(e) => e.severity(),
            ActionError::Chain(ChainError::Rpc { .. }) => Severity::Recoverable,
            ActionError::Chain(_) | ActionError::Balance(_) | ActionError::Store(_) => {
                Severity::Fatal
            }
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.severity() == Severity::Recoverable
    }
}

/// Run-level failures.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("config: {0}")]
    Config(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Balance(#[from] BalanceError),
    #[error("fatal action failure: {0}")]
    Action(#[from] ActionError),
}

impl From<toml::de::Error> for SimError {
    fn from(e: toml::de::Error) -> Self {
        SimError::Config(e.to_string())
    }
}
