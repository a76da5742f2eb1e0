use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::SimError;

/// An ERC20 token the simulation touches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSettings {
    pub address: Address,
    pub decimals: u8,
    pub symbol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSettings {
    /// JSON-RPC endpoint of the test network
    pub rpc_url: String,
    /// Gas limit attached to every transaction
    pub tx_gas: u64,
    /// Interval between receipt polls
    pub receipt_poll_ms: u64,
    /// Give up on a receipt after this long; the action counts as reverted
    pub receipt_timeout_ms: u64,
    /// Seconds added to wall-clock time for router deadlines
    pub deadline_secs: i64,
}

impl Default for ChainSettings {
    fn default() -> Self {
        ChainSettings {
            rpc_url: "http://localhost:7545".to_string(),
            tx_gas: 8_000_000,
            receipt_poll_ms: 100,
            receipt_timeout_ms: 30_000,
            deadline_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractSettings {
    pub router: Address,
    pub dao: Address,
    pub usdc: TokenSettings,
    pub xsd: TokenSettings,
    /// Uniswap pair, also the LP token
    pub pair: TokenSettings,
}

impl Default for ContractSettings {
    fn default() -> Self {
        let addr = |s: &str| s.parse::<Address>().unwrap_or_default();
        ContractSettings {
            usdc: TokenSettings {
                address: addr("0x021F7F4D0dBaa9799D6cC8cC798376256F8968C0"),
                decimals: 6,
                symbol: "USDC".to_string(),
            },
            xsd: TokenSettings {
                address: addr("0x1aB22000906234557e3f1D5AddCE882f144B5857"),
                decimals: 18,
                symbol: "xSD".to_string(),
            },
            pair: TokenSettings {
                address: addr("0x5A055657217Bc89636CddE882641D93e7C1A4027"),
                decimals: 18,
                symbol: "UNI".to_string(),
            },
            router: addr("0x7a250d5630B4cF539739dF2C5dAcb4c659F2488D"),
            dao: addr("0xc594404F4F0A6a8F1A4676B601D587733f05e6f8"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// SQLite file shared by all workers; `None` keeps records in memory
    pub path: Option<String>,
    /// A nonce lock older than this is treated as abandoned by a crashed holder
    pub lock_lease_ms: i64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Resends with a bumped nonce before giving up on a submission
    pub max_nonce_retries: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            path: None,
            lock_lease_ms: 60_000,
            backoff_initial_ms: 5,
            backoff_max_ms: 500,
            max_nonce_retries: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Mint a random starting USDC balance up to `max_usdc` on a fresh deployment
    pub mint_on_start: bool,
    pub max_usdc: u64,
    /// Faith bounds, in USDC of xSD market cap
    pub min_faith: f64,
    pub max_faith: f64,
    pub use_faith: bool,
    /// Upper bound of the U(0, x) commitment fraction
    pub max_commitment: f64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        AgentSettings {
            mint_on_start: false,
            max_usdc: 100_000,
            min_faith: 0.5e6,
            max_faith: 1e6,
            use_faith: true,
            max_commitment: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketSettings {
    /// Slippage tolerance for swaps and liquidity, in basis points
    pub slippage_bps: u32,
    /// Minimum xSD in the pool before coupon bids are considered, whole tokens
    pub min_pool_liquidity: u64,
}

impl Default for MarketSettings {
    fn default() -> Self {
        MarketSettings {
            slippage_bps: 100,
            min_pool_liquidity: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaoSettings {
    /// Whether the deployed DAO runs a coupon auction
    pub coupon_auction: bool,
    /// Smallest principal worth bidding, whole xSD
    pub min_coupon_principal: u64,
    /// Bids ask for coupons expiring this many epochs ahead
    pub coupon_expiry_epochs: u64,
    /// Maximum coupon premium over principal, in basis points
    pub max_coupon_premium_bps: u32,
    /// Redeem unexpired coupons for every agent before agents act
    pub redeem_before_actions: bool,
}

impl Default for DaoSettings {
    fn default() -> Self {
        DaoSettings {
            coupon_auction: true,
            min_coupon_principal: 1,
            coupon_expiry_epochs: 90,
            max_coupon_premium_bps: 5_000,
            redeem_before_actions: true,
        }
    }
}

/// Everything a run needs, loadable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub chain: ChainSettings,
    pub contracts: ContractSettings,
    pub store: StoreSettings,
    pub agents: AgentSettings,
    pub market: MarketSettings,
    pub dao: DaoSettings,
}

impl SimConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, SimError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, SimError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, SimError> {
        toml::to_string_pretty(self).map_err(|e| SimError::Config(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), SimError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}
