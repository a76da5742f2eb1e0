//! JSON-RPC client for a development node (Ganache, Hardhat, anvil) with
//! unlocked accounts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U256, U64};
use alloy::sol_types::{SolCall, SolEvent};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::trace;

use super::contracts::{self, IDao, IUniswapV2Pair, IUniswapV2Router02, IERC20};
use super::{ChainClient, Receipt, TransferLog, TxRequest};
use crate::error::ChainError;

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    topics: Vec<B256>,
    data: Bytes,
    block_number: U64,
    log_index: U64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    block_number: U64,
    /// Absent on pre-Byzantium nodes
    status: Option<U64>,
}

pub struct RpcChain {
    url: String,
    http: reqwest::blocking::Client,
    next_id: AtomicU64,
}

fn quantity(n: u64) -> String {
    format!("{:#x}", n)
}

fn decode<T: DeserializeOwned>(value: Value, what: &str) -> Result<T, ChainError> {
    serde_json::from_value(value).map_err(|e| ChainError::Decode(format!("{}: {}", what, e)))
}

impl RpcChain {
    pub fn new(url: &str) -> Result<Self, ChainError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(RpcChain {
            url: url.to_string(),
            http,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn request(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        trace!(method, id, "rpc request");

        let resp: RpcResponse = self.http.post(&self.url).json(&body).send()?.json()?;
        if let Some(err) = resp.error {
            return Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }

    fn call_at<C: SolCall>(&self, to: Address, call: C, block: Value) -> Result<C::Return, ChainError> {
        let data = Bytes::from(call.abi_encode());
        let result = self.request("eth_call", json!([{ "to": to, "data": data }, block]))?;
        let raw: Bytes = decode(result, C::SIGNATURE)?;
        contracts::decode_returns::<C>(&raw)
    }

    fn call<C: SolCall>(&self, to: Address, call: C) -> Result<C::Return, ChainError> {
        self.call_at(to, call, json!("latest"))
    }
}

impl ChainClient for RpcChain {
    fn block_number(&self) -> Result<u64, ChainError> {
        let n: U64 = decode(self.request("eth_blockNumber", json!([]))?, "eth_blockNumber")?;
        Ok(n.to::<u64>())
    }

    fn transaction_count(&self, account: Address) -> Result<u64, ChainError> {
        let result = self.request("eth_getTransactionCount", json!([account, "pending"]))?;
        let n: U64 = decode(result, "eth_getTransactionCount")?;
        Ok(n.to::<u64>())
    }

    fn accounts(&self) -> Result<Vec<Address>, ChainError> {
        decode(self.request("eth_accounts", json!([]))?, "eth_accounts")
    }

    fn balance_of(&self, token: Address, owner: Address) -> Result<U256, ChainError> {
        Ok(self.call(token, IERC20::balanceOfCall { owner })?.balance)
    }

    fn balance_of_at(&self, token: Address, owner: Address, block: u64) -> Result<U256, ChainError> {
        let call = IERC20::balanceOfCall { owner };
        Ok(self.call_at(token, call, json!(quantity(block)))?.balance)
    }

    fn total_supply(&self, token: Address) -> Result<U256, ChainError> {
        Ok(self.call(token, IERC20::totalSupplyCall {})?.supply)
    }

    fn decimals(&self, token: Address) -> Result<u8, ChainError> {
        Ok(self.call(token, IERC20::decimalsCall {})?.places)
    }

    fn transfer_logs(
        &self,
        token: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>, ChainError> {
        let filter = json!([{
            "address": token,
            "fromBlock": quantity(from_block),
            "toBlock": quantity(to_block),
            "topics": [IERC20::Transfer::SIGNATURE_HASH],
        }]);
        let entries: Vec<RawLog> = decode(self.request("eth_getLogs", filter)?, "eth_getLogs")?;

        let mut logs = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.topics.len() != 3 {
                // Not an ERC20 Transfer with indexed endpoints
                continue;
            }
            let event = IERC20::Transfer::decode_raw_log(entry.topics.iter().copied(), &entry.data, true)
                .map_err(|e| ChainError::Decode(format!("Transfer log: {}", e)))?;
            logs.push(TransferLog {
                block: entry.block_number.to::<u64>(),
                log_index: entry.log_index.to::<u64>(),
                from: event.from,
                to: event.to,
                value: event.value,
            });
        }
        logs.sort_by_key(|l| (l.block, l.log_index));
        Ok(logs)
    }

    fn get_reserves(&self, pair: Address) -> Result<(U256, U256), ChainError> {
        let r = self.call(pair, IUniswapV2Pair::getReservesCall {})?;
        Ok((
            U256::from(r.reserve0.to::<u128>()),
            U256::from(r.reserve1.to::<u128>()),
        ))
    }

    fn token0(&self, pair: Address) -> Result<Address, ChainError> {
        Ok(self.call(pair, IUniswapV2Pair::token0Call {})?.token)
    }

    fn get_amounts_out(
        &self,
        router: Address,
        amount_in: U256,
        path: &[Address],
    ) -> Result<Vec<U256>, ChainError> {
        let call = IUniswapV2Router02::getAmountsOutCall {
            amountIn: amount_in,
            path: path.to_vec(),
        };
        Ok(self.call(router, call)?.amounts)
    }

    fn epoch(&self, dao: Address) -> Result<u64, ChainError> {
        contracts::to_u64(self.call(dao, IDao::epochCall {})?.current, "epoch")
    }

    fn total_coupons(&self, dao: Address) -> Result<U256, ChainError> {
        Ok(self.call(dao, IDao::totalCouponsCall {})?.coupons)
    }

    fn total_redeemable(&self, dao: Address) -> Result<U256, ChainError> {
        Ok(self.call(dao, IDao::totalRedeemableCall {})?.redeemable)
    }

    fn balance_of_coupons(
        &self,
        dao: Address,
        account: Address,
        epoch: u64,
    ) -> Result<U256, ChainError> {
        let call = IDao::balanceOfCouponsCall {
            account,
            epoch: U256::from(epoch),
        };
        Ok(self.call(dao, call)?.coupons)
    }

    fn coupons_current_assigned_index(
        &self,
        dao: Address,
        account: Address,
    ) -> Result<u64, ChainError> {
        let index = self.call(dao, IDao::getCouponsCurrentAssignedIndexCall { account })?.index;
        contracts::to_u64(index, "coupon index")
    }

    fn coupons_assigned_at_epoch(
        &self,
        dao: Address,
        account: Address,
        index: u64,
    ) -> Result<u64, ChainError> {
        let call = IDao::getCouponsAssignedAtEpochCall {
            account,
            index: U256::from(index),
        };
        contracts::to_u64(self.call(dao, call)?.expiry, "coupon expiry")
    }

    fn balance_of_staged(&self, dao: Address, account: Address) -> Result<U256, ChainError> {
        Ok(self.call(dao, IDao::balanceOfStagedCall { account })?.staged)
    }

    fn send_transaction(&self, tx: &TxRequest) -> Result<String, ChainError> {
        let result = self.request(
            "eth_sendTransaction",
            json!([{
                "from": tx.from,
                "to": tx.to,
                "gas": quantity(tx.gas),
                "nonce": quantity(tx.nonce),
                "data": contracts::calldata(&tx.call),
            }]),
        )?;
        let hash: B256 = decode(result, "eth_sendTransaction")?;
        Ok(format!("{:#x}", hash))
    }

    fn transaction_receipt(&self, tx: &str) -> Result<Option<Receipt>, ChainError> {
        let result = self.request("eth_getTransactionReceipt", json!([tx]))?;
        if result.is_null() {
            return Ok(None);
        }
        let raw: RawReceipt = decode(result, "eth_getTransactionReceipt")?;
        Ok(Some(Receipt {
            tx: tx.to_string(),
            block: raw.block_number.to::<u64>(),
            // A mined receipt without status predates Byzantium and succeeded
            status: raw.status.map_or(true, |s| s == U64::from(1u64)),
        }))
    }
}
