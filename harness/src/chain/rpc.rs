//! Ethereum JSON-RPC implementation of `ChainClient`

use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy_network::eip2718::Encodable2718;
use alloy_network::TxSigner;
use alloy_primitives::{keccak256, Address, TxKind, B256, U256, U64};
use alloy_signer_local::PrivateKeySigner;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ChainClient, TranscoderInfo, TranscoderStatus};
use crate::error::HarnessError;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const RECEIPT_MAX_POLLS: u32 = 120;
const FALLBACK_GAS_LIMIT: u64 = 1_000_000;

/// Wei sent by `fund_account` unless overridden: 100 ETH
pub const DEFAULT_FUNDING_WEI: U256 = U256::from_limbs([0x6bc7_5e2d_6310_0000, 0x5, 0, 0]);

// Word positions in BondingManager tuple returns
const GET_TRANSCODER_REWARD_CUT: usize = 1;
const GET_TRANSCODER_FEE_SHARE: usize = 2;
const GET_DELEGATOR_DELEGATED_AMOUNT: usize = 3;

/// Protocol contract addresses resolved through the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolContracts {
    pub controller: Address,
    pub rounds_manager: Address,
    pub bonding_manager: Address,
    pub token: Address,
    pub token_faucet: Address,
}

#[derive(Debug, Deserialize)]
struct JsonResponseBody {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<JsonError>,
}

#[derive(Debug, Deserialize)]
struct JsonError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionReceipt {
    #[serde(default)]
    status: Option<U64>,
    #[serde(default)]
    block_number: Option<U64>,
}

/// Chain client speaking raw JSON-RPC to a dev chain
///
/// Reads go through `eth_call`. Writes are signed locally by the provisioned
/// account's key, except ETH funding, which is sent from the chain's unlocked
/// coinbase.
pub struct RpcChainClient {
    client: Client,
    url: Url,
    chain_id: u64,
    contracts: ProtocolContracts,
    signer: Option<PrivateKeySigner>,
    funding_amount: U256,
    // Serializes nonce lookup and broadcast for the signer
    send_lock: Mutex<()>,
}

impl RpcChainClient {
    /// Connect to `rpc_url` and resolve protocol contracts through `controller`
    pub async fn connect(
        rpc_url: &str,
        controller: Address,
        signer: Option<PrivateKeySigner>,
    ) -> Result<Self> {
        let url = Url::parse(rpc_url).context("Invalid chain RPC URL")?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        let chain_id: U64 = raw_rpc_request(&client, &url, "eth_chainId", json!([]))
            .await
            .context("Failed to query chain id")?;

        let mut this = Self {
            client,
            url,
            chain_id: chain_id.to::<u64>(),
            contracts: ProtocolContracts {
                controller,
                rounds_manager: Address::ZERO,
                bonding_manager: Address::ZERO,
                token: Address::ZERO,
                token_faucet: Address::ZERO,
            },
            signer,
            funding_amount: DEFAULT_FUNDING_WEI,
            send_lock: Mutex::new(()),
        };

        this.contracts = ProtocolContracts {
            controller,
            rounds_manager: this.lookup_contract("RoundsManager").await?,
            bonding_manager: this.lookup_contract("BondingManager").await?,
            token: this.lookup_contract("LivepeerToken").await?,
            token_faucet: this.lookup_contract("LivepeerTokenFaucet").await?,
        };

        info!(
            chain_id = this.chain_id,
            controller = %controller,
            rounds_manager = %this.contracts.rounds_manager,
            bonding_manager = %this.contracts.bonding_manager,
            "Connected to chain"
        );

        Ok(this)
    }

    /// Wei granted by `fund_account`
    pub fn with_funding_amount(mut self, amount: U256) -> Self {
        self.funding_amount = amount;
        self
    }

    pub fn funding_amount(&self) -> U256 {
        self.funding_amount
    }

    pub fn contracts(&self) -> &ProtocolContracts {
        &self.contracts
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Address of the signing account, if any
    pub fn account(&self) -> Option<Address> {
        self.signer.as_ref().map(|s| s.address())
    }

    async fn rpc_request<D: DeserializeOwned>(&self, method: &str, params: Value) -> Result<D> {
        raw_rpc_request(&self.client, &self.url, method, params).await
    }

    async fn lookup_contract(&self, name: &str) -> Result<Address> {
        let id = keccak256(name.as_bytes());
        let output = self
            .call(
                self.contracts.controller,
                encode_call("getContract(bytes32)", &[id.0]),
            )
            .await
            .with_context(|| format!("Failed to look up {} in controller", name))?;

        let address = decode_address(&output)?;
        if address == Address::ZERO {
            anyhow::bail!("Controller has no registered {} contract", name);
        }
        debug!("Resolved {} at {}", name, address);
        Ok(address)
    }

    /// Read-only contract call against the latest block
    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>> {
        let result: String = self
            .rpc_request(
                "eth_call",
                json!([{ "to": to, "data": format!("0x{}", hex::encode(&data)) }, "latest"]),
            )
            .await?;
        decode_hex(&result)
    }

    /// Sign, broadcast and wait for a transaction from the provisioned account
    async fn send_signed(&self, to: Address, data: Vec<u8>, value: U256) -> Result<B256> {
        let signer = self
            .signer
            .as_ref()
            .context("Chain client has no signing account")?;
        let from = signer.address();

        let _guard = self.send_lock.lock().await;

        let nonce: U64 = self
            .rpc_request("eth_getTransactionCount", json!([from, "pending"]))
            .await
            .context("Failed to query account nonce")?;
        let gas_price: U256 = self
            .rpc_request("eth_gasPrice", json!([]))
            .await
            .context("Failed to query gas price")?;

        let input = format!("0x{}", hex::encode(&data));
        let gas_limit = match self
            .rpc_request::<U64>(
                "eth_estimateGas",
                json!([{ "from": from, "to": to, "data": input, "value": value }]),
            )
            .await
        {
            // Headroom for state changes between estimation and inclusion
            Ok(estimate) => estimate.to::<u64>().saturating_mul(12) / 10,
            Err(e) => {
                warn!("Gas estimation failed, using fallback limit: {}", e);
                FALLBACK_GAS_LIMIT
            }
        };

        let mut tx = TxLegacy {
            chain_id: Some(self.chain_id),
            nonce: nonce.to::<u64>(),
            gas_price: gas_price.saturating_to::<u128>(),
            gas_limit,
            to: TxKind::Call(to),
            value,
            input: data.into(),
        };

        let signature = signer
            .sign_transaction(&mut tx)
            .await
            .context("Failed to sign transaction")?;
        let envelope: TxEnvelope = tx.into_signed(signature).into();
        let raw = envelope.encoded_2718();

        let hash: B256 = self
            .rpc_request(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(raw))]),
            )
            .await
            .context("Failed to broadcast transaction")?;

        debug!("Broadcast transaction {} from {}", hash, from);
        self.wait_for_receipt(hash).await?;
        Ok(hash)
    }

    /// Send from the chain's unlocked coinbase account
    async fn send_from_coinbase(&self, to: Address, value: U256) -> Result<B256> {
        let accounts: Vec<Address> = self
            .rpc_request("eth_accounts", json!([]))
            .await
            .context("Failed to list node accounts")?;
        let coinbase = accounts
            .first()
            .copied()
            .context("Chain node exposes no unlocked accounts")?;

        let hash: B256 = self
            .rpc_request(
                "eth_sendTransaction",
                json!([{ "from": coinbase, "to": to, "value": value }]),
            )
            .await
            .context("Failed to send funding transaction")?;

        self.wait_for_receipt(hash).await?;
        Ok(hash)
    }

    async fn wait_for_receipt(&self, hash: B256) -> Result<()> {
        for _ in 0..RECEIPT_MAX_POLLS {
            let receipt: Option<TransactionReceipt> = self
                .rpc_request("eth_getTransactionReceipt", json!([hash]))
                .await
                .context("Failed to query transaction receipt")?;

            if let Some(receipt) = receipt {
                if receipt.status == Some(U64::ZERO) {
                    return Err(HarnessError::TransactionReverted(hash.to_string()).into());
                }
                debug!(
                    "Transaction {} mined in block {:?}",
                    hash,
                    receipt.block_number.map(|b| b.to::<u64>())
                );
                return Ok(());
            }

            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }

        anyhow::bail!("Transaction {} was not mined in time", hash)
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn current_round(&self) -> Result<U256> {
        let output = self
            .call(
                self.contracts.rounds_manager,
                encode_call("currentRound()", &[]),
            )
            .await
            .context("Failed to query current round")?;
        decode_u256(&output)
    }

    async fn current_round_initialized(&self) -> Result<bool> {
        let output = self
            .call(
                self.contracts.rounds_manager,
                encode_call("currentRoundInitialized()", &[]),
            )
            .await
            .context("Failed to query round initialization")?;
        decode_bool(&output)
    }

    async fn initialize_round(&self) -> Result<()> {
        if self.current_round_initialized().await? {
            debug!("Current round already initialized");
            return Ok(());
        }

        let hash = self
            .send_signed(
                self.contracts.rounds_manager,
                encode_call("initializeRound()", &[]),
                U256::ZERO,
            )
            .await
            .context("Failed to initialize round")?;

        info!("Initialized round (tx {})", hash);
        Ok(())
    }

    async fn fund_account(&self, account: Address) -> Result<()> {
        self.fund_account_with(account, self.funding_amount).await
    }

    async fn balance(&self, account: Address) -> Result<U256> {
        self.rpc_request("eth_getBalance", json!([account, "latest"]))
            .await
            .context("Failed to query balance")
    }

    async fn is_active_transcoder(&self, account: Address) -> Result<bool> {
        let output = self
            .call(
                self.contracts.bonding_manager,
                encode_call("isActiveTranscoder(address)", &[address_word(account)]),
            )
            .await
            .context("Failed to query transcoder status")?;
        decode_bool(&output)
    }

    async fn transcoder_total_stake(&self, account: Address) -> Result<U256> {
        let output = self
            .call(
                self.contracts.bonding_manager,
                encode_call("transcoderTotalStake(address)", &[address_word(account)]),
            )
            .await
            .context("Failed to query transcoder stake")?;
        decode_u256(&output)
    }

    async fn transcoder_info(&self, account: Address) -> Result<TranscoderInfo> {
        let bonding_manager = self.contracts.bonding_manager;
        let arg = [address_word(account)];

        let transcoder = self
            .call(bonding_manager, encode_call("getTranscoder(address)", &arg))
            .await
            .context("Failed to query transcoder record")?;
        let delegator = self
            .call(bonding_manager, encode_call("getDelegator(address)", &arg))
            .await
            .context("Failed to query transcoder's delegator record")?;
        let status = self
            .call(bonding_manager, encode_call("transcoderStatus(address)", &arg))
            .await
            .context("Failed to query transcoder status")?;
        let status_code = decode_u256(&status)?.saturating_to::<u8>();

        Ok(TranscoderInfo {
            status: TranscoderStatus::from_code(status_code)?,
            active: self.is_active_transcoder(account).await?,
            reward_cut: decode_u256_at(&transcoder, GET_TRANSCODER_REWARD_CUT)?,
            fee_share: decode_u256_at(&transcoder, GET_TRANSCODER_FEE_SHARE)?,
            delegated_stake: decode_u256_at(&delegator, GET_DELEGATOR_DELEGATED_AMOUNT)?,
        })
    }
}

impl RpcChainClient {
    /// Send `amount` wei from the coinbase, then request faucet tokens when
    /// `account` is this client's signer
    pub async fn fund_account_with(&self, account: Address, amount: U256) -> Result<()> {
        let hash = self
            .send_from_coinbase(account, amount)
            .await
            .context("Failed to transfer ETH to account")?;
        info!("Funded {} with {} wei (tx {})", account, amount, hash);

        if self.account() != Some(account) {
            warn!(
                "Skipping faucet token request for {}: not the client's signing account",
                account
            );
            return Ok(());
        }

        let hash = self
            .send_signed(self.contracts.token_faucet, encode_call("request()", &[]), U256::ZERO)
            .await
            .context("Failed to request tokens from faucet")?;
        info!("Requested faucet tokens for {} (tx {})", account, hash);

        Ok(())
    }
}

async fn raw_rpc_request<D: DeserializeOwned>(
    client: &Client,
    url: &Url,
    method: &str,
    params: Value,
) -> Result<D> {
    let body = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1
    });

    let response: JsonResponseBody = client
        .post(url.clone())
        .json(&body)
        .send()
        .await
        .with_context(|| format!("Failed to send {} request", method))?
        .error_for_status()?
        .json()
        .await
        .with_context(|| format!("Failed to parse {} response", method))?;

    if let Some(JsonError { code, message }) = response.error {
        return Err(HarnessError::Rpc { code, message }.into());
    }

    serde_json::from_value(response.result)
        .with_context(|| format!("Unexpected {} result shape", method))
}

/// First four bytes of the keccak hash of a function signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// ABI-encode a call whose arguments are all static 32-byte words
pub fn encode_call(signature: &str, words: &[[u8; 32]]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32 * words.len());
    data.extend_from_slice(&selector(signature));
    for word in words {
        data.extend_from_slice(word);
    }
    data
}

pub fn address_word(address: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_slice());
    word
}

fn decode_hex(raw: &str) -> Result<Vec<u8>> {
    hex::decode(raw.trim_start_matches("0x")).context("Invalid hex in call result")
}

fn word_at(output: &[u8], index: usize) -> Result<&[u8]> {
    let start = index * 32;
    output.get(start..start + 32).with_context(|| {
        format!(
            "Call returned {} bytes, expected at least {}",
            output.len(),
            start + 32
        )
    })
}

pub fn decode_u256(output: &[u8]) -> Result<U256> {
    decode_u256_at(output, 0)
}

/// Decode the `index`-th static word of a tuple return
pub fn decode_u256_at(output: &[u8], index: usize) -> Result<U256> {
    Ok(U256::from_be_slice(word_at(output, index)?))
}

pub fn decode_bool(output: &[u8]) -> Result<bool> {
    Ok(!decode_u256(output)?.is_zero())
}

pub fn decode_address(output: &[u8]) -> Result<Address> {
    Ok(Address::from_slice(&word_at(output, 0)?[12..]))
}
