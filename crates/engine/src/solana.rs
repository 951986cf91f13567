//! # Solana JSON-RPC Adapter
//!
//! Implements [`ChainQuery`], [`TransferSubmitter`] and [`TokenBalanceOracle`]
//! against a Solana JSON-RPC endpoint.
//!
//! | Operation | RPC method |
//! |-----------|------------|
//! | transaction lookup | `getTransaction` (jsonParsed, confirmed) |
//! | token balance | `getTokenAccountsByOwner` (jsonParsed, summed) |
//! | payout | `getLatestBlockhash` + `sendTransaction` (base64) |
//! | settlement | `getSignatureStatuses` |
//! | admin balance | `getBalance` |
//!
//! Payout transactions are built and signed locally: a legacy message with a
//! single System Program `Transfer` instruction. The signature is the
//! transaction id, so it is known before the network sees anything. When
//! the send request fails at transport level the signature is still
//! returned and settlement polling decides the outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use rapidpot_common::Lamports;

use crate::chain::{
    ChainClientError, ChainQuery, ObservedTransaction, ObservedTransfer, PreparedTransfer,
    SettlementStatus, TokenBalanceOracle, TransferSubmitter,
};

/// Length of an ed25519 public key / Solana address.
pub const ADDRESS_LEN: usize = 32;
/// Length of an ed25519 signature / Solana transaction id.
pub const SIGNATURE_LEN: usize = 64;

/// The System Program id is the all-zero key.
const SYSTEM_PROGRAM_ID: [u8; ADDRESS_LEN] = [0u8; ADDRESS_LEN];

/// System Program instruction index of `Transfer`.
const SYSTEM_TRANSFER_INDEX: u32 = 2;

// ════════════════════════════════════════════════════════════════════════════════
// ADDRESSES & KEYPAIRS
// ════════════════════════════════════════════════════════════════════════════════

/// Decodes a base58 address into its 32 raw bytes.
pub fn decode_address(address: &str) -> Result<[u8; ADDRESS_LEN], ChainClientError> {
    let bytes = bs58::decode(address)
        .into_vec()
        .map_err(|_| ChainClientError::InvalidAddress(address.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| ChainClientError::InvalidAddress(address.to_string()))
}

pub fn is_valid_address(address: &str) -> bool {
    decode_address(address).is_ok()
}

/// `true` for a base58 string decoding to exactly 64 bytes.
pub fn is_valid_signature(reference: &str) -> bool {
    matches!(bs58::decode(reference).into_vec(), Ok(bytes) if bytes.len() == SIGNATURE_LEN)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeypairError {
    #[error("keypair is not a JSON byte array: {0}")]
    Malformed(String),

    #[error("keypair must be {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },

    #[error("keypair public half does not match its secret half")]
    Mismatch,
}

/// The admin keypair that signs payouts.
pub struct PayoutKeypair {
    signing: SigningKey,
}

impl PayoutKeypair {
    /// Parses the 64-byte `[secret(32) | public(32)]` JSON array format.
    pub fn from_json(raw: &str) -> Result<Self, KeypairError> {
        let bytes: Vec<u8> =
            serde_json::from_str(raw.trim()).map_err(|e| KeypairError::Malformed(e.to_string()))?;
        let actual = bytes.len();
        let bytes: [u8; 64] = bytes.try_into().map_err(|_| KeypairError::WrongLength {
            expected: 64,
            actual,
        })?;
        let signing = SigningKey::from_keypair_bytes(&bytes).map_err(|_| KeypairError::Mismatch)?;
        Ok(Self { signing })
    }

    pub fn from_signing_key(signing: SigningKey) -> Self {
        Self { signing }
    }

    pub fn pubkey_bytes(&self) -> [u8; ADDRESS_LEN] {
        self.signing.verifying_key().to_bytes()
    }

    /// Base58 address.
    pub fn pubkey(&self) -> String {
        bs58::encode(self.pubkey_bytes()).into_string()
    }

    fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for PayoutKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayoutKeypair")
            .field("pubkey", &self.pubkey())
            .finish_non_exhaustive()
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// TRANSACTION CODEC
// ════════════════════════════════════════════════════════════════════════════════

/// Solana "compact-u16" (shortvec) length prefix.
pub fn encode_compact_u16(value: u16, out: &mut Vec<u8>) {
    let mut rem = value;
    loop {
        let mut byte = (rem & 0x7f) as u8;
        rem >>= 7;
        if rem == 0 {
            out.push(byte);
            return;
        }
        byte |= 0x80;
        out.push(byte);
    }
}

/// Serializes a legacy message carrying one System `Transfer`.
///
/// Account order is `[payer, recipient, system program]`; a self-transfer
/// collapses to `[payer, system program]`.
pub fn transfer_message(
    payer: &[u8; ADDRESS_LEN],
    recipient: &[u8; ADDRESS_LEN],
    recent_blockhash: &[u8; 32],
    lamports: u64,
) -> Vec<u8> {
    let mut keys: Vec<&[u8; ADDRESS_LEN]> = vec![payer];
    if recipient != payer {
        keys.push(recipient);
    }
    keys.push(&SYSTEM_PROGRAM_ID);
    let recipient_index = if recipient == payer { 0u8 } else { 1u8 };
    let program_index = (keys.len() - 1) as u8;

    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&SYSTEM_TRANSFER_INDEX.to_le_bytes());
    data.extend_from_slice(&lamports.to_le_bytes());

    let capacity = 3 + 1 + keys.len() * ADDRESS_LEN + 32 + 1 + 4 + 1 + data.len();
    let mut msg = Vec::with_capacity(capacity);
    // num_required_signatures, num_readonly_signed, num_readonly_unsigned
    msg.extend_from_slice(&[1, 0, 1]);
    encode_compact_u16(keys.len() as u16, &mut msg);
    for key in &keys {
        msg.extend_from_slice(&key[..]);
    }
    msg.extend_from_slice(recent_blockhash);

    encode_compact_u16(1, &mut msg);
    msg.push(program_index);
    encode_compact_u16(2, &mut msg);
    msg.push(0);
    msg.push(recipient_index);
    encode_compact_u16(data.len() as u16, &mut msg);
    msg.extend_from_slice(&data);
    msg
}

/// Signs `message` and wraps it into a wire transaction.
///
/// Returns `(base58 signature, serialized transaction)`.
pub fn sign_transaction(keypair: &PayoutKeypair, message: &[u8]) -> (String, Vec<u8>) {
    let signature = keypair.sign(message);
    let mut tx = Vec::with_capacity(1 + SIGNATURE_LEN + message.len());
    encode_compact_u16(1, &mut tx);
    tx.extend_from_slice(&signature);
    tx.extend_from_slice(message);
    (bs58::encode(signature).into_string(), tx)
}

// ════════════════════════════════════════════════════════════════════════════════
// RESPONSE PARSING
// ════════════════════════════════════════════════════════════════════════════════

/// Parses a jsonParsed `getTransaction` result. `null` means not found.
pub fn parse_transaction(
    reference: &str,
    result: &Value,
) -> Result<Option<ObservedTransaction>, ChainClientError> {
    if result.is_null() {
        return Ok(None);
    }
    let meta = result
        .get("meta")
        .ok_or_else(|| ChainClientError::InvalidResponse("transaction without meta".into()))?;
    let failure = match meta.get("err") {
        None | Some(Value::Null) => None,
        Some(err) => Some(err.to_string()),
    };

    let instructions = result
        .pointer("/transaction/message/instructions")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            ChainClientError::InvalidResponse("transaction without instructions".into())
        })?;

    let transfers = instructions
        .iter()
        .filter(|ix| ix.get("program").and_then(Value::as_str) == Some("system"))
        .filter_map(|ix| ix.get("parsed"))
        .filter(|parsed| {
            matches!(
                parsed.get("type").and_then(Value::as_str),
                Some("transfer") | Some("transferWithSeed")
            )
        })
        .filter_map(|parsed| {
            let info = parsed.get("info")?;
            Some(ObservedTransfer {
                source: info.get("source")?.as_str()?.to_string(),
                destination: info.get("destination")?.as_str()?.to_string(),
                lamports: Lamports(info.get("lamports")?.as_u64()?),
            })
        })
        .collect();

    Ok(Some(ObservedTransaction {
        reference: reference.to_string(),
        failure,
        transfers,
    }))
}

/// Sums raw token amounts across a jsonParsed `getTokenAccountsByOwner` result.
pub fn parse_token_balance(result: &Value) -> Result<u64, ChainClientError> {
    let accounts = result
        .get("value")
        .and_then(Value::as_array)
        .ok_or_else(|| ChainClientError::InvalidResponse("token accounts without value".into()))?;
    let mut total: u64 = 0;
    for account in accounts {
        let raw = account
            .pointer("/account/data/parsed/info/tokenAmount/amount")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ChainClientError::InvalidResponse("token account without amount".into())
            })?;
        let amount: u64 = raw
            .parse()
            .map_err(|_| ChainClientError::InvalidResponse(format!("bad token amount {:?}", raw)))?;
        total = total.saturating_add(amount);
    }
    Ok(total)
}

/// Interprets one element of a `getSignatureStatuses` result.
pub fn parse_signature_status(status: &Value) -> SettlementStatus {
    if status.is_null() {
        return SettlementStatus::Pending;
    }
    match status.get("err") {
        Some(err) if !err.is_null() => return SettlementStatus::Failed(err.to_string()),
        _ => {}
    }
    match status.get("confirmationStatus").and_then(Value::as_str) {
        Some("confirmed") | Some("finalized") => SettlementStatus::Confirmed,
        _ => SettlementStatus::Pending,
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// JSON-RPC CLIENT
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Solana JSON-RPC client.
///
/// Never retries internally. Without a keypair it can still verify
/// contributions and look up balances but refuses to submit transfers.
pub struct SolanaRpcClient {
    client: reqwest::Client,
    rpc_url: String,
    keypair: Option<PayoutKeypair>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for SolanaRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolanaRpcClient")
            .field("rpc_url", &self.rpc_url)
            .field("keypair", &self.keypair)
            .finish()
    }
}

impl SolanaRpcClient {
    pub fn new(
        rpc_url: &str,
        timeout: Duration,
        keypair: Option<PayoutKeypair>,
    ) -> Result<Self, ChainClientError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainClientError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            rpc_url: rpc_url.to_string(),
            keypair,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn payer(&self) -> Option<&PayoutKeypair> {
        self.keypair.as_ref()
    }

    /// Sends one request and returns its `result` (possibly `null`).
    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainClientError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .client
            .post(&self.rpc_url)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(ChainClientError::Network(format!("HTTP error: {}", status)));
        }
        if !status.is_success() {
            return Err(ChainClientError::Rejected(format!("HTTP error: {}", status)));
        }

        let body = response.text().await.map_err(map_transport_error)?;
        let rpc: JsonRpcResponse = serde_json::from_str(&body)
            .map_err(|e| ChainClientError::InvalidResponse(format!("{}: {}", method, e)))?;

        if let Some(error) = rpc.error {
            return Err(ChainClientError::Rejected(format!(
                "{} RPC error {}: {}",
                method, error.code, error.message
            )));
        }
        Ok(rpc.result.unwrap_or(Value::Null))
    }

    async fn latest_blockhash(&self) -> Result<[u8; 32], ChainClientError> {
        let result = self
            .call("getLatestBlockhash", json!([{ "commitment": "confirmed" }]))
            .await?;
        let hash = result
            .pointer("/value/blockhash")
            .and_then(Value::as_str)
            .ok_or_else(|| ChainClientError::InvalidResponse("missing blockhash".into()))?;
        decode_address(hash)
            .map_err(|_| ChainClientError::InvalidResponse(format!("bad blockhash {:?}", hash)))
    }

    /// Native balance of `address`.
    pub async fn balance(&self, address: &str) -> Result<Lamports, ChainClientError> {
        decode_address(address)?;
        let result = self
            .call("getBalance", json!([address, { "commitment": "confirmed" }]))
            .await?;
        result
            .get("value")
            .and_then(Value::as_u64)
            .map(Lamports)
            .ok_or_else(|| ChainClientError::InvalidResponse("missing balance value".into()))
    }
}

fn map_transport_error(e: reqwest::Error) -> ChainClientError {
    if e.is_timeout() {
        ChainClientError::Timeout
    } else {
        ChainClientError::Network(format!("request failed: {}", e))
    }
}

#[async_trait]
impl ChainQuery for SolanaRpcClient {
    async fn fetch_transaction(
        &self,
        reference: &str,
    ) -> Result<Option<ObservedTransaction>, ChainClientError> {
        let result = self
            .call(
                "getTransaction",
                json!([
                    reference,
                    {
                        "encoding": "jsonParsed",
                        "commitment": "confirmed",
                        "maxSupportedTransactionVersion": 0
                    }
                ]),
            )
            .await?;
        parse_transaction(reference, &result)
    }
}

#[async_trait]
impl TransferSubmitter for SolanaRpcClient {
    async fn prepare_transfer(
        &self,
        recipient: &str,
        amount: Lamports,
    ) -> Result<PreparedTransfer, ChainClientError> {
        let keypair = self
            .keypair
            .as_ref()
            .ok_or_else(|| ChainClientError::Rejected("no payout keypair configured".into()))?;
        let to = decode_address(recipient)?;
        let blockhash = self.latest_blockhash().await?;

        let message = transfer_message(&keypair.pubkey_bytes(), &to, &blockhash, amount.get());
        let (signature, tx) = sign_transaction(keypair, &message);
        Ok(PreparedTransfer {
            reference: signature,
            recipient: recipient.to_string(),
            amount,
            payload: tx,
        })
    }

    async fn send_transfer(&self, transfer: &PreparedTransfer) -> Result<(), ChainClientError> {
        let encoded = general_purpose::STANDARD.encode(&transfer.payload);
        let sent = self
            .call(
                "sendTransaction",
                json!([encoded, { "encoding": "base64", "preflightCommitment": "confirmed" }]),
            )
            .await;

        let reference = transfer.reference.as_str();
        match sent {
            Ok(Value::String(returned)) => {
                if returned != reference {
                    warn!(
                        expected = %reference,
                        returned = %returned,
                        "sendTransaction returned unexpected signature"
                    );
                }
                debug!(
                    reference = %reference,
                    recipient = %transfer.recipient,
                    lamports = transfer.amount.get(),
                    "transfer submitted"
                );
                Ok(())
            }
            Ok(other) => {
                warn!(
                    reference = %reference,
                    response = %other,
                    "sendTransaction returned non-string result"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn settlement_status(
        &self,
        reference: &str,
    ) -> Result<SettlementStatus, ChainClientError> {
        let result = self
            .call(
                "getSignatureStatuses",
                json!([[reference], { "searchTransactionHistory": true }]),
            )
            .await?;
        let status = result
            .pointer("/value/0")
            .ok_or_else(|| ChainClientError::InvalidResponse("missing signature status".into()))?;
        Ok(parse_signature_status(status))
    }
}

#[async_trait]
impl TokenBalanceOracle for SolanaRpcClient {
    async fn token_balance(&self, owner: &str, mint: &str) -> Result<u64, ChainClientError> {
        decode_address(owner)?;
        decode_address(mint)?;
        let result = self
            .call(
                "getTokenAccountsByOwner",
                json!([
                    owner,
                    { "mint": mint },
                    { "encoding": "jsonParsed", "commitment": "confirmed" }
                ]),
            )
            .await?;
        parse_token_balance(&result)
    }
}
