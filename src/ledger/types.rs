//! Wire types for the XRP Ledger JSON protocol

use crate::error::{EngineError, EngineResult};

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// Seconds between the unix epoch and the ledger epoch (2000-01-01T00:00:00Z)
pub const LEDGER_EPOCH_OFFSET: i64 = 946_684_800;

/// Drops per XRP
pub const DROPS_PER_XRP: i64 = 1_000_000;

/// Convert unix seconds to ledger seconds
pub fn to_ledger_time(unix_secs: i64) -> i64 {
    unix_secs - LEDGER_EPOCH_OFFSET
}

/// Current time in ledger seconds
pub fn now_ledger_time() -> i64 {
    to_ledger_time(chrono::Utc::now().timestamp())
}

/// A currency/issuer pair as used in book queries
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Issue {
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub issuer: Option<String>,
}

impl Issue {
    pub fn xrp() -> Self {
        Self {
            currency: "XRP".to_string(),
            issuer: None,
        }
    }

    pub fn token(currency: &str, issuer: &str) -> Self {
        Self {
            currency: currency_code(currency),
            issuer: Some(issuer.to_string()),
        }
    }
}

/// Normalize a currency code for the ledger.
///
/// Three-character codes and 40-hex codes pass through; anything else is hex
/// encoded and right-padded with zeros to 40 characters.
pub fn currency_code(code: &str) -> String {
    let standard = code.len() == 3
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "?!@#$%^&*<>(){}[]|".contains(c));
    if standard {
        return code.to_string();
    }

    let is_hex_code = code.len() == 40
        && code
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase());
    if is_hex_code {
        return code.to_string();
    }

    let mut hex_code = hex::encode_upper(code.as_bytes());
    while hex_code.len() < 40 {
        hex_code.push('0');
    }
    hex_code
}

/// An amount as the ledger reports it: XRP as a drops string, tokens as an object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LedgerAmount {
    Drops(String),
    Issued {
        currency: String,
        #[serde(default)]
        issuer: Option<String>,
        value: String,
    },
}

impl LedgerAmount {
    /// Amount in display units: XRP for drops, face value for tokens
    pub fn units(&self) -> Option<Decimal> {
        match self {
            LedgerAmount::Drops(drops) => drops
                .parse::<Decimal>()
                .ok()
                .map(|d| d / Decimal::from(DROPS_PER_XRP)),
            LedgerAmount::Issued { value, .. } => value.parse::<Decimal>().ok(),
        }
    }
}

/// A single offer returned by `book_offers`
#[derive(Debug, Clone, Deserialize)]
pub struct BookOffer {
    #[serde(rename = "Account")]
    pub account: String,
    #[serde(rename = "TakerGets")]
    pub taker_gets: LedgerAmount,
    #[serde(rename = "TakerPays")]
    pub taker_pays: LedgerAmount,
    #[serde(rename = "Expiration", default)]
    pub expiration: Option<i64>,
    #[serde(default)]
    pub taker_gets_funded: Option<LedgerAmount>,
    #[serde(default)]
    pub taker_pays_funded: Option<LedgerAmount>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookOffersResponse {
    #[serde(default)]
    pub offers: Vec<BookOffer>,
    #[serde(default)]
    pub ledger_current_index: Option<u32>,
    #[serde(default)]
    pub ledger_index: Option<u32>,
}

impl BookOffersResponse {
    pub fn ledger(&self) -> u32 {
        self.ledger_current_index.or(self.ledger_index).unwrap_or(0)
    }
}

/// `ledgerClosed` stream message
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerClosed {
    #[serde(deserialize_with = "lenient_u32")]
    pub ledger_index: u32,
    pub ledger_hash: String,
    #[serde(default)]
    pub ledger_time: i64,
    #[serde(default)]
    pub txn_count: u32,
}

/// A validated ledger with expanded transactions
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatedLedger {
    #[serde(deserialize_with = "lenient_u32")]
    pub ledger_index: u32,
    #[serde(default)]
    pub ledger_hash: String,
    /// Raw transactions; each is decoded on its own so one unknown shape
    /// cannot reject the ledger
    #[serde(default)]
    pub transactions: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoFields {
    #[serde(rename = "MemoData", default, skip_serializing_if = "Option::is_none")]
    pub memo_data: Option<String>,
    #[serde(rename = "MemoType", default, skip_serializing_if = "Option::is_none")]
    pub memo_type: Option<String>,
    #[serde(rename = "MemoFormat", default, skip_serializing_if = "Option::is_none")]
    pub memo_format: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoEntry {
    #[serde(rename = "Memo")]
    pub memo: MemoFields,
}

impl MemoEntry {
    /// Memo carrying `payload` as hex(utf8)
    pub fn from_text(payload: &str) -> Self {
        Self {
            memo: MemoFields {
                memo_data: Some(encode_memo(payload)),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionMeta {
    #[serde(rename = "TransactionResult")]
    pub transaction_result: String,
}

/// Transaction as it appears in an expanded ledger
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerTransaction {
    #[serde(rename = "TransactionType")]
    pub transaction_type: String,
    #[serde(rename = "Account")]
    pub account: String,
    #[serde(rename = "Destination", default)]
    pub destination: Option<String>,
    #[serde(rename = "Owner", default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub hash: String,
    #[serde(rename = "Condition", default)]
    pub condition: Option<String>,
    #[serde(rename = "Sequence", default)]
    pub sequence: Option<u32>,
    #[serde(rename = "OfferSequence", default)]
    pub offer_sequence: Option<u32>,
    #[serde(rename = "CancelAfter", default)]
    pub cancel_after: Option<i64>,
    #[serde(rename = "FinishAfter", default)]
    pub finish_after: Option<i64>,
    #[serde(rename = "DestinationTag", default)]
    pub destination_tag: Option<u32>,
    #[serde(rename = "SourceTag", default)]
    pub source_tag: Option<u32>,
    #[serde(rename = "Memos", default)]
    pub memos: Vec<MemoEntry>,
    #[serde(rename = "metaData", alias = "meta", default)]
    pub meta: Option<TransactionMeta>,
}

impl LedgerTransaction {
    /// Whether the ledger applied this transaction successfully
    pub fn succeeded(&self) -> bool {
        self.meta
            .as_ref()
            .map(|m| EngineCode::from(m.transaction_result.as_str()) == EngineCode::Success)
            .unwrap_or(false)
    }

    /// First memo's data decoded as UTF-8
    pub fn first_memo(&self) -> EngineResult<String> {
        let data = self
            .memos
            .first()
            .and_then(|m| m.memo.memo_data.as_deref())
            .ok_or_else(|| EngineError::Decoding("transaction carries no memo".to_string()))?;
        decode_memo(data)
    }
}

/// Trust line as returned by `account_lines`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustLine {
    pub account: String,
    pub balance: String,
    pub currency: String,
    pub limit: String,
    #[serde(default)]
    pub limit_peer: Option<String>,
}

/// Result of a `submit` call
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    pub engine_result: String,
    #[serde(default)]
    pub engine_result_message: Option<String>,
    #[serde(default)]
    pub tx_json: Option<serde_json::Value>,
}

impl SubmitResponse {
    pub fn code(&self) -> EngineCode {
        EngineCode::from(self.engine_result.as_str())
    }

    pub fn hash(&self) -> Option<String> {
        self.tx_json
            .as_ref()
            .and_then(|tx| tx.get("hash"))
            .and_then(|h| h.as_str())
            .map(str::to_string)
    }
}

/// Ledger outcome codes this engine reacts to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EngineCode {
    /// tesSUCCESS
    Success,
    /// tecNO_TARGET: the escrow no longer exists
    NoTarget,
    /// telINSUF_FEE_P: fee below the server's current load fee
    InsufficientFee,
    /// tecCRYPTOCONDITION_ERROR: fulfillment does not match the condition
    CryptoconditionError,
    /// tecNO_PERMISSION: FinishAfter/CancelAfter not yet reached
    NoPermission,
    Other(String),
}

/// How the lifecycle reacts to an engine code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    TerminalSuccess,
    TerminalNotFound,
    /// Resubmit with an escalated fee
    RetryFee,
    /// Recorded but never resubmitted automatically
    Attention,
    /// Resubmit with the same fee on the next cycle
    Retry,
}

impl EngineCode {
    pub fn as_str(&self) -> &str {
        match self {
            EngineCode::Success => "tesSUCCESS",
            EngineCode::NoTarget => "tecNO_TARGET",
            EngineCode::InsufficientFee => "telINSUF_FEE_P",
            EngineCode::CryptoconditionError => "tecCRYPTOCONDITION_ERROR",
            EngineCode::NoPermission => "tecNO_PERMISSION",
            EngineCode::Other(code) => code,
        }
    }

    pub fn class(&self) -> ResultClass {
        match self {
            EngineCode::Success => ResultClass::TerminalSuccess,
            EngineCode::NoTarget => ResultClass::TerminalNotFound,
            EngineCode::InsufficientFee => ResultClass::RetryFee,
            EngineCode::CryptoconditionError | EngineCode::NoPermission => ResultClass::Attention,
            EngineCode::Other(_) => ResultClass::Retry,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.class(),
            ResultClass::TerminalSuccess | ResultClass::TerminalNotFound
        )
    }
}

impl From<&str> for EngineCode {
    fn from(code: &str) -> Self {
        match code {
            "tesSUCCESS" => EngineCode::Success,
            "tecNO_TARGET" => EngineCode::NoTarget,
            "telINSUF_FEE_P" => EngineCode::InsufficientFee,
            "tecCRYPTOCONDITION_ERROR" => EngineCode::CryptoconditionError,
            "tecNO_PERMISSION" => EngineCode::NoPermission,
            other => EngineCode::Other(other.to_string()),
        }
    }
}

impl From<String> for EngineCode {
    fn from(code: String) -> Self {
        EngineCode::from(code.as_str())
    }
}

impl From<EngineCode> for String {
    fn from(code: EngineCode) -> Self {
        code.as_str().to_string()
    }
}

impl fmt::Display for EngineCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// hex(utf8(payload)), uppercase as the ledger renders it
pub fn encode_memo(payload: &str) -> String {
    hex::encode_upper(payload.as_bytes())
}

pub fn decode_memo(memo_data: &str) -> EngineResult<String> {
    let bytes = hex::decode(memo_data).map_err(|e| EngineError::Decoding(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| EngineError::Decoding(e.to_string()))
}

/// Ledger indexes arrive as numbers on streams and as strings in `ledger` results
fn lenient_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Index {
        Number(u32),
        Text(String),
    }

    match Index::deserialize(deserializer)? {
        Index::Number(n) => Ok(n),
        Index::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}
