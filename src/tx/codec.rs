//! Canonical binary serialization for the escrow transactions the engine emits
//!
//! Only the fields used by EscrowCreate, EscrowCancel and EscrowFinish are
//! supported. Fields are written sorted by (type code, field code).

use crate::error::{EngineError, EngineResult};
use crate::ledger::types::MemoEntry;

use serde::{Deserialize, Serialize};

const TYPE_UINT16: u8 = 1;
const TYPE_UINT32: u8 = 2;
const TYPE_AMOUNT: u8 = 6;
const TYPE_BLOB: u8 = 7;
const TYPE_ACCOUNT: u8 = 8;
const TYPE_OBJECT: u8 = 14;
const TYPE_ARRAY: u8 = 15;

const OBJECT_END: u8 = 0xE1;
const ARRAY_END: u8 = 0xF1;

/// Prefix for the signing payload ("STX\0")
pub const SIGNING_PREFIX: [u8; 4] = [0x53, 0x54, 0x58, 0x00];
/// Prefix for the transaction id hash ("TXN\0")
pub const TX_ID_PREFIX: [u8; 4] = [0x54, 0x58, 0x4E, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    EscrowCreate,
    EscrowFinish,
    EscrowCancel,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::EscrowCreate => "EscrowCreate",
            TransactionType::EscrowFinish => "EscrowFinish",
            TransactionType::EscrowCancel => "EscrowCancel",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "EscrowCreate" => Some(TransactionType::EscrowCreate),
            "EscrowFinish" => Some(TransactionType::EscrowFinish),
            "EscrowCancel" => Some(TransactionType::EscrowCancel),
            _ => None,
        }
    }

    fn code(self) -> u16 {
        match self {
            TransactionType::EscrowCreate => 1,
            TransactionType::EscrowFinish => 2,
            TransactionType::EscrowCancel => 4,
        }
    }
}

/// Escrow transaction in ledger JSON shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Transaction {
    pub transaction_type: TransactionType,
    pub account: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub destination: Option<String>,
    /// Drops
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub amount: Option<String>,
    /// Drops
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub flags: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sequence: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub offer_sequence: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cancel_after: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finish_after: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fulfillment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub destination_tag: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_tag: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub memos: Vec<MemoEntry>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signing_pub_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub txn_signature: Option<String>,
}

impl Transaction {
    pub fn new(transaction_type: TransactionType, account: &str) -> Self {
        Self {
            transaction_type,
            account: account.to_string(),
            owner: None,
            destination: None,
            amount: None,
            fee: None,
            flags: None,
            sequence: None,
            offer_sequence: None,
            cancel_after: None,
            finish_after: None,
            condition: None,
            fulfillment: None,
            destination_tag: None,
            source_tag: None,
            memos: Vec::new(),
            signing_pub_key: None,
            txn_signature: None,
        }
    }
}

/// Serialize a transaction; `for_signing` omits TxnSignature
pub fn encode(tx: &Transaction, for_signing: bool) -> EngineResult<Vec<u8>> {
    let mut out = Vec::with_capacity(256);

    write_field(&mut out, TYPE_UINT16, 2);
    out.extend_from_slice(&tx.transaction_type.code().to_be_bytes());

    put_u32(&mut out, 2, tx.flags);
    put_u32(&mut out, 3, tx.source_tag);
    put_u32(&mut out, 4, tx.sequence);
    put_u32(&mut out, 14, tx.destination_tag);
    put_u32(&mut out, 25, tx.offer_sequence);
    put_u32(&mut out, 36, tx.cancel_after);
    put_u32(&mut out, 37, tx.finish_after);

    put_drops(&mut out, 1, tx.amount.as_deref())?;
    put_drops(&mut out, 8, tx.fee.as_deref())?;

    put_blob(&mut out, 3, tx.signing_pub_key.as_deref())?;
    if !for_signing {
        put_blob(&mut out, 4, tx.txn_signature.as_deref())?;
    }
    put_blob(&mut out, 16, tx.fulfillment.as_deref())?;
    put_blob(&mut out, 17, tx.condition.as_deref())?;

    put_account(&mut out, 1, Some(tx.account.as_str()))?;
    put_account(&mut out, 2, tx.owner.as_deref())?;
    put_account(&mut out, 3, tx.destination.as_deref())?;

    if !tx.memos.is_empty() {
        write_field(&mut out, TYPE_ARRAY, 9);
        for entry in &tx.memos {
            write_field(&mut out, TYPE_OBJECT, 10);
            put_blob(&mut out, 12, entry.memo.memo_type.as_deref())?;
            put_blob(&mut out, 13, entry.memo.memo_data.as_deref())?;
            put_blob(&mut out, 14, entry.memo.memo_format.as_deref())?;
            out.push(OBJECT_END);
        }
        out.push(ARRAY_END);
    }

    Ok(out)
}

/// Field id bytes for a (type, field) pair
pub fn field_header(type_code: u8, field_code: u8) -> Vec<u8> {
    match (type_code < 16, field_code < 16) {
        (true, true) => vec![(type_code << 4) | field_code],
        (true, false) => vec![type_code << 4, field_code],
        (false, true) => vec![field_code, type_code],
        (false, false) => vec![0, type_code, field_code],
    }
}

fn write_field(out: &mut Vec<u8>, type_code: u8, field_code: u8) {
    out.extend_from_slice(&field_header(type_code, field_code));
}

/// Variable-length prefix
pub fn length_prefix(len: usize) -> EngineResult<Vec<u8>> {
    if len <= 192 {
        Ok(vec![len as u8])
    } else if len <= 12_480 {
        let l = len - 193;
        Ok(vec![193 + (l >> 8) as u8, (l & 0xff) as u8])
    } else if len <= 918_744 {
        let l = len - 12_481;
        Ok(vec![
            241 + (l >> 16) as u8,
            ((l >> 8) & 0xff) as u8,
            (l & 0xff) as u8,
        ])
    } else {
        Err(EngineError::Internal(format!("blob too long: {}", len)))
    }
}

fn put_u32(out: &mut Vec<u8>, field_code: u8, value: Option<u32>) {
    if let Some(value) = value {
        write_field(out, TYPE_UINT32, field_code);
        out.extend_from_slice(&value.to_be_bytes());
    }
}

/// Native amount: bit 62 set (positive), low bits = drops
pub fn encode_drops(drops: u64) -> EngineResult<[u8; 8]> {
    if drops > 100_000_000_000_000_000 {
        return Err(EngineError::Internal(format!("drops out of range: {}", drops)));
    }
    Ok((drops | 0x4000_0000_0000_0000).to_be_bytes())
}

fn put_drops(out: &mut Vec<u8>, field_code: u8, drops: Option<&str>) -> EngineResult<()> {
    if let Some(drops) = drops {
        let drops: u64 = drops
            .parse()
            .map_err(|_| EngineError::Internal(format!("invalid drops amount: {}", drops)))?;
        write_field(out, TYPE_AMOUNT, field_code);
        out.extend_from_slice(&encode_drops(drops)?);
    }
    Ok(())
}

fn put_blob(out: &mut Vec<u8>, field_code: u8, hex_value: Option<&str>) -> EngineResult<()> {
    if let Some(hex_value) = hex_value {
        let bytes = hex::decode(hex_value).map_err(|e| EngineError::Decoding(e.to_string()))?;
        write_field(out, TYPE_BLOB, field_code);
        out.extend_from_slice(&length_prefix(bytes.len())?);
        out.extend_from_slice(&bytes);
    }
    Ok(())
}

fn put_account(out: &mut Vec<u8>, field_code: u8, address: Option<&str>) -> EngineResult<()> {
    if let Some(address) = address {
        let account_id = decode_address(address)?;
        write_field(out, TYPE_ACCOUNT, field_code);
        out.push(20);
        out.extend_from_slice(&account_id);
    }
    Ok(())
}

/// Decode a classic `r...` address into its 20-byte account id
pub fn decode_address(address: &str) -> EngineResult<[u8; 20]> {
    let decoded = bs58::decode(address)
        .with_alphabet(bs58::Alphabet::RIPPLE)
        .with_check(Some(0))
        .into_vec()
        .map_err(|e| EngineError::Decoding(format!("address {}: {}", address, e)))?;

    let payload = match decoded.len() {
        21 if decoded[0] == 0 => &decoded[1..],
        20 => &decoded[..],
        n => {
            return Err(EngineError::Decoding(format!(
                "address {} decodes to {} bytes",
                address, n
            )))
        }
    };

    let mut account_id = [0u8; 20];
    account_id.copy_from_slice(payload);
    Ok(account_id)
}

#[cfg(test)]
pub(crate) fn encode_address(account_id: &[u8; 20]) -> String {
    bs58::encode(account_id)
        .with_alphabet(bs58::Alphabet::RIPPLE)
        .with_check_version(0)
        .into_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_headers() {
        assert_eq!(field_header(TYPE_UINT16, 2), vec![0x12]);
        assert_eq!(field_header(TYPE_UINT32, 4), vec![0x24]);
        assert_eq!(field_header(TYPE_UINT32, 25), vec![0x20, 0x19]);
        assert_eq!(field_header(TYPE_BLOB, 17), vec![0x70, 0x11]);
        assert_eq!(field_header(TYPE_ARRAY, 9), vec![0xF9]);
        assert_eq!(field_header(TYPE_OBJECT, 10), vec![0xEA]);
        assert_eq!(field_header(16, 1), vec![0x01, 0x10]);
    }

    #[test]
    fn test_length_prefix() {
        assert_eq!(length_prefix(20).unwrap(), vec![20]);
        assert_eq!(length_prefix(192).unwrap(), vec![192]);
        assert_eq!(length_prefix(193).unwrap(), vec![193, 0]);
        assert_eq!(length_prefix(12_480).unwrap(), vec![240, 255]);
        assert_eq!(length_prefix(12_481).unwrap(), vec![241, 0, 0]);
    }

    #[test]
    fn test_drops_encoding() {
        assert_eq!(
            encode_drops(10).unwrap(),
            [0x40, 0, 0, 0, 0, 0, 0, 0x0A]
        );
        assert!(encode_drops(u64::MAX).is_err());
    }

    #[test]
    fn test_address_round_trip() {
        let id = [7u8; 20];
        let address = encode_address(&id);
        assert!(address.starts_with('r'));
        assert_eq!(decode_address(&address).unwrap(), id);
        assert!(decode_address("rNotAnAddress").is_err());
    }

    #[test]
    fn test_cancel_layout_and_signing_omits_signature() {
        let custody = encode_address(&[1u8; 20]);
        let owner = encode_address(&[2u8; 20]);

        let mut tx = Transaction::new(TransactionType::EscrowCancel, &custody);
        tx.owner = Some(owner);
        tx.offer_sequence = Some(7);
        tx.sequence = Some(42);
        tx.fee = Some("10".to_string());
        tx.signing_pub_key = Some("ED".to_string() + &"AA".repeat(32));
        tx.txn_signature = Some("BB".repeat(64));
        tx.memos = vec![MemoEntry::from_text("x")];

        let signing = encode(&tx, true).unwrap();
        let full = encode(&tx, false).unwrap();

        // TransactionType EscrowCancel leads
        assert_eq!(&signing[..3], &[0x12, 0x00, 0x04]);
        // Sequence comes before OfferSequence
        assert_eq!(&signing[3..8], &[0x24, 0, 0, 0, 42]);
        assert_eq!(&signing[8..14], &[0x20, 0x19, 0, 0, 0, 7]);
        // 64-byte signature plus header and length
        assert_eq!(full.len(), signing.len() + 2 + 64);
        // Memos array terminates the stream
        assert_eq!(full[full.len() - 2..], [OBJECT_END, ARRAY_END]);
    }

    #[test]
    fn test_transactions_compare_by_memo() {
        let custody = encode_address(&[1u8; 20]);
        let mut tx = Transaction::new(TransactionType::EscrowFinish, &custody);
        tx.memos = vec![MemoEntry::from_text("finish")];

        let mut json_copy: Transaction =
            serde_json::from_value(serde_json::to_value(&tx).unwrap()).unwrap();
        assert_eq!(json_copy, tx);

        json_copy.memos = vec![MemoEntry::from_text("cancel")];
        assert_ne!(json_copy, tx);
    }
}
