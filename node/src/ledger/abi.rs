//! Minimal ABI handling for decoding contract events out of mirror logs.
//!
//! The mirror returns each log as a topic list plus a data blob: topic 0
//! is the Keccak-256 hash of the event declaration, further topics carry
//! the indexed parameters, and the data blob is the standard head/tail
//! encoding of the rest.

use sha3::{Digest, Keccak256};
use thiserror::Error;

const WORD: usize = 32;

#[derive(Debug, Error)]
pub enum AbiError {
    #[error("abi: invalid hex: {0}")]
    BadHex(#[from] hex::FromHexError),
    #[error("abi: data truncated at word {0}")]
    Truncated(usize),
    #[error("abi: uint word overflows")]
    Overflow,
    #[error("abi: string payload is not utf-8")]
    BadUtf8,
}

/// `0x`-prefixed Keccak-256 hash of an event declaration, as it appears
/// in topic 0 of a mirror log.
pub fn event_signature(decl: &str) -> String {
    format!("0x{}", hex::encode(Keccak256::digest(decl.as_bytes())))
}

pub fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

/// Decode an indexed uint256 topic. Values above `u128` are rejected.
pub fn decode_topic_uint(topic: &str) -> Result<u128, AbiError> {
    let bytes = hex::decode(strip_0x(topic))?;
    word_to_uint(&bytes, 0)
}

/// Decode an indexed address topic: the last 20 bytes of the word.
pub fn decode_topic_address(topic: &str) -> Result<String, AbiError> {
    let bytes = hex::decode(strip_0x(topic))?;
    if bytes.len() < 20 {
        return Err(AbiError::Truncated(0));
    }
    Ok(format!("0x{}", hex::encode(&bytes[bytes.len() - 20..])))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiType {
    Uint,
    Address,
    Str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiValue {
    Uint(u128),
    Address(String),
    Str(String),
}

impl AbiValue {
    pub fn as_uint(&self) -> Option<u128> {
        match self {
            AbiValue::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AbiValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Decode the non-indexed parameters of an event from its data blob.
pub fn decode_data(data: &str, types: &[AbiType]) -> Result<Vec<AbiValue>, AbiError> {
    let bytes = hex::decode(strip_0x(data))?;
    let mut values = Vec::with_capacity(types.len());

    for (i, ty) in types.iter().enumerate() {
        let word = word_at(&bytes, i)?;
        let value = match ty {
            AbiType::Uint => AbiValue::Uint(word_to_uint(word, i)?),
            AbiType::Address => AbiValue::Address(format!("0x{}", hex::encode(&word[12..]))),
            AbiType::Str => {
                let offset = word_to_uint(word, i)? as usize;
                AbiValue::Str(decode_string_at(&bytes, offset)?)
            }
        };
        values.push(value);
    }
    Ok(values)
}

fn decode_string_at(bytes: &[u8], offset: usize) -> Result<String, AbiError> {
    if offset % WORD != 0 {
        return Err(AbiError::Truncated(offset / WORD));
    }
    let len_word = word_at(bytes, offset / WORD)?;
    let len = word_to_uint(len_word, offset / WORD)? as usize;
    let start = offset + WORD;
    if bytes.len() < start + len {
        return Err(AbiError::Truncated(start / WORD));
    }
    String::from_utf8(bytes[start..start + len].to_vec()).map_err(|_| AbiError::BadUtf8)
}

fn word_at(bytes: &[u8], index: usize) -> Result<&[u8], AbiError> {
    let start = index * WORD;
    bytes
        .get(start..start + WORD)
        .ok_or(AbiError::Truncated(index))
}

fn word_to_uint(word: &[u8], index: usize) -> Result<u128, AbiError> {
    if word.len() != WORD {
        return Err(AbiError::Truncated(index));
    }
    if word[..WORD - 16].iter().any(|b| *b != 0) {
        return Err(AbiError::Overflow);
    }
    let mut tail = [0u8; 16];
    tail.copy_from_slice(&word[WORD - 16..]);
    Ok(u128::from_be_bytes(tail))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known vector: the ERC-20 Transfer topic, which pins the
    // Keccak-256 implementation.
    #[test]
    fn keccak_signature_matches_known_vector() {
        assert_eq!(
            event_signature("Transfer(address,address,uint256)"),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn distinct_declarations_yield_distinct_signatures() {
        let a = event_signature("TaskCompleted(uint256)");
        let b = event_signature("TaskCreated(uint256,address,string,string,uint256,uint256)");
        assert_ne!(a, b);
        assert_eq!(a.len(), 66);
    }

    #[test]
    fn topic_uint_and_address_decode() {
        let topic = format!("0x{:064x}", 42u64);
        assert_eq!(decode_topic_uint(&topic).unwrap(), 42);

        let addr_topic = format!("0x{}{}", "0".repeat(24), "ab".repeat(20));
        assert_eq!(
            decode_topic_address(&addr_topic).unwrap(),
            format!("0x{}", "ab".repeat(20))
        );
    }

    fn push_word(buf: &mut String, value: u128) {
        buf.push_str(&format!("{value:064x}"));
    }

    fn push_string(buf: &mut String, s: &str) {
        push_word(buf, s.len() as u128);
        buf.push_str(&hex::encode(s.as_bytes()));
        let pad = (WORD - s.len() % WORD) % WORD;
        buf.push_str(&"00".repeat(pad));
    }

    #[test]
    fn decodes_string_uint_uint_payload() {
        // Layout of WeightsSubmitted's data: (string, uint256, uint256)
        let hash = "a".repeat(64);
        let mut data = String::from("0x");
        push_word(&mut data, 3 * WORD as u128); // offset of the string tail
        push_word(&mut data, 10_000_000);
        push_word(&mut data, 2);
        push_string(&mut data, &hash);

        let values =
            decode_data(&data, &[AbiType::Str, AbiType::Uint, AbiType::Uint]).unwrap();
        assert_eq!(values[0].as_str().unwrap(), hash);
        assert_eq!(values[1].as_uint().unwrap(), 10_000_000);
        assert_eq!(values[2].as_uint().unwrap(), 2);
    }

    #[test]
    fn truncated_data_is_an_error() {
        let err = decode_data("0x00ff", &[AbiType::Uint]).unwrap_err();
        assert!(matches!(err, AbiError::Truncated(0)));
    }

    #[test]
    fn oversized_uint_is_rejected() {
        let data = format!("0x{}", "ff".repeat(32));
        let err = decode_data(&data, &[AbiType::Uint]).unwrap_err();
        assert!(matches!(err, AbiError::Overflow));
    }
}
