use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Byte arrangement inside one 16-bit register.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub enum ByteOrder {
    Big,
    Little,
}

/// Which of the two registers of a 32-bit value is most significant.
/// `Little` means the least significant word comes first on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub enum WordOrder {
    Big,
    Little,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum DecodeRule {
    Float32 { byte_order: ByteOrder, word_order: WordOrder },
    ScaledUInt16 { byte_order: ByteOrder, scale: f64 },
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("word count {got} does not fit the decode rule (expected {expected})")]
    MalformedInput { expected: usize, got: usize },
    #[error("channel index {index} out of range, group decodes {values} values")]
    ChannelOutOfRange { index: usize, values: usize },
}

fn apply_byte_order(word: u16, order: ByteOrder) -> u16 {
    match order {
        ByteOrder::Big => word,
        ByteOrder::Little => word.swap_bytes(),
    }
}

/// Reassemble an IEEE-754 float from exactly two registers.
pub fn decode_float32(words: &[u16], byte_order: ByteOrder, word_order: WordOrder) -> Result<f64, DecodeError> {
    if words.len() != 2 {
        return Err(DecodeError::MalformedInput { expected: 2, got: words.len() });
    }

    let (high, low) = match word_order {
        WordOrder::Big => (words[0], words[1]),
        WordOrder::Little => (words[1], words[0]),
    };

    let bits = u32::from(apply_byte_order(high, byte_order)) << 16
        | u32::from(apply_byte_order(low, byte_order));
    return Ok(f32::from_bits(bits) as f64);
}

/// Decode a single register holding a scaled unsigned integer.
pub fn decode_scaled_u16(word: u16, byte_order: ByteOrder, scale: f64) -> f64 {
    return apply_byte_order(word, byte_order) as f64 / scale;
}

/// Apply a decode rule across a whole register block: two words per value
/// for floats, one word per value for scaled integers.
pub fn decode_group(words: &[u16], rule: &DecodeRule) -> Result<Vec<f64>, DecodeError> {
    match rule {
        DecodeRule::Float32 { byte_order, word_order } => {
            return words
                .chunks(2)
                .map(|pair| decode_float32(pair, *byte_order, *word_order))
                .collect();
        }
        DecodeRule::ScaledUInt16 { byte_order, scale } => {
            return Ok(words.iter().map(|w| decode_scaled_u16(*w, *byte_order, *scale)).collect());
        }
    }
}
