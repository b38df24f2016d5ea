//! ipmitool output parsing.
//! Converts `ipmitool raw` stdout into response bytes, pulls completion codes
//! out of its error text, and decodes values per the active profile's rules.

use anyhow::{anyhow, bail, Context, Result};

use crate::profiles::types::{DecodeKind, ResponseDecode};

/// Parse one byte written as "0x1f", "1f" or "0X1F".
pub fn parse_hex_byte(token: &str) -> Result<u8> {
    let digits = token
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u8::from_str_radix(digits, 16).with_context(|| format!("'{}' is not a hex byte", token))
}

/// Parse `ipmitool raw` stdout.
/// Input:  " 01 2a 00 ff\n 10 20\n"
pub fn parse_raw_response(stdout: &str) -> Result<Vec<u8>> {
    stdout.split_whitespace().map(parse_hex_byte).collect()
}

/// Extract the completion code from ipmitool's error text.
/// Input:  "Unable to send RAW command (channel=0x0 netfn=0x30 lun=0x0 cmd=0x40 rsp=0xc1): Invalid command"
pub fn parse_completion_code(stderr: &str) -> Option<u8> {
    let start = stderr.find("rsp=")? + "rsp=".len();
    let token: String = stderr[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    parse_hex_byte(&token).ok()
}

/// A value pulled out of a response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decoded {
    Number(f64),
    Flag(bool),
}

impl Decoded {
    pub fn as_number(self) -> Result<f64> {
        match self {
            Decoded::Number(n) => Ok(n),
            Decoded::Flag(_) => Err(anyhow!("expected a numeric decode rule, got a flag")),
        }
    }

    pub fn as_flag(self) -> Result<bool> {
        match self {
            Decoded::Flag(f) => Ok(f),
            Decoded::Number(n) => Ok(n != 0.0),
        }
    }
}

pub fn decode_response(bytes: &[u8], rule: &ResponseDecode) -> Result<Decoded> {
    let byte_at = |offset: usize| -> Result<u8> {
        bytes
            .get(offset)
            .copied()
            .ok_or_else(|| {
                anyhow!(
                    "response too short: {} bytes, need offset {}",
                    bytes.len(),
                    offset
                )
            })
    };

    let decoded = match rule.kind {
        DecodeKind::Byte => Decoded::Number(f64::from(byte_at(rule.offset)?)),
        DecodeKind::U16Le => {
            let lo = byte_at(rule.offset)?;
            let hi = byte_at(rule.offset + 1)?;
            Decoded::Number(f64::from(u16::from_le_bytes([lo, hi])))
        }
        DecodeKind::Flag => {
            let mask = rule.mask.unwrap_or(0xff);
            if mask == 0 {
                bail!("flag decode rule with an empty mask");
            }
            Decoded::Flag(byte_at(rule.offset)? & mask == mask)
        }
    };

    Ok(match (decoded, rule.scale) {
        (Decoded::Number(n), Some(scale)) => Decoded::Number(n * scale),
        (other, _) => other,
    })
}
