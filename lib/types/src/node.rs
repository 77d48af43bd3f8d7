/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A 20-byte content-derived changeset identifier.
///
/// The identity of a changeset across repositories. The local sequence
/// number (rev) is only meaningful inside one repository instance and is
/// never used for identity.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Node([u8; Node::LEN]);

/// The "null" node. Used as the working copy parent of an empty checkout.
pub const NULL_ID: Node = Node([0; Node::LEN]);

#[derive(Debug, Error)]
#[error("expect {0} bytes but got {1}")]
pub struct LengthMismatchError(usize, usize);

#[derive(Debug, Error)]
#[error("{0:?} is not a {1}-byte hex string")]
pub struct HexError(String, usize);

impl Node {
    pub const LEN: usize = 20;

    pub const fn len() -> usize {
        Self::LEN
    }

    pub const fn hex_len() -> usize {
        Self::LEN * 2
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, LengthMismatchError> {
        if bytes.len() != Self::LEN {
            return Err(LengthMismatchError(Self::LEN, bytes.len()));
        }
        let mut fixed = [0u8; Self::LEN];
        fixed.copy_from_slice(bytes);
        Ok(Node(fixed))
    }

    pub const fn from_byte_array(bytes: [u8; Self::LEN]) -> Self {
        Node(bytes)
    }

    pub fn into_byte_array(self) -> [u8; Self::LEN] {
        self.0
    }

    pub fn is_null(&self) -> bool {
        *self == NULL_ID
    }

    pub fn to_hex(&self) -> String {
        const HEX_CHARS: &[u8] = b"0123456789abcdef";
        let mut v = Vec::with_capacity(Self::hex_len());
        for &byte in self.0.iter() {
            v.push(HEX_CHARS[(byte >> 4) as usize]);
            v.push(HEX_CHARS[(byte & 0xf) as usize]);
        }
        String::from_utf8(v).expect("hex is utf-8")
    }

    /// The first 12 hex characters. Enough to identify a changeset in
    /// user-facing paths and messages.
    pub fn to_short_hex(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }

    pub fn from_hex(hex: &[u8]) -> Result<Self, HexError> {
        let err = || HexError(String::from_utf8_lossy(hex).into_owned(), Self::hex_len());
        if hex.len() != Self::hex_len() {
            return Err(err());
        }
        let mut bytes = [0u8; Self::LEN];
        for (i, chunk) in hex.chunks_exact(2).enumerate() {
            let high = (chunk[0] as char).to_digit(16).ok_or_else(err)?;
            let low = (chunk[1] as char).to_digit(16).ok_or_else(err)?;
            bytes[i] = ((high << 4) | low) as u8;
        }
        Ok(Node(bytes))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Node({:?})", self.to_hex())
    }
}

impl AsRef<[u8]> for Node {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; Node::LEN]> for Node {
    fn from(bytes: [u8; Node::LEN]) -> Self {
        Node(bytes)
    }
}

impl FromStr for Node {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, HexError> {
        Self::from_hex(s.as_bytes())
    }
}

#[cfg(any(test, feature = "for-tests"))]
impl quickcheck::Arbitrary for Node {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let mut bytes = [0u8; Node::LEN];
        for b in bytes.iter_mut() {
            *b = u8::arbitrary(g);
        }
        Node(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let node = Node::from_byte_array([0xab; Node::LEN]);
        assert_eq!(node.to_hex(), "ab".repeat(Node::LEN));
        assert_eq!(Node::from_hex(node.to_hex().as_bytes()).unwrap(), node);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(Node::from_hex(b"abcd").is_err());
        assert!(Node::from_hex("xy".repeat(Node::LEN).as_bytes()).is_err());
    }

    #[test]
    fn test_short_hex() {
        let node = Node::from_byte_array([0x12; Node::LEN]);
        assert_eq!(node.to_short_hex(), "121212121212");
    }

    #[test]
    fn test_null() {
        assert!(NULL_ID.is_null());
        assert!(!Node::from_byte_array([1; Node::LEN]).is_null());
    }

    #[test]
    fn test_from_slice() {
        assert!(Node::from_slice(&[0u8; 19]).is_err());
        assert!(Node::from_slice(&[0u8; 20]).is_ok());
    }
}
