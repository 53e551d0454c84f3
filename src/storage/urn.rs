// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;
use std::str::FromStr;

use data_encoding::BASE32;
use sha1::{Digest, Sha1};

const URN_PREFIX: &str = "urn:sha1:";

/// Content identifier of a shared file, written `urn:sha1:<BASE32>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha1Urn([u8; 20]);

impl Sha1Urn {
    pub fn from_digest(digest: [u8; 20]) -> Self {
        Self(digest)
    }

    pub fn of_bytes(data: &[u8]) -> Self {
        Self(Sha1::digest(data).into())
    }

    pub fn digest(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Sha1Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", URN_PREFIX, BASE32.encode(&self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrnParseError(pub String);

impl fmt::Display for UrnParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not a sha1 urn: {}", self.0)
    }
}

impl std::error::Error for UrnParseError {}

impl FromStr for Sha1Urn {
    type Err = UrnParseError;

    // The scheme is case-insensitive and so is base32 on the wire.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let encoded = match s.get(..URN_PREFIX.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(URN_PREFIX) => &s[URN_PREFIX.len()..],
            _ => return Err(UrnParseError(s.to_string())),
        };
        let decoded = BASE32
            .decode(encoded.to_ascii_uppercase().as_bytes())
            .map_err(|_| UrnParseError(s.to_string()))?;
        let digest: [u8; 20] = decoded
            .try_into()
            .map_err(|_| UrnParseError(s.to_string()))?;
        Ok(Self(digest))
    }
}
