// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::storage::Sha1Urn;

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, MutexGuard};

const DEFAULT_PORT: u16 = 6346;
const MAX_LOCS_PER_URN: usize = 100;

/// Other peers known to serve the same content.
pub trait AltLocStore: Send + Sync {
    fn has_alt_locs(&self, urn: &Sha1Urn) -> bool;
    fn alt_locs(&self, urn: &Sha1Urn, limit: usize) -> Vec<SocketAddr>;
    fn add(&self, urn: &Sha1Urn, addr: SocketAddr);
}

#[derive(Debug, Default)]
pub struct AltLocTable {
    locs: Mutex<HashMap<Sha1Urn, VecDeque<SocketAddr>>>,
}

impl AltLocTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Sha1Urn, VecDeque<SocketAddr>>> {
        match self.locs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl AltLocStore for AltLocTable {
    fn has_alt_locs(&self, urn: &Sha1Urn) -> bool {
        self.lock().get(urn).is_some_and(|locs| !locs.is_empty())
    }

    /// Most recently learned first.
    fn alt_locs(&self, urn: &Sha1Urn, limit: usize) -> Vec<SocketAddr> {
        self.lock()
            .get(urn)
            .map(|locs| locs.iter().rev().take(limit).copied().collect())
            .unwrap_or_default()
    }

    fn add(&self, urn: &Sha1Urn, addr: SocketAddr) {
        let mut table = self.lock();
        let locs = table.entry(*urn).or_default();
        if let Some(i) = locs.iter().position(|known| *known == addr) {
            locs.remove(i);
        }
        if locs.len() == MAX_LOCS_PER_URN {
            locs.pop_front();
        }
        locs.push_back(addr);
    }
}

/// Parses an `X-Alt` value: comma-separated `ip[:port]` entries. Entries
/// that are not plain addresses (push locations, garbage) are skipped.
pub fn parse_x_alt(value: &str) -> Vec<SocketAddr> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            entry
                .parse::<SocketAddr>()
                .ok()
                .or_else(|| {
                    entry
                        .parse::<IpAddr>()
                        .ok()
                        .map(|ip| SocketAddr::new(ip, DEFAULT_PORT))
                })
        })
        .collect()
}

pub fn format_x_alt(locs: &[SocketAddr]) -> String {
    locs.iter()
        .map(|addr| {
            if addr.port() == DEFAULT_PORT {
                addr.ip().to_string()
            } else {
                addr.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_table_dedups_and_returns_newest_first() {
        let table = AltLocTable::new();
        let urn = Sha1Urn::of_bytes(b"file");
        assert!(!table.has_alt_locs(&urn));

        table.add(&urn, addr("1.1.1.1:6346"));
        table.add(&urn, addr("2.2.2.2:7000"));
        table.add(&urn, addr("1.1.1.1:6346"));

        assert!(table.has_alt_locs(&urn));
        assert_eq!(
            table.alt_locs(&urn, 10),
            vec![addr("1.1.1.1:6346"), addr("2.2.2.2:7000")]
        );
        assert_eq!(table.alt_locs(&urn, 1).len(), 1);
        assert!(table.alt_locs(&Sha1Urn::of_bytes(b"other"), 10).is_empty());
    }

    #[test]
    fn test_table_caps_entries_per_urn() {
        let table = AltLocTable::new();
        let urn = Sha1Urn::of_bytes(b"popular");
        for port in 0..(MAX_LOCS_PER_URN as u16 + 5) {
            table.add(&urn, SocketAddr::new("9.9.9.9".parse().unwrap(), 1000 + port));
        }
        let locs = table.alt_locs(&urn, usize::MAX);
        assert_eq!(locs.len(), MAX_LOCS_PER_URN);
        assert!(!locs.contains(&addr("9.9.9.9:1000")));
    }

    #[test]
    fn test_x_alt_parse_and_format() {
        let parsed = parse_x_alt("1.2.3.4, 5.6.7.8:6347, tls=ff, ,10.0.0.1:bad");
        assert_eq!(parsed, vec![addr("1.2.3.4:6346"), addr("5.6.7.8:6347")]);
        assert_eq!(format_x_alt(&parsed), "1.2.3.4, 5.6.7.8:6347");
    }
}
