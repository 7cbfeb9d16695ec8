//! Blacklists: named address sets with a rejection message.
//!
//! Two backings are used at different stages. During compilation a list of
//! signed range-endpoint records supports overlap resolution between black
//! and white feeds; at SMTP-accept time a radix trie answers membership for
//! each new connection.

pub mod feed;

use crate::net::trie::{AddrTrie, TrieEntry};
use crate::net::{match_addr, range_to_cidr_list, str_to_addr_mask, Addr, Cidr, Family};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    Black,
    White,
}

/// One endpoint record: signed deltas opening (+1) or closing (-1) a range.
#[derive(Debug, Clone, Copy)]
struct RangeEntry {
    addr: u32,
    black: i32,
    white: i32,
}

enum Backing {
    /// Compilation backing: unsorted endpoint records.
    Ranges(Vec<RangeEntry>),
    /// Runtime backing: address trie plus plain entries for list matching.
    Trie {
        trie: AddrTrie,
        entries: Vec<TrieEntry>,
    },
}

pub struct Blacklist {
    pub name: String,
    pub message: String,
    backing: Backing,
}

impl Blacklist {
    /// A compilation blacklist backed by range-endpoint records.
    pub fn new_ranges(name: &str, message: &str) -> Self {
        Blacklist {
            name: name.to_string(),
            message: message.to_string(),
            backing: Backing::Ranges(Vec::new()),
        }
    }

    /// A runtime blacklist backed by the address trie.
    pub fn new_trie(name: &str, message: &str) -> Self {
        Blacklist {
            name: name.to_string(),
            message: message.to_string(),
            backing: Backing::Trie {
                trie: AddrTrie::new(),
                entries: Vec::new(),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.backing {
            Backing::Ranges(entries) => entries.is_empty(),
            Backing::Trie { entries, .. } => entries.is_empty(),
        }
    }

    /// Record an address range. `end` is exclusive, as produced by the feed
    /// parser. Black ranges open coverage, white ranges cancel it.
    pub fn add_range(&mut self, start: u32, end: u32, kind: RangeKind) {
        if start >= end {
            return;
        }

        let entries = match &mut self.backing {
            Backing::Ranges(entries) => entries,
            Backing::Trie { .. } => return,
        };

        let (black, white) = match kind {
            RangeKind::Black => (1, 0),
            RangeKind::White => (0, 1),
        };

        entries.push(RangeEntry {
            addr: start,
            black,
            white,
        });
        entries.push(RangeEntry {
            addr: end,
            black: -black,
            white: -white,
        });
    }

    /// Insert a single "addr/bits" record into the trie backing.
    pub fn add(&mut self, address: &str) -> crate::error::Result<()> {
        let (addr, mask, _, family) = str_to_addr_mask(address)?;
        let entry = TrieEntry { family, addr, mask };

        if let Backing::Trie { trie, entries } = &mut self.backing {
            trie.insert(entry);
            entries.push(entry);
        }

        Ok(())
    }

    /// Membership test for a source address.
    pub fn matches(&self, addr: &Addr, family: Family) -> bool {
        match &self.backing {
            Backing::Trie { trie, .. } => trie.contains(addr, family),
            Backing::Ranges(_) => false,
        }
    }

    /// Linear scan over plain entries, used where the sweep has not run.
    pub fn matches_any_entry(&self, addr: &Addr, family: Family) -> bool {
        match &self.backing {
            Backing::Trie { entries, .. } => entries
                .iter()
                .filter(|e| e.family == family)
                .any(|e| match_addr(&e.addr, &e.mask, addr, family)),
            Backing::Ranges(_) => false,
        }
    }

    /// Collapse the recorded ranges into a minimal CIDR list covering
    /// exactly the black-and-not-white regions.
    ///
    /// Stable-sorts endpoints by address, then sweeps keeping running counts
    /// of open black and white ranges; a region is emitted for every
    /// interval where blacks are open and no white is.
    pub fn collapse(&mut self) -> Vec<Cidr> {
        let entries = match &mut self.backing {
            Backing::Ranges(entries) => entries,
            Backing::Trie { .. } => return Vec::new(),
        };

        if entries.is_empty() {
            return Vec::new();
        }

        entries.sort_by_key(|e| e.addr);

        let mut cidrs = Vec::new();
        let mut bs = 0i32;
        let mut ws = 0i32;
        let mut state = false;
        let mut bstart = 0u32;

        let mut i = 0;
        while i < entries.len() {
            let laststate = state;
            let addr = entries[i].addr;

            while i < entries.len() && entries[i].addr == addr {
                bs += entries[i].black;
                ws += entries[i].white;
                i += 1;
            }

            state = bs > 0 && ws == 0;

            if !laststate && state {
                bstart = addr;
            }

            if laststate && !state {
                cidrs.extend(range_to_cidr_list(bstart, addr - 1));
            }
        }

        cidrs
    }
}
