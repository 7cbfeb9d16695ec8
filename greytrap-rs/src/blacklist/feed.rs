//! Parser for spamd-format address feeds.
//!
//! Each non-empty, non-comment line is one of `a.b.c.d`, `a.b.c.d/bits` or
//! `a.b.c.d-e.f.g.h` (IPv4). Feeds are accumulated into range-endpoint
//! records and compiled into a collapsed CIDR list plus a trie-backed
//! runtime blacklist.

use super::{Blacklist, RangeKind};
use crate::error::{GreytrapError, Result};
use crate::net::{cidr_to_range, Cidr};
use std::net::Ipv4Addr;
use tracing::warn;

/// A single parsed feed line as an inclusive address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedRange {
    pub start: u32,
    pub end: u32,
}

/// Parse one feed line; `None` for blank lines and comments.
pub fn parse_line(line: &str) -> Result<Option<FeedRange>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let bad = || GreytrapError::Feed(format!("malformed feed line: {line}"));

    if let Some((addr, bits)) = line.split_once('/') {
        let addr: Ipv4Addr = addr.parse().map_err(|_| bad())?;
        let bits: u32 = bits.parse().map_err(|_| bad())?;
        if bits == 0 || bits > 32 {
            return Err(bad());
        }
        let (start, end) = cidr_to_range(&Cidr {
            addr: u32::from(addr),
            bits,
        });
        return Ok(Some(FeedRange { start, end }));
    }

    if let Some((from, to)) = line.split_once('-') {
        let from: Ipv4Addr = from.trim().parse().map_err(|_| bad())?;
        let to: Ipv4Addr = to.trim().parse().map_err(|_| bad())?;
        return Ok(Some(FeedRange {
            start: u32::from(from),
            end: u32::from(to),
        }));
    }

    let addr: Ipv4Addr = line.parse().map_err(|_| bad())?;
    Ok(Some(FeedRange {
        start: u32::from(addr),
        end: u32::from(addr),
    }))
}

/// Feed a whole text into `list`. Malformed lines are logged and skipped so
/// one bad feed entry never blanks a whole list. Returns the count loaded.
pub fn load(list: &mut Blacklist, text: &str, kind: RangeKind) -> usize {
    let mut loaded = 0;

    for line in text.lines() {
        match parse_line(line) {
            Ok(Some(range)) => {
                // The range backing takes an exclusive end.
                let end = range.end.saturating_add(1);
                list.add_range(range.start, end, kind);
                loaded += 1;
            }
            Ok(None) => {}
            Err(e) => warn!(list = %list.name, "skipping feed line: {e}"),
        }
    }

    loaded
}

/// Compile black and white feed texts into the collapsed CIDR list and a
/// trie-backed blacklist ready for accept-time matching.
pub fn compile(
    name: &str,
    message: &str,
    black_feeds: &[String],
    white_feeds: &[String],
) -> Result<(Blacklist, Vec<Cidr>)> {
    let mut ranges = Blacklist::new_ranges(name, message);

    for feed in black_feeds {
        load(&mut ranges, feed, RangeKind::Black);
    }
    for feed in white_feeds {
        load(&mut ranges, feed, RangeKind::White);
    }

    let cidrs = ranges.collapse();

    let mut runtime = Blacklist::new_trie(name, message);
    for cidr in &cidrs {
        runtime.add(&cidr.to_string())?;
    }

    Ok((runtime, cidrs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{Addr, Family};

    fn ip(s: &str) -> u32 {
        u32::from(s.parse::<Ipv4Addr>().unwrap())
    }

    #[test]
    fn test_parse_single_address() {
        let range = parse_line("192.0.2.1").unwrap().unwrap();
        assert_eq!(range.start, ip("192.0.2.1"));
        assert_eq!(range.end, ip("192.0.2.1"));
    }

    #[test]
    fn test_parse_cidr() {
        let range = parse_line("10.0.0.0/24").unwrap().unwrap();
        assert_eq!(range.start, ip("10.0.0.0"));
        assert_eq!(range.end, ip("10.0.0.255"));
    }

    #[test]
    fn test_parse_dashed_range() {
        let range = parse_line("10.0.0.5-10.0.0.9").unwrap().unwrap();
        assert_eq!(range.start, ip("10.0.0.5"));
        assert_eq!(range.end, ip("10.0.0.9"));
    }

    #[test]
    fn test_parse_comment_and_blank() {
        assert!(parse_line("# feed header").unwrap().is_none());
        assert!(parse_line("   ").unwrap().is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_line("10.0.0.0/0").is_err());
        assert!(parse_line("10.0.0.0/33").is_err());
        assert!(parse_line("10.0.0").is_err());
        assert!(parse_line("banana").is_err());
    }

    #[test]
    fn test_compile_black_minus_white() {
        let black = "10.0.0.0/24\n# spam farm\n192.0.2.1\n".to_string();
        let white = "10.0.0.128-10.0.0.255\n".to_string();

        let (runtime, cidrs) = compile("spews", "no %A", &[black], &[white]).unwrap();

        assert!(!cidrs.is_empty());
        let low = Addr::from_v4("10.0.0.5".parse().unwrap());
        let carved = Addr::from_v4("10.0.0.200".parse().unwrap());
        let single = Addr::from_v4("192.0.2.1".parse().unwrap());

        assert!(runtime.matches(&low, Family::V4));
        assert!(!runtime.matches(&carved, Family::V4));
        assert!(runtime.matches(&single, Family::V4));
    }

    #[test]
    fn test_compile_skips_bad_lines() {
        let black = "10.1.0.0/24\nnot-an-address\n10.2.0.0/24\n".to_string();
        let (runtime, _) = compile("bl", "msg", &[black], &[]).unwrap();

        let a = Addr::from_v4("10.1.0.1".parse().unwrap());
        let b = Addr::from_v4("10.2.0.1".parse().unwrap());
        assert!(runtime.matches(&a, Family::V4));
        assert!(runtime.matches(&b, Family::V4));
    }
}
