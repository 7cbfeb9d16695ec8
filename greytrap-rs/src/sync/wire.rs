//! Sync datagram codec.
//!
//! A datagram is a fixed header followed by TLVs terminated by an `END`
//! TLV. All integers are network byte order; TLV lengths are rounded up to
//! 4-byte alignment. The HMAC-SHA1 is computed over the whole datagram with
//! the HMAC field zeroed, keyed by the SHA1 digest of the shared key file.

use crate::error::{GreytrapError, Result};
use ring::{digest, hmac};
use std::net::Ipv4Addr;

pub const SYNC_VERSION: u8 = 1;
pub const SYNC_AF_INET: u8 = 4;
pub const SYNC_HMAC_LEN: usize = 20;
pub const SYNC_HEADER_LEN: usize = 32;
pub const SYNC_MAXSIZE: usize = 1408;
pub const SYNC_ALIGN: usize = 4;

pub const TLV_END: u16 = 0;
pub const TLV_GREY: u16 = 1;
pub const TLV_WHITE: u16 = 2;
pub const TLV_TRAPPED: u16 = 3;

const HMAC_OFFSET: usize = 8;

/// One replicated update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncUpdate {
    Grey {
        timestamp: u32,
        ip: Ipv4Addr,
        from: String,
        to: String,
        helo: String,
    },
    White {
        timestamp: u32,
        expire: u32,
        ip: Ipv4Addr,
    },
    Trapped {
        timestamp: u32,
        expire: u32,
        ip: Ipv4Addr,
    },
}

/// Derive the wire HMAC key from the raw key-file contents.
pub fn derive_key(key_file_contents: &[u8]) -> hmac::Key {
    let digest = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, key_file_contents);
    hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, digest.as_ref())
}

fn align(len: usize) -> usize {
    (len + SYNC_ALIGN - 1) & !(SYNC_ALIGN - 1)
}

/// Encode one datagram carrying `updates`, stamped with `counter` and
/// authenticated with `key`.
pub fn encode(updates: &[SyncUpdate], counter: u32, key: &hmac::Key) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; SYNC_HEADER_LEN];

    for update in updates {
        match update {
            SyncUpdate::Grey {
                timestamp,
                ip,
                from,
                to,
                helo,
            } => {
                let payload = 18 + from.len() + to.len() + helo.len();
                let total = align(payload);
                buf.extend_from_slice(&TLV_GREY.to_be_bytes());
                buf.extend_from_slice(&(total as u16).to_be_bytes());
                buf.extend_from_slice(&timestamp.to_be_bytes());
                buf.extend_from_slice(&u32::from(*ip).to_be_bytes());
                buf.extend_from_slice(&(from.len() as u16).to_be_bytes());
                buf.extend_from_slice(&(to.len() as u16).to_be_bytes());
                buf.extend_from_slice(&(helo.len() as u16).to_be_bytes());
                buf.extend_from_slice(from.as_bytes());
                buf.extend_from_slice(to.as_bytes());
                buf.extend_from_slice(helo.as_bytes());
                buf.resize(buf.len() + total - payload, 0);
            }
            SyncUpdate::White {
                timestamp,
                expire,
                ip,
            }
            | SyncUpdate::Trapped {
                timestamp,
                expire,
                ip,
            } => {
                let tlv_type = match update {
                    SyncUpdate::White { .. } => TLV_WHITE,
                    _ => TLV_TRAPPED,
                };
                buf.extend_from_slice(&tlv_type.to_be_bytes());
                buf.extend_from_slice(&16u16.to_be_bytes());
                buf.extend_from_slice(&timestamp.to_be_bytes());
                buf.extend_from_slice(&expire.to_be_bytes());
                buf.extend_from_slice(&u32::from(*ip).to_be_bytes());
            }
        }
    }

    // Terminating END TLV.
    buf.extend_from_slice(&TLV_END.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());

    if buf.len() > SYNC_MAXSIZE {
        return Err(GreytrapError::Sync("datagram too large".to_string()));
    }

    buf[0] = SYNC_VERSION;
    buf[1] = SYNC_AF_INET;
    let len = buf.len() as u16;
    buf[2..4].copy_from_slice(&len.to_be_bytes());
    buf[4..8].copy_from_slice(&counter.to_be_bytes());

    let tag = hmac::sign(key, &buf);
    buf[HMAC_OFFSET..HMAC_OFFSET + SYNC_HMAC_LEN].copy_from_slice(tag.as_ref());

    Ok(buf)
}

/// Decode a datagram, verifying its HMAC when `verify` is set. Returns the
/// sender's counter and the carried updates.
pub fn decode(buf: &[u8], key: &hmac::Key, verify: bool) -> Result<(u32, Vec<SyncUpdate>)> {
    if buf.len() < SYNC_HEADER_LEN {
        return Err(GreytrapError::Sync("short datagram".to_string()));
    }
    if buf[0] != SYNC_VERSION {
        return Err(GreytrapError::Sync(format!("bad version {}", buf[0])));
    }

    let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if length != buf.len() {
        return Err(GreytrapError::Sync("length mismatch".to_string()));
    }
    let counter = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

    if verify {
        let mut zeroed = buf.to_vec();
        zeroed[HMAC_OFFSET..HMAC_OFFSET + SYNC_HMAC_LEN].fill(0);
        let tag = &buf[HMAC_OFFSET..HMAC_OFFSET + SYNC_HMAC_LEN];
        hmac::verify(key, &zeroed, tag)
            .map_err(|_| GreytrapError::Sync("hmac mismatch".to_string()))?;
    }

    let mut updates = Vec::new();
    let mut pos = SYNC_HEADER_LEN;

    loop {
        if pos + 4 > buf.len() {
            return Err(GreytrapError::Sync("truncated tlv header".to_string()));
        }
        let tlv_type = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let tlv_len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;

        if tlv_type == TLV_END {
            return Ok((counter, updates));
        }
        if tlv_len < 4 || pos + tlv_len > buf.len() {
            return Err(GreytrapError::Sync("malformed tlv length".to_string()));
        }

        let body = &buf[pos..pos + tlv_len];
        match tlv_type {
            TLV_GREY => updates.push(decode_grey(body)?),
            TLV_WHITE | TLV_TRAPPED => {
                if tlv_len < 16 {
                    return Err(GreytrapError::Sync("short address tlv".to_string()));
                }
                let timestamp = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
                let expire = u32::from_be_bytes([body[8], body[9], body[10], body[11]]);
                let ip = Ipv4Addr::from(u32::from_be_bytes([
                    body[12], body[13], body[14], body[15],
                ]));
                updates.push(if tlv_type == TLV_WHITE {
                    SyncUpdate::White {
                        timestamp,
                        expire,
                        ip,
                    }
                } else {
                    SyncUpdate::Trapped {
                        timestamp,
                        expire,
                        ip,
                    }
                });
            }
            _ => {
                // Unknown TLV types are skipped for forward compatibility.
            }
        }

        pos += align(tlv_len);
    }
}

fn decode_grey(body: &[u8]) -> Result<SyncUpdate> {
    if body.len() < 18 {
        return Err(GreytrapError::Sync("short grey tlv".to_string()));
    }

    let timestamp = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
    let ip = Ipv4Addr::from(u32::from_be_bytes([body[8], body[9], body[10], body[11]]));
    let from_len = u16::from_be_bytes([body[12], body[13]]) as usize;
    let to_len = u16::from_be_bytes([body[14], body[15]]) as usize;
    let helo_len = u16::from_be_bytes([body[16], body[17]]) as usize;

    let strings = &body[18..];
    if strings.len() < from_len + to_len + helo_len {
        return Err(GreytrapError::Sync("grey tlv strings overrun".to_string()));
    }

    let text = |range: std::ops::Range<usize>| -> Result<String> {
        std::str::from_utf8(&strings[range])
            .map(str::to_string)
            .map_err(|_| GreytrapError::Sync("grey tlv bad utf-8".to_string()))
    };

    Ok(SyncUpdate::Grey {
        timestamp,
        ip,
        from: text(0..from_len)?,
        to: text(from_len..from_len + to_len)?,
        helo: text(from_len + to_len..from_len + to_len + helo_len)?,
    })
}
