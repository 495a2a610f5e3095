//! Read-only IP range dataset: containment lookups from `[begin, end]`
//! ranges to a string payload. IPv4 keys widen to u32, IPv6 to u128; both
//! sides resolve a query with a predecessor lookup and an end comparison.

use crate::error::{ErrorKind, NetError, NetResult};
use serde_derive::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

#[derive(Debug, Default)]
pub struct IpRange {
    v4: BTreeMap<u32, (u32, String)>,
    v6: BTreeMap<u128, (u128, String)>,
}

#[derive(Debug, Deserialize)]
struct RangeRecord {
    begin: String,
    end: String,
    value: String,
}

impl IpRange {
    pub fn new() -> IpRange {
        IpRange::default()
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// Adds one range. Both ends must be the same family, begin ≤ end.
    pub fn insert(&mut self, begin: IpAddr, end: IpAddr, value: &str) -> bool {
        match (begin, end) {
            (IpAddr::V4(b), IpAddr::V4(e)) => {
                let (b, e) = (u32::from(b), u32::from(e));
                if b > e {
                    return false;
                }
                self.v4.insert(b, (e, value.to_string()));
                true
            }
            (IpAddr::V6(b), IpAddr::V6(e)) => {
                let (b, e) = (u128::from(b), u128::from(e));
                if b > e {
                    return false;
                }
                self.v6.insert(b, (e, value.to_string()));
                true
            }
            _ => false,
        }
    }

    /// Payload of the range containing `ip`, if any.
    pub fn find(&self, ip: IpAddr) -> Option<&str> {
        match ip {
            IpAddr::V4(ip) => {
                let key = u32::from(ip);
                self.v4
                    .range(..=key)
                    .next_back()
                    .filter(|(_, (end, _))| key <= *end)
                    .map(|(_, (_, value))| value.as_str())
            }
            IpAddr::V6(ip) => {
                let key = u128::from(ip);
                self.v6
                    .range(..=key)
                    .next_back()
                    .filter(|(_, (end, _))| key <= *end)
                    .map(|(_, (_, value))| value.as_str())
            }
        }
    }

    /// Loads `begin end payload` lines. Blank lines and `#` comments are
    /// skipped; anything else malformed rejects the file.
    pub fn load_text<P: AsRef<Path>>(path: P) -> NetResult<IpRange> {
        let text =
            fs::read_to_string(path).map_err(|_| NetError::Fatal(ErrorKind::ConfigInvalid))?;

        let mut ranges = IpRange::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.splitn(3, char::is_whitespace);
            let begin = fields.next().and_then(|f| f.parse::<IpAddr>().ok());
            let end = fields.next().and_then(|f| f.parse::<IpAddr>().ok());
            let value = fields.next().map(str::trim);

            match (begin, end, value) {
                (Some(begin), Some(end), Some(value)) if ranges.insert(begin, end, value) => {}
                _ => return Err(NetError::Fatal(ErrorKind::ConfigInvalid)),
            }
        }

        Ok(ranges)
    }

    /// Loads a JSON array of `{begin, end, value}` records.
    pub fn load_json<P: AsRef<Path>>(path: P) -> NetResult<IpRange> {
        let file = fs::File::open(path).map_err(|_| NetError::Fatal(ErrorKind::ConfigInvalid))?;
        let records: Vec<RangeRecord> =
            serde_json::from_reader(file).map_err(|_| NetError::Fatal(ErrorKind::ConfigInvalid))?;

        let mut ranges = IpRange::new();

        for record in records {
            let begin = record
                .begin
                .parse::<IpAddr>()
                .map_err(|_| NetError::Fatal(ErrorKind::ConfigInvalid))?;
            let end = record
                .end
                .parse::<IpAddr>()
                .map_err(|_| NetError::Fatal(ErrorKind::ConfigInvalid))?;

            if !ranges.insert(begin, end, &record.value) {
                return Err(NetError::Fatal(ErrorKind::ConfigInvalid));
            }
        }

        Ok(ranges)
    }
}

/// Convenience for tests and loaders.
pub fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}
