//! Region and CIDR based admission rules for outbound connections.
//!
//! A proxy operator can confine where the proxy will connect by listing
//! *rules*: each rule is either a CIDR block (or a bare IP, which is a
//! /32 or /128) matched against the resolved target address, or a
//! free-text tag matched against the region strings a geolocation
//! database returns for that address.
//!
//! The geolocation database itself is a collaborator behind the
//! [`RegionLookup`] trait; this crate only evaluates rules.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![warn(clippy::cognitive_complexity)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![deny(clippy::unwrap_used)]

use std::net::IpAddr;

use ipnet::IpNet;

mod err;

pub use err::Error;

/// What a geolocation lookup knows about one address.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct RegionInfo {
    /// Region strings, most to least specific (e.g. country, province,
    /// city).  Free-form: whatever the database ships.
    pub regions: Vec<String>,
    /// The ISP string, when the database knows it.
    pub isp: String,
}

impl RegionInfo {
    /// Construct from parts.
    pub fn new(regions: Vec<String>, isp: impl Into<String>) -> Self {
        RegionInfo {
            regions,
            isp: isp.into(),
        }
    }
}

/// The lookup interface a geolocation database must provide.
///
/// Returning `None` means the database has no record for the address; tag
/// rules then cannot match it, CIDR rules still can.
pub trait RegionLookup: Send + Sync {
    /// Look up one address.
    fn lookup(&self, ip: IpAddr) -> Option<RegionInfo>;
}

/// A single admission rule.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum RegionRule {
    /// Match addresses inside a CIDR block.
    Cidr(IpNet),
    /// Match any region/ISP string containing this text.
    ///
    /// Matching is case-sensitive substring containment, so a tag like
    /// `"CN"` matches `"CN Shanghai"`.
    Tag(String),
}

impl RegionRule {
    /// Parse one rule token: a CIDR, a bare IP, or failing both, a tag.
    pub fn parse(token: &str) -> Result<RegionRule, Error> {
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::EmptyRule);
        }
        if let Ok(net) = token.parse::<IpNet>() {
            return Ok(RegionRule::Cidr(net));
        }
        if let Ok(ip) = token.parse::<IpAddr>() {
            return Ok(RegionRule::Cidr(IpNet::from(ip)));
        }
        Ok(RegionRule::Tag(token.to_owned()))
    }

    /// Does this rule match the address / its lookup result?
    fn matches(&self, ip: IpAddr, info: Option<&RegionInfo>) -> bool {
        match self {
            RegionRule::Cidr(net) => net.contains(&ip),
            RegionRule::Tag(tag) => info.is_some_and(|info| {
                info.regions.iter().any(|r| r.contains(tag.as_str()))
                    || info.isp.contains(tag.as_str())
            }),
        }
    }
}

/// The verdict of the region gate for one target address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Verdict {
    /// The connection may proceed.
    Admit,
    /// The connection must be refused.
    Deny,
}

/// An allow/deny rule set evaluated against resolved target addresses.
///
/// Allow has precedence: with a non-empty allow set, a target matching no
/// allow rule is denied no matter what the deny set says.
#[derive(Clone, Debug, Default)]
pub struct RegionGate {
    /// Targets admitted (when non-empty, everything else is denied).
    allow: Vec<RegionRule>,
    /// Targets refused.
    deny: Vec<RegionRule>,
}

impl RegionGate {
    /// Build a gate from raw option values.  Each value may hold several
    /// `|`-separated rule tokens.
    pub fn from_options<'a>(
        allow: impl IntoIterator<Item = &'a str>,
        deny: impl IntoIterator<Item = &'a str>,
    ) -> Result<RegionGate, Error> {
        /// Split and parse one repeatable option's values.
        fn parse_all<'a>(
            values: impl IntoIterator<Item = &'a str>,
        ) -> Result<Vec<RegionRule>, Error> {
            let mut rules = Vec::new();
            for value in values {
                for token in value.split('|').filter(|t| !t.trim().is_empty()) {
                    rules.push(RegionRule::parse(token)?);
                }
            }
            Ok(rules)
        }
        Ok(RegionGate {
            allow: parse_all(allow)?,
            deny: parse_all(deny)?,
        })
    }

    /// True if the gate has no rules and never needs a lookup.
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }

    /// Evaluate one resolved target address.
    pub fn check(&self, ip: IpAddr, db: Option<&dyn RegionLookup>) -> Verdict {
        if self.is_empty() {
            return Verdict::Admit;
        }
        let info = db.and_then(|db| db.lookup(ip));
        let info = info.as_ref();

        if !self.allow.is_empty() {
            return if self.allow.iter().any(|r| r.matches(ip, info)) {
                Verdict::Admit
            } else {
                Verdict::Deny
            };
        }
        if self.deny.iter().any(|r| r.matches(ip, info)) {
            Verdict::Deny
        } else {
            Verdict::Admit
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::collections::HashMap;

    /// An in-memory lookup table standing in for the real database.
    struct TestDb(HashMap<IpAddr, RegionInfo>);

    impl RegionLookup for TestDb {
        fn lookup(&self, ip: IpAddr) -> Option<RegionInfo> {
            self.0.get(&ip).cloned()
        }
    }

    fn db() -> TestDb {
        let mut m = HashMap::new();
        m.insert(
            "203.0.113.5".parse().unwrap(),
            RegionInfo::new(vec!["CN".into(), "Shanghai".into()], "China Telecom"),
        );
        m.insert(
            "198.51.100.9".parse().unwrap(),
            RegionInfo::new(vec!["US".into(), "Oregon".into()], "Example ISP"),
        );
        TestDb(m)
    }

    #[test]
    fn rule_parsing() {
        assert!(matches!(
            RegionRule::parse("192.168.1.0/24").unwrap(),
            RegionRule::Cidr(_)
        ));
        assert!(matches!(
            RegionRule::parse("192.168.1.2").unwrap(),
            RegionRule::Cidr(_)
        ));
        assert!(matches!(
            RegionRule::parse("2001:db8::/32").unwrap(),
            RegionRule::Cidr(_)
        ));
        assert!(matches!(
            RegionRule::parse("Shanghai").unwrap(),
            RegionRule::Tag(_)
        ));
        assert!(RegionRule::parse("  ").is_err());
    }

    #[test]
    fn empty_gate_admits_without_lookup() {
        let gate = RegionGate::default();
        assert_eq!(
            gate.check("192.0.2.1".parse().unwrap(), None),
            Verdict::Admit
        );
    }

    #[test]
    fn allow_has_precedence_over_deny() {
        // allow=CN, deny=US: a CN target is admitted, a US target and an
        // unknown target are both denied.
        let gate = RegionGate::from_options(["CN"], ["US"]).unwrap();
        let db = db();
        assert_eq!(
            gate.check("203.0.113.5".parse().unwrap(), Some(&db)),
            Verdict::Admit
        );
        assert_eq!(
            gate.check("198.51.100.9".parse().unwrap(), Some(&db)),
            Verdict::Deny
        );
        assert_eq!(
            gate.check("192.0.2.55".parse().unwrap(), Some(&db)),
            Verdict::Deny
        );
    }

    #[test]
    fn deny_only_gate() {
        let gate = RegionGate::from_options([], ["US|192.168.0.0/16"]).unwrap();
        let db = db();
        assert_eq!(
            gate.check("198.51.100.9".parse().unwrap(), Some(&db)),
            Verdict::Deny
        );
        assert_eq!(
            gate.check("192.168.3.4".parse().unwrap(), Some(&db)),
            Verdict::Deny
        );
        assert_eq!(
            gate.check("203.0.113.5".parse().unwrap(), Some(&db)),
            Verdict::Admit
        );
    }

    #[test]
    fn cidr_matches_without_database() {
        let gate = RegionGate::from_options([], ["10.0.0.0/8"]).unwrap();
        assert_eq!(
            gate.check("10.1.2.3".parse().unwrap(), None),
            Verdict::Deny
        );
        assert_eq!(
            gate.check("11.1.2.3".parse().unwrap(), None),
            Verdict::Admit
        );
    }

    #[test]
    fn isp_tag_matches() {
        let gate = RegionGate::from_options([], ["Telecom"]).unwrap();
        let db = db();
        assert_eq!(
            gate.check("203.0.113.5".parse().unwrap(), Some(&db)),
            Verdict::Deny
        );
    }

    #[test]
    fn v6_cidr() {
        let gate = RegionGate::from_options(["2001:db8::/32"], []).unwrap();
        assert_eq!(
            gate.check("2001:db8::1".parse().unwrap(), None),
            Verdict::Admit
        );
        assert_eq!(
            gate.check("2001:db9::1".parse().unwrap(), None),
            Verdict::Deny
        );
    }
}
