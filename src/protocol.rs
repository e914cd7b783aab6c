//! Closed protocol enum and its table-driven detection.
//!
//! New protocols are added by extending [`Protocol`] and the scheme table;
//! everything downstream (detection, scoring, output) is table-driven.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Shadowsocksr,
    Hysteria,
    Hysteria2,
    Tuic,
    Wireguard,
    Unknown,
}

/// URI scheme prefixes per protocol, used for detection and content scanning.
/// Longer prefixes come first so `hysteria2://` and `ssr://` are not shadowed.
const SCHEMES: &[(Protocol, &str)] = &[
    (Protocol::Vmess, "vmess://"),
    (Protocol::Vless, "vless://"),
    (Protocol::Trojan, "trojan://"),
    (Protocol::Shadowsocksr, "ssr://"),
    (Protocol::Shadowsocks, "ss://"),
    (Protocol::Shadowsocks, "shadowsocks://"),
    (Protocol::Hysteria2, "hysteria2://"),
    (Protocol::Hysteria, "hysteria://"),
    (Protocol::Tuic, "tuic://"),
    (Protocol::Wireguard, "wireguard://"),
];

impl Protocol {
    /// Detect the protocol from a (whitespace-trimmed) URI, case-insensitive.
    pub fn from_uri(uri: &str) -> Self {
        let lower = uri.trim().to_ascii_lowercase();
        for (protocol, scheme) in SCHEMES {
            if lower.starts_with(scheme) {
                return *protocol;
            }
        }
        Protocol::Unknown
    }

    /// Canonical URI scheme for this protocol, e.g. `vmess://`.
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess://",
            Protocol::Vless => "vless://",
            Protocol::Trojan => "trojan://",
            Protocol::Shadowsocks => "ss://",
            Protocol::Shadowsocksr => "ssr://",
            Protocol::Hysteria => "hysteria://",
            Protocol::Hysteria2 => "hysteria2://",
            Protocol::Tuic => "tuic://",
            Protocol::Wireguard => "wireguard://",
            Protocol::Unknown => "",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Shadowsocksr => "shadowsocksr",
            Protocol::Hysteria => "hysteria",
            Protocol::Hysteria2 => "hysteria2",
            Protocol::Tuic => "tuic",
            Protocol::Wireguard => "wireguard",
            Protocol::Unknown => "unknown",
        }
    }

    /// Base quality preference used by the configuration processor.
    pub fn base_quality(&self) -> f64 {
        match self {
            Protocol::Vless => 0.9,
            Protocol::Trojan => 0.85,
            Protocol::Vmess | Protocol::Tuic => 0.8,
            Protocol::Hysteria | Protocol::Hysteria2 => 0.75,
            Protocol::Shadowsocks => 0.7,
            Protocol::Shadowsocksr => 0.6,
            _ => 0.5,
        }
    }

    /// Every concrete protocol the detector knows, in scan order.
    pub fn all() -> impl Iterator<Item = Protocol> {
        [
            Protocol::Vmess,
            Protocol::Vless,
            Protocol::Trojan,
            Protocol::Shadowsocks,
            Protocol::Shadowsocksr,
            Protocol::Hysteria,
            Protocol::Hysteria2,
            Protocol::Tuic,
            Protocol::Wireguard,
        ]
        .into_iter()
    }

    /// All scheme prefixes, used when scanning source payloads.
    pub fn schemes() -> impl Iterator<Item = (Protocol, &'static str)> {
        SCHEMES.iter().copied()
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_each_scheme() {
        assert_eq!(Protocol::from_uri("vmess://abc"), Protocol::Vmess);
        assert_eq!(Protocol::from_uri("vless://abc"), Protocol::Vless);
        assert_eq!(Protocol::from_uri("trojan://abc"), Protocol::Trojan);
        assert_eq!(Protocol::from_uri("ss://abc"), Protocol::Shadowsocks);
        assert_eq!(Protocol::from_uri("shadowsocks://abc"), Protocol::Shadowsocks);
        assert_eq!(Protocol::from_uri("ssr://abc"), Protocol::Shadowsocksr);
        assert_eq!(Protocol::from_uri("hysteria://abc"), Protocol::Hysteria);
        assert_eq!(Protocol::from_uri("hysteria2://abc"), Protocol::Hysteria2);
        assert_eq!(Protocol::from_uri("tuic://abc"), Protocol::Tuic);
        assert_eq!(Protocol::from_uri("wireguard://abc"), Protocol::Wireguard);
    }

    #[test]
    fn detection_is_case_insensitive_and_trims() {
        assert_eq!(Protocol::from_uri("  VMess://abc  "), Protocol::Vmess);
        assert_eq!(Protocol::from_uri("SS://abc"), Protocol::Shadowsocks);
    }

    #[test]
    fn ssr_is_not_shadowed_by_ss() {
        assert_eq!(Protocol::from_uri("ssr://x"), Protocol::Shadowsocksr);
    }

    #[test]
    fn hysteria2_is_not_shadowed_by_hysteria() {
        assert_eq!(Protocol::from_uri("hysteria2://x"), Protocol::Hysteria2);
    }

    #[test]
    fn unrecognized_scheme_is_unknown() {
        assert_eq!(Protocol::from_uri("socks5://abc"), Protocol::Unknown);
        assert_eq!(Protocol::from_uri("garbage"), Protocol::Unknown);
    }

    #[test]
    fn quality_table_matches_preference_order() {
        assert_eq!(Protocol::Vless.base_quality(), 0.9);
        assert_eq!(Protocol::Trojan.base_quality(), 0.85);
        assert_eq!(Protocol::Vmess.base_quality(), 0.8);
        assert_eq!(Protocol::Tuic.base_quality(), 0.8);
        assert_eq!(Protocol::Hysteria.base_quality(), 0.75);
        assert_eq!(Protocol::Shadowsocks.base_quality(), 0.7);
        assert_eq!(Protocol::Shadowsocksr.base_quality(), 0.6);
        assert_eq!(Protocol::Unknown.base_quality(), 0.5);
    }
}
