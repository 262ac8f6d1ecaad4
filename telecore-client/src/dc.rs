//! Data center addressing.
//!
//! A [`DataCenter`] is one concrete endpoint. [`DcId`] says what a request
//! is for (main traffic, uploads or downloads) and [`DcOptions`] maps that
//! to an endpoint.

use std::fmt;

// ─── DataCenter ──────────────────────────────────────────────────────────────

/// What a data center endpoint is meant to serve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DcKind {
    Regular,
    Media,
    Cdn,
}

/// One endpoint of a data center.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DataCenter {
    pub kind:    DcKind,
    pub id:      i32,
    pub address: String,
    pub port:    u16,
    /// Part of the test environment.
    pub test:    bool,
}

impl DataCenter {
    pub fn new(kind: DcKind, id: i32, address: impl Into<String>, port: u16, test: bool) -> Self {
        Self { kind, id, address: address.into(), port, test }
    }

    /// The id sent in `p_q_inner_data_dc`: `+10000` for test DCs, negated for
    /// media DCs.
    pub fn internal_id(&self) -> i32 {
        let id = if self.test { self.id + 10_000 } else { self.id };
        if self.kind == DcKind::Media { -id } else { id }
    }

    pub fn is_ipv6(&self) -> bool {
        self.address.contains(':')
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn socket_addr(&self) -> String {
        if self.is_ipv6() {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

impl fmt::Display for DataCenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DcKind::Regular => "",
            DcKind::Media   => " media",
            DcKind::Cdn     => " cdn",
        };
        let env = if self.test { " test" } else { "" };
        write!(f, "DC{}{kind}{env} ({})", self.id, self.socket_addr())
    }
}

// ─── DcId ────────────────────────────────────────────────────────────────────

/// Which connection of a pool slot group to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Shift {
    /// Least-loaded connection, opening a new one under load.
    #[default]
    Auto,
    /// A fixed slot index.
    Index(u8),
}

/// Where a request should go.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DcId {
    /// The account's home connection.
    Main,
    Upload { dc: i32, shift: Shift },
    Download { dc: i32, shift: Shift },
}

impl DcId {
    pub fn upload(dc: i32) -> Self { Self::Upload { dc, shift: Shift::Auto } }

    pub fn download(dc: i32) -> Self { Self::Download { dc, shift: Shift::Auto } }

    /// Whether requests for this purpose prefer media endpoints.
    pub fn is_media(&self) -> bool {
        !matches!(self, Self::Main)
    }
}

// ─── DcOptions ───────────────────────────────────────────────────────────────

/// The known endpoints and how to choose among them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DcOptions {
    pub options:     Vec<DataCenter>,
    pub test:        bool,
    pub prefer_ipv6: bool,
}

impl Default for DcOptions {
    fn default() -> Self { Self::default_production() }
}

impl DcOptions {
    pub fn new(options: Vec<DataCenter>, test: bool) -> Self {
        Self { options, test, prefer_ipv6: false }
    }

    /// The production endpoints shipped with the library.
    pub fn default_production() -> Self {
        use DcKind::*;
        let dc = |kind, id, addr: &str, port| DataCenter::new(kind, id, addr, port, false);
        Self::new(
            vec![
                dc(Regular, 1, "149.154.175.53", 443),
                dc(Regular, 1, "2001:b28:f23d:f001::a", 443),
                dc(Regular, 2, "149.154.167.51", 443),
                dc(Regular, 2, "2001:67c:4e8:f002::a", 443),
                dc(Media,   2, "149.154.167.151", 443),
                dc(Media,   2, "2001:67c:4e8:f002::b", 443),
                dc(Regular, 3, "149.154.175.100", 443),
                dc(Regular, 3, "2001:b28:f23d:f003::a", 443),
                dc(Regular, 4, "149.154.167.91", 443),
                dc(Regular, 4, "2001:67c:4e8:f004::a", 443),
                dc(Media,   4, "149.154.164.250", 443),
                dc(Media,   4, "2001:67c:4e8:f004::b", 443),
                dc(Regular, 5, "91.108.56.130", 443),
                dc(Regular, 5, "2001:b28:f23f:f005::a", 443),
            ],
            false,
        )
    }

    /// The test environment endpoints.
    pub fn default_test() -> Self {
        use DcKind::*;
        let dc = |kind, id, addr: &str, port| DataCenter::new(kind, id, addr, port, true);
        Self::new(
            vec![
                dc(Regular, 1, "149.154.175.10", 80),
                dc(Regular, 1, "2001:b28:f23d:f001::e", 80),
                dc(Regular, 2, "149.154.167.40", 443),
                dc(Regular, 2, "2001:67c:4e8:f002::e", 443),
                dc(Regular, 3, "149.154.175.117", 443),
                dc(Regular, 3, "2001:b28:f23d:f003::e", 443),
            ],
            true,
        )
    }

    /// Pick the best endpoint of `dc_id` for `purpose`.
    ///
    /// Main traffic prefers regular endpoints; uploads and downloads prefer
    /// media endpoints and avoid CDNs. Among equals, the configured address
    /// family wins.
    pub fn find(&self, purpose: DcId, dc_id: i32) -> Option<&DataCenter> {
        let rank = |dc: &DataCenter| -> (i32, bool) {
            let kind = if purpose.is_media() {
                match dc.kind {
                    DcKind::Media   => -2,
                    DcKind::Regular => -1,
                    DcKind::Cdn     => 2,
                }
            } else {
                match dc.kind {
                    DcKind::Regular => -1,
                    DcKind::Media   => 1,
                    DcKind::Cdn     => 2,
                }
            };
            (kind, dc.is_ipv6() != self.prefer_ipv6)
        };
        self.options
            .iter()
            .filter(|dc| dc.id == dc_id && dc.test == self.test)
            .min_by_key(|dc| rank(dc))
    }

    /// Replace the endpoint list, keeping preferences.
    pub fn replace(&mut self, options: Vec<DataCenter>) {
        self.options = options;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_id_encodes_environment_and_kind() {
        assert_eq!(DataCenter::new(DcKind::Regular, 2, "a", 443, false).internal_id(), 2);
        assert_eq!(DataCenter::new(DcKind::Media, 2, "a", 443, false).internal_id(), -2);
        assert_eq!(DataCenter::new(DcKind::Regular, 2, "a", 443, true).internal_id(), 10_002);
        assert_eq!(DataCenter::new(DcKind::Media, 2, "a", 443, true).internal_id(), -10_002);
    }

    #[test]
    fn ipv6_is_bracketed() {
        let dc = DataCenter::new(DcKind::Regular, 1, "2001:b28:f23d:f001::a", 443, false);
        assert_eq!(dc.socket_addr(), "[2001:b28:f23d:f001::a]:443");
    }

    #[test]
    fn media_preferred_for_transfers() {
        let options = DcOptions::default_production();
        assert_eq!(options.find(DcId::Main, 2).unwrap().address, "149.154.167.51");
        assert_eq!(options.find(DcId::download(2), 2).unwrap().kind, DcKind::Media);
        assert_eq!(options.find(DcId::upload(3), 3).unwrap().kind, DcKind::Regular);
        assert!(options.find(DcId::Main, 9).is_none());
    }

    #[test]
    fn ipv6_preference() {
        let mut options = DcOptions::default_test();
        assert!(!options.find(DcId::Main, 1).unwrap().is_ipv6());
        options.prefer_ipv6 = true;
        let dc = options.find(DcId::Main, 1).unwrap();
        assert!(dc.is_ipv6());
        assert_eq!(dc.port, 80);
    }
}
