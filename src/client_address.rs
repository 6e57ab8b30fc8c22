//! Client address extraction for per-client limiting.

use std::net::IpAddr;

const REAL_IP_HEADER: &str = "x-real-ip";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Anything that can name the client a request came from.
///
/// Implement this for the request type of your web framework, or use
/// [`RequestMetadata`].
pub trait ClientAddress {
    /// Client address, or an empty string when unknown.
    fn client_address(&self) -> String;
}

/// Transport metadata of a request.
///
/// The address is resolved from, in order:
///
/// 1. the `x-real-ip` header set by a trusted proxy
/// 2. the left-most entry of `x-forwarded-for`
/// 3. the peer address of the connection
///
/// Header names are matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    /// Request headers as name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Address of the connected peer.
    pub peer_addr: Option<IpAddr>,
}

impl RequestMetadata {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
    }
}

impl ClientAddress for RequestMetadata {
    fn client_address(&self) -> String {
        if let Some(real_ip) = self.header(REAL_IP_HEADER) {
            return real_ip.to_string();
        }

        if let Some(forwarded_for) = self.header(FORWARDED_FOR_HEADER)
            && let Some(first) = forwarded_for.split(',').map(str::trim).find(|s| !s.is_empty())
        {
            return first.to_string();
        }

        self.peer_addr
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }
}
