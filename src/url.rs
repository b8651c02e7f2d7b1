// SPDX-License-Identifier: Apache-2.0

//! `ServiceUrl`: a `<scheme>://<host>:<port>` address naming where to
//! reach (or listen for) an RPC peer.
//!
//! Only `tcp` and `unix` resolve to a real [`Transport`] in this crate.
//! `udp` and `http` parse and type-check but are rejected with
//! [`RpcError::InvalidParam`] at connect time — UDP framing and
//! HTTP/1.1 semantics are out of scope for this core.

use std::fmt;
use std::sync::Arc;

use crate::error::RpcError;
use crate::transport::{TcpTransport, Transport, UnixTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Udp,
    Unix,
    Http,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Tcp => "tcp",
            Scheme::Udp => "udp",
            Scheme::Unix => "unix",
            Scheme::Http => "http",
        })
    }
}

/// A parsed `<scheme>://<host>:<port>` address. For `unix`, `host` is
/// the socket path and `port` is unused (always `0`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl ServiceUrl {
    pub fn parse(s: &str) -> Result<Self, RpcError> {
        let (scheme_str, rest) = s
            .split_once("://")
            .ok_or_else(|| RpcError::InvalidParam(format!("missing scheme separator in {s:?}")))?;

        let scheme = match scheme_str {
            "tcp" => Scheme::Tcp,
            "udp" => Scheme::Udp,
            "unix" => Scheme::Unix,
            "http" => Scheme::Http,
            other => return Err(RpcError::InvalidParam(format!("unknown scheme {other:?}"))),
        };

        if scheme == Scheme::Unix {
            if rest.is_empty() {
                return Err(RpcError::InvalidParam("unix scheme requires a socket path".to_string()));
            }
            return Ok(ServiceUrl { scheme, host: rest.to_string(), port: 0 });
        }

        let (host, port_str) = rest
            .rsplit_once(':')
            .ok_or_else(|| RpcError::InvalidParam(format!("missing port in {s:?}")))?;
        if host.is_empty() {
            return Err(RpcError::InvalidParam(format!("missing host in {s:?}")));
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| RpcError::InvalidParam(format!("invalid port {port_str:?} in {s:?}")))?;

        Ok(ServiceUrl { scheme, host: host.to_string(), port })
    }

    /// The `host:port` (or bare path, for `unix`) pair every
    /// [`tokio`] connect/bind call actually wants.
    pub fn authority(&self) -> String {
        match self.scheme {
            Scheme::Unix => self.host.clone(),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// Opens a [`Transport`] to this address. Only `tcp` and `unix` are
    /// implemented; `udp` and `http` always fail.
    pub async fn connect(&self) -> Result<Arc<dyn Transport>, RpcError> {
        match self.scheme {
            Scheme::Tcp => Ok(Arc::new(TcpTransport::connect(&self.authority()).await?)),
            Scheme::Unix => Ok(Arc::new(UnixTransport::connect(&self.authority()).await?)),
            Scheme::Udp | Scheme::Http => {
                Err(RpcError::InvalidParam(format!("{} transport is not implemented", self.scheme)))
            },
        }
    }
}

impl fmt::Display for ServiceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Unix => write!(f, "unix://{}", self.host),
            _ => write!(f, "{}://{}:{}", self.scheme, self.host, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_tcp_url() {
        let url = ServiceUrl::parse("tcp://127.0.0.1:7500").expect("parse");
        assert_eq!(url.scheme, Scheme::Tcp);
        assert_eq!(url.host, "127.0.0.1");
        assert_eq!(url.port, 7500);
        assert_eq!(url.authority(), "127.0.0.1:7500");
    }

    #[test]
    fn parses_a_unix_url_keeping_the_whole_path() {
        let url = ServiceUrl::parse("unix:///var/run/pebble.sock").expect("parse");
        assert_eq!(url.scheme, Scheme::Unix);
        assert_eq!(url.host, "/var/run/pebble.sock");
        assert_eq!(url.authority(), "/var/run/pebble.sock");
    }

    #[test]
    fn rejects_an_unknown_scheme() {
        assert!(ServiceUrl::parse("ftp://host:21").is_err());
    }

    #[test]
    fn rejects_a_non_numeric_port() {
        assert!(ServiceUrl::parse("tcp://host:notaport").is_err());
    }

    #[tokio::test]
    async fn http_and_udp_schemes_are_parsed_but_refuse_to_connect() {
        let http = ServiceUrl::parse("http://example.com:80").expect("parse");
        assert!(http.connect().await.is_err());
        let udp = ServiceUrl::parse("udp://example.com:53").expect("parse");
        assert!(udp.connect().await.is_err());
    }
}
