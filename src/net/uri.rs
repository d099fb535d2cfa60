//! URI handling for peers, listeners and streams.
//!
//! Grammar: `scheme://[user@]host[:port][/path][?query]`. The scheme picks
//! the concrete transport or stream variant; known query keys are `name`,
//! `channels` (comma-separated channel names), `codec` and `bitrate`.

use std::collections::HashMap;

use url::Url;

use crate::errors::Error;
use crate::protocol::{Channel, ChannelSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Tcp,
    Ws,
    Wss,
    File,
    Ftl,
}

impl Scheme {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
            Scheme::File => "file",
            Scheme::Ftl => "ftl",
        }
    }

    /// Whether the transport is TLS-wrapped.
    #[must_use]
    pub fn secure(self) -> bool {
        matches!(self, Scheme::Wss)
    }

    fn default_port(self) -> u16 {
        match self {
            Scheme::Tcp => 9001,
            Scheme::Ws => 80,
            Scheme::Wss => 443,
            Scheme::File | Scheme::Ftl => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetUri {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    query: HashMap<String, String>,
    raw: String,
}

impl NetUri {
    pub fn parse(input: &str) -> Result<NetUri, Error> {
        let parsed = Url::parse(input).map_err(|_| Error::BadUri(input.to_owned()))?;
        let scheme = match parsed.scheme() {
            "tcp" => Scheme::Tcp,
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            "file" => Scheme::File,
            "ftl" => Scheme::Ftl,
            _ => return Err(Error::BadUri(input.to_owned())),
        };

        let host = parsed.host_str().unwrap_or_default().to_owned();
        if host.is_empty() && scheme != Scheme::File {
            return Err(Error::BadUri(input.to_owned()));
        }
        if scheme == Scheme::File && parsed.path().is_empty() {
            return Err(Error::BadUri(input.to_owned()));
        }

        let query = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        Ok(NetUri {
            scheme,
            host,
            port: parsed.port().unwrap_or_else(|| scheme.default_port()),
            path: parsed.path().to_owned(),
            query,
            raw: input.to_owned(),
        })
    }

    /// The full URI as given.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Canonical form without the query: the key used in stream and
    /// listener tables.
    #[must_use]
    pub fn base(&self) -> String {
        match self.scheme {
            Scheme::File => format!("file://{}", self.path),
            Scheme::Ftl => {
                let path = if self.path == "/" { "" } else { &self.path };
                format!("ftl://{}{}", self.host, path)
            }
            _ => format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port),
        }
    }

    /// `host:port` for socket binding and connecting.
    #[must_use]
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn secure(&self) -> bool {
        self.scheme.secure()
    }

    #[must_use]
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// The `channels` query key parsed into a set. Unknown names are
    /// dropped.
    #[must_use]
    pub fn channels(&self) -> ChannelSet {
        self.query("channels")
            .map(|list| {
                list.split(',')
                    .map(Channel::from_name)
                    .filter(|c| *c != Channel::NONE)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_with_port() {
        let uri = NetUri::parse("tcp://localhost:9000").expect("parse");
        assert_eq!(uri.scheme, Scheme::Tcp);
        assert_eq!(uri.host, "localhost");
        assert_eq!(uri.port, 9000);
        assert_eq!(uri.socket_addr(), "localhost:9000");
        assert_eq!(uri.base(), "tcp://localhost:9000");
        assert!(!uri.secure());
    }

    #[test]
    fn default_ports_by_scheme() {
        assert_eq!(NetUri::parse("tcp://h").expect("tcp").port, 9001);
        assert_eq!(NetUri::parse("ws://h").expect("ws").port, 80);
        let wss = NetUri::parse("wss://h").expect("wss");
        assert_eq!(wss.port, 443);
        assert!(wss.secure());
    }

    #[test]
    fn ftl_names_and_queries() {
        let uri = NetUri::parse("ftl://demo?channels=colour,depth&bitrate=2000").expect("parse");
        assert_eq!(uri.scheme, Scheme::Ftl);
        assert_eq!(uri.base(), "ftl://demo");
        assert_eq!(uri.query("bitrate"), Some("2000"));
        let channels = uri.channels();
        assert!(channels.contains(Channel::COLOUR));
        assert!(channels.contains(Channel::DEPTH));
        assert_eq!(channels.len(), 2);
    }

    #[test]
    fn file_uris_keep_the_path() {
        let uri = NetUri::parse("file:///tmp/capture.ftl").expect("parse");
        assert_eq!(uri.scheme, Scheme::File);
        assert_eq!(uri.path, "/tmp/capture.ftl");
        assert_eq!(uri.base(), "file:///tmp/capture.ftl");
    }

    #[test]
    fn bad_uris_are_rejected() {
        assert!(matches!(NetUri::parse("not a uri"), Err(Error::BadUri(_))));
        assert!(matches!(
            NetUri::parse("device://cam0"),
            Err(Error::BadUri(_))
        ));
        assert!(matches!(NetUri::parse("tcp://"), Err(Error::BadUri(_))));
    }
}
