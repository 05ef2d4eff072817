//! Debuggee socket addresses.
//!
//! Accepted forms:
//! - `uds://` - socket with a generated name in the temporary directory
//! - `uds://name` - socket `name` in the temporary directory
//! - `uds:/abs/path`, `uds:///abs/path` - socket at the absolute path
//! - `tcp://` - all interfaces, port chosen by the OS
//! - `tcp://host:port`, `tcp://[::1]:port`, `tcp://:port` (empty host means all interfaces)

use crate::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl SocketAddress {
    /// Host name for binding, empty host means all interfaces.
    pub fn bind_host(host: &str) -> &str {
        if host.is_empty() { "0.0.0.0" } else { host }
    }

    /// Host name for connecting, empty host means local machine.
    pub fn connect_host(host: &str) -> &str {
        if host.is_empty() { "127.0.0.1" } else { host }
    }

    fn parse_uds(raw: &str, rest: &str) -> Result<Self, Error> {
        let Some(after) = rest.strip_prefix("//") else {
            if rest.starts_with('/') {
                return Ok(SocketAddress::Unix(PathBuf::from(rest)));
            }
            return Err(Error::InvalidAddress(
                raw.to_string(),
                "unix socket path must be absolute",
            ));
        };

        let (name, path) = match after.find('/') {
            Some(idx) => after.split_at(idx),
            None => (after, ""),
        };
        match (name.is_empty(), path.is_empty()) {
            (false, false) => Err(Error::InvalidAddress(
                raw.to_string(),
                "unix socket address can not have both a name and a path",
            )),
            (false, true) => Ok(SocketAddress::Unix(std::env::temp_dir().join(name))),
            (true, false) => Ok(SocketAddress::Unix(PathBuf::from(path))),
            (true, true) => {
                let name = format!("playdap-{}", uuid::Uuid::new_v4().simple());
                Ok(SocketAddress::Unix(std::env::temp_dir().join(name)))
            }
        }
    }

    fn parse_tcp(raw: &str, rest: &str) -> Result<Self, Error> {
        let netloc = rest
            .strip_prefix("//")
            .ok_or_else(|| Error::InvalidAddress(raw.to_string(), "expected `tcp://`"))?
            .trim_end_matches('/');
        if netloc.is_empty() {
            return Ok(SocketAddress::Tcp {
                host: String::new(),
                port: 0,
            });
        }

        let (host, port) = if let Some(bracketed) = netloc.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| Error::InvalidAddress(raw.to_string(), "unterminated `[`"))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| Error::InvalidAddress(raw.to_string(), "missing port"))?;
            (host, port)
        } else {
            netloc
                .rsplit_once(':')
                .ok_or_else(|| Error::InvalidAddress(raw.to_string(), "missing port"))?
        };

        if host.contains(':') && !netloc.starts_with('[') {
            return Err(Error::InvalidAddress(
                raw.to_string(),
                "IPv6 hosts must be enclosed in `[]`",
            ));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidAddress(raw.to_string(), "invalid port"))?;
        Ok(SocketAddress::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

impl FromStr for SocketAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidAddress(s.to_string(), "missing scheme"))?;
        match scheme {
            "uds" => Self::parse_uds(s, rest),
            "tcp" => Self::parse_tcp(s, rest),
            _ => Err(Error::InvalidAddress(
                s.to_string(),
                "unsupported scheme, expected `uds` or `tcp`",
            )),
        }
    }
}

impl Display for SocketAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketAddress::Unix(path) => write!(f, "uds:{}", path.display()),
            SocketAddress::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp://[{host}]:{port}")
            }
            SocketAddress::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_valid() {
        struct TestCase {
            raw: &'static str,
            expected: SocketAddress,
        }
        let tmp = std::env::temp_dir();
        let cases = [
            TestCase {
                raw: "uds://dbg.sock",
                expected: SocketAddress::Unix(tmp.join("dbg.sock")),
            },
            TestCase {
                raw: "uds:/run/dbg.sock",
                expected: SocketAddress::Unix(PathBuf::from("/run/dbg.sock")),
            },
            TestCase {
                raw: "uds:///run/dbg.sock",
                expected: SocketAddress::Unix(PathBuf::from("/run/dbg.sock")),
            },
            TestCase {
                raw: "tcp://",
                expected: SocketAddress::Tcp {
                    host: String::new(),
                    port: 0,
                },
            },
            TestCase {
                raw: "tcp://localhost:1234",
                expected: SocketAddress::Tcp {
                    host: "localhost".to_string(),
                    port: 1234,
                },
            },
            TestCase {
                raw: "tcp://:8080",
                expected: SocketAddress::Tcp {
                    host: String::new(),
                    port: 8080,
                },
            },
            TestCase {
                raw: "tcp://[::1]:0",
                expected: SocketAddress::Tcp {
                    host: "::1".to_string(),
                    port: 0,
                },
            },
        ];

        for tc in cases {
            let addr: SocketAddress = tc.raw.parse().unwrap();
            assert_eq!(addr, tc.expected, "address: {}", tc.raw);
        }
    }

    #[test]
    fn test_auto_named_uds() {
        let a: SocketAddress = "uds://".parse().unwrap();
        let b: SocketAddress = "uds://".parse().unwrap();
        let SocketAddress::Unix(path) = &a else {
            panic!("unix address expected");
        };
        assert!(path.starts_with(std::env::temp_dir()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_invalid() {
        struct TestCase {
            raw: &'static str,
            expected_err: &'static str,
        }
        let cases = [
            TestCase {
                raw: "uds://name/path",
                expected_err: "both a name and a path",
            },
            TestCase {
                raw: "uds:relative",
                expected_err: "must be absolute",
            },
            TestCase {
                raw: "tcp://localhost",
                expected_err: "missing port",
            },
            TestCase {
                raw: "tcp://host:",
                expected_err: "invalid port",
            },
            TestCase {
                raw: "tcp://host:99999",
                expected_err: "invalid port",
            },
            TestCase {
                raw: "tcp:host:1",
                expected_err: "expected `tcp://`",
            },
            TestCase {
                raw: "tcp://[::1",
                expected_err: "unterminated",
            },
            TestCase {
                raw: "http://host:1",
                expected_err: "unsupported scheme",
            },
            TestCase {
                raw: "/tmp/sock",
                expected_err: "missing scheme",
            },
        ];

        for tc in cases {
            let err = tc.raw.parse::<SocketAddress>().unwrap_err();
            assert!(
                err.to_string().contains(tc.expected_err),
                "address: {}, error: {err}",
                tc.raw
            );
        }
    }

    #[test]
    fn test_display() {
        struct TestCase {
            addr: SocketAddress,
            expected: &'static str,
        }
        let cases = [
            TestCase {
                addr: SocketAddress::Unix(PathBuf::from("/tmp/x.sock")),
                expected: "uds:/tmp/x.sock",
            },
            TestCase {
                addr: SocketAddress::Tcp {
                    host: "127.0.0.1".to_string(),
                    port: 4000,
                },
                expected: "tcp://127.0.0.1:4000",
            },
            TestCase {
                addr: SocketAddress::Tcp {
                    host: "::1".to_string(),
                    port: 4000,
                },
                expected: "tcp://[::1]:4000",
            },
        ];
        for tc in cases {
            assert_eq!(tc.addr.to_string(), tc.expected);
            assert_eq!(tc.expected.parse::<SocketAddress>().unwrap(), tc.addr);
        }
    }
}
