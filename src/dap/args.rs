//! `launch` and `attach` request arguments.

use crate::error::Error;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

/// Default time to wait for a debuggee connection.
pub const DEFAULT_CONNECT_TIMEOUT: f64 = 5.0;

fn default_connect_timeout() -> f64 {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_runner() -> Vec<String> {
    vec!["playdap-debuggee".to_string()]
}

fn default_listen_address() -> String {
    "uds://".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathMapping {
    pub local_root: String,
    pub remote_root: String,
}

/// Terminal the client spawns the debuggee in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Console {
    #[default]
    IntegratedTerminal,
    ExternalTerminal,
}

impl Console {
    /// `kind` value of a `runInTerminal` request.
    pub fn kind(self) -> &'static str {
        match self {
            Console::IntegratedTerminal => "integrated",
            Console::ExternalTerminal => "external",
        }
    }
}

/// How the debuggee server certificate is checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum TlsVerification {
    /// Check against bundled trust anchors.
    #[default]
    Verify,
    /// No certificate and hostname checks at all.
    Ignore,
    /// Check against CA certificates from a PEM file.
    CaFile(PathBuf),
}

impl From<String> for TlsVerification {
    fn from(value: String) -> Self {
        match value.as_str() {
            "verify" => TlsVerification::Verify,
            "ignore" => TlsVerification::Ignore,
            _ => TlsVerification::CaFile(PathBuf::from(value)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachMode {
    /// Connect to a debuggee that listens.
    #[default]
    Connect,
    /// Listen and wait until the debuggee connects.
    Listen,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchArguments {
    pub playbook: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Environment overrides, `null` removes a variable.
    #[serde(default)]
    pub env: IndexMap<String, Option<String>>,
    #[serde(default)]
    pub console: Console,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,
    #[serde(default)]
    pub path_mappings: Vec<PathMapping>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Command prefix that starts the debuggee.
    #[serde(default = "default_runner")]
    pub runner: Vec<String>,
    /// Address the adapter listens on for the debuggee connection.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
}

impl LaunchArguments {
    pub fn from_value(arguments: &Value) -> Result<Self, Error> {
        let args: Self = parse(arguments)?;
        if args.playbook.is_empty() {
            return Err(Error::MissingArgument("launch", "playbook"));
        }
        if args.runner.is_empty() {
            return Err(Error::InvalidConfiguration("runner must not be empty".into()));
        }
        Ok(args)
    }

    pub fn connect_timeout(&self) -> Result<Duration, Error> {
        timeout_from_secs(self.connect_timeout)
    }

    /// Command line the client has to run to start the debuggee, the debuggee
    /// connects back to `address`.
    pub fn command_line(&self, address: &str) -> Vec<String> {
        let mut cmd = self.runner.clone();
        cmd.push("--connect".to_string());
        cmd.push(address.to_string());
        if let Some(log_file) = &self.log_file {
            cmd.push("--log-file".to_string());
            cmd.push(log_file.display().to_string());
            cmd.push("--log-level".to_string());
            cmd.push(self.log_level.clone());
        }
        cmd.push(self.playbook.clone());
        cmd.extend(self.args.iter().cloned());
        cmd
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachArguments {
    #[serde(default)]
    pub process_id: Option<u32>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub mode: AttachMode,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub tls_verification: TlsVerification,
    #[serde(default)]
    pub tls_certificate: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
    #[serde(default)]
    pub path_mappings: Vec<PathMapping>,
}

impl AttachArguments {
    pub fn from_value(arguments: &Value) -> Result<Self, Error> {
        let args: Self = parse(arguments)?;
        if args.process_id.is_none() && args.address.is_none() {
            return Err(Error::InvalidConfiguration(
                "attach requires processId or address".into(),
            ));
        }
        if args.mode == AttachMode::Listen && args.address.is_none() {
            return Err(Error::MissingArgument("attach", "address"));
        }
        Ok(args)
    }

    pub fn connect_timeout(&self) -> Result<Duration, Error> {
        timeout_from_secs(self.connect_timeout)
    }
}

fn parse<T: DeserializeOwned>(arguments: &Value) -> Result<T, Error> {
    let arguments = match arguments {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(arguments).map_err(|e| Error::InvalidConfiguration(e.to_string()))
}

fn timeout_from_secs(secs: f64) -> Result<Duration, Error> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(Error::InvalidConfiguration(format!(
            "connectTimeout must be a positive number of seconds, got {secs}"
        )));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| {
        Error::InvalidConfiguration(format!("connectTimeout of {secs} seconds: {e}"))
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_launch_defaults() {
        let args = LaunchArguments::from_value(&json!({"playbook": "main.yml"})).unwrap();
        assert_eq!(args.console, Console::IntegratedTerminal);
        assert_eq!(args.connect_timeout().unwrap(), Duration::from_secs(5));
        assert_eq!(args.listen_address, "uds://");
        assert_eq!(args.log_level, "info");
        assert!(args.path_mappings.is_empty());
        assert_eq!(
            args.command_line("uds:/tmp/sock"),
            vec!["playdap-debuggee", "--connect", "uds:/tmp/sock", "main.yml"]
        );
    }

    #[test]
    fn test_launch_full() {
        let args = LaunchArguments::from_value(&json!({
            "playbook": "site.yml",
            "args": ["-i", "inventory.ini"],
            "cwd": "/work",
            "env": {"A": "1", "B": null},
            "console": "externalTerminal",
            "connectTimeout": 1.5,
            "pathMappings": [{"localRoot": "/home/me/", "remoteRoot": "/srv/"}],
            "logFile": "/tmp/debuggee.log",
            "logLevel": "debug",
            "runner": ["python", "-m", "runner"],
            "someClientField": true,
        }))
        .unwrap();
        assert_eq!(args.console.kind(), "external");
        assert_eq!(args.env.get("B"), Some(&None));
        assert_eq!(args.connect_timeout().unwrap(), Duration::from_millis(1500));
        assert_eq!(
            args.command_line("tcp://127.0.0.1:4000"),
            vec![
                "python",
                "-m",
                "runner",
                "--connect",
                "tcp://127.0.0.1:4000",
                "--log-file",
                "/tmp/debuggee.log",
                "--log-level",
                "debug",
                "site.yml",
                "-i",
                "inventory.ini",
            ]
        );
    }

    #[test]
    fn test_invalid_launch() {
        struct TestCase {
            args: Value,
            expected_err: &'static str,
        }
        let cases = [
            TestCase {
                args: json!({}),
                expected_err: "missing field `playbook`",
            },
            TestCase {
                args: Value::Null,
                expected_err: "missing field `playbook`",
            },
            TestCase {
                args: json!({"playbook": ""}),
                expected_err: "missing argument `playbook`",
            },
            TestCase {
                args: json!({"playbook": "a.yml", "console": "internalConsole"}),
                expected_err: "unknown variant",
            },
            TestCase {
                args: json!({"playbook": "a.yml", "runner": []}),
                expected_err: "runner must not be empty",
            },
        ];
        for tc in cases {
            let err = LaunchArguments::from_value(&tc.args).unwrap_err();
            assert!(err.to_string().contains(tc.expected_err), "{err}");
        }

    }

    #[test]
    fn test_connect_timeout_bounds() {
        struct TestCase {
            timeout: f64,
            expected: Option<Duration>,
        }
        let cases = [
            TestCase {
                timeout: 0.25,
                expected: Some(Duration::from_millis(250)),
            },
            TestCase {
                timeout: 0.0,
                expected: None,
            },
            TestCase {
                timeout: -1.0,
                expected: None,
            },
            TestCase {
                timeout: 1e30,
                expected: None,
            },
            TestCase {
                timeout: f64::MAX,
                expected: None,
            },
        ];
        for tc in cases {
            let launch = LaunchArguments::from_value(
                &json!({"playbook": "a.yml", "connectTimeout": tc.timeout}),
            )
            .unwrap();
            let attach = AttachArguments::from_value(
                &json!({"address": "tcp://127.0.0.1:1", "connectTimeout": tc.timeout}),
            )
            .unwrap();
            for got in [launch.connect_timeout(), attach.connect_timeout()] {
                match tc.expected {
                    Some(expected) => assert_eq!(got.unwrap(), expected),
                    None => assert!(
                        matches!(got, Err(Error::InvalidConfiguration(_))),
                        "{}: {got:?}",
                        tc.timeout
                    ),
                }
            }
        }
    }

    #[test]
    fn test_attach_args() {
        let args = AttachArguments::from_value(&json!({
            "processId": 1234,
            "address": "tcp://localhost:1234",
            "useTls": true,
            "tlsVerification": "/etc/ca.pem",
        }))
        .unwrap();
        assert_eq!(args.process_id, Some(1234));
        assert_eq!(args.mode, AttachMode::Connect);
        assert_eq!(
            args.tls_verification,
            TlsVerification::CaFile(PathBuf::from("/etc/ca.pem"))
        );

        struct TestCase {
            raw: &'static str,
            expected: TlsVerification,
        }
        let cases = [
            TestCase {
                raw: "verify",
                expected: TlsVerification::Verify,
            },
            TestCase {
                raw: "ignore",
                expected: TlsVerification::Ignore,
            },
            TestCase {
                raw: "ca.pem",
                expected: TlsVerification::CaFile(PathBuf::from("ca.pem")),
            },
        ];
        for tc in cases {
            let args = AttachArguments::from_value(
                &json!({"address": "uds://", "tlsVerification": tc.raw}),
            )
            .unwrap();
            assert_eq!(args.tls_verification, tc.expected);
        }

        assert!(AttachArguments::from_value(&json!({})).is_err());
        assert!(AttachArguments::from_value(&json!({"mode": "listen", "processId": 1})).is_err());
    }
}
