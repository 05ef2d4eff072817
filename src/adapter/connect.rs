//! Ways of reaching the debuggee.
//!
//! Connection attempts block, they run on helper threads and report back to the
//! session loop through [`Input::DebuggeeConnected`].

use crate::adapter::Input;
use crate::dap::args::{AttachArguments, AttachMode, LaunchArguments, PathMapping};
use crate::debuggee::addr::SocketAddress;
use crate::debuggee::pidfile::PidFile;
use crate::debuggee::socket::{self, DebuggeeChannel, DebuggeeListener};
use crate::debuggee::tls::TlsOptions;
use crate::error::Error;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::mpsc::Sender;
use std::time::Duration;

pub const TERMINAL_TITLE: &str = "Playbook Debug Console";

/// How the session found its debuggee.
#[derive(Debug, Clone)]
pub enum Topology {
    /// Debuggee started by the client through `runInTerminal`, connects back to the adapter.
    Launch(LaunchArguments),
    /// Connect to a debuggee that published its address in a pid file.
    AttachPid { pid: u32, args: AttachArguments },
    /// Connect to a debuggee listening on a known address.
    AttachAddress(AttachArguments),
    /// Listen until the debuggee connects.
    Listen(AttachArguments),
}

impl Topology {
    pub fn from_attach(args: AttachArguments) -> Self {
        match (args.mode, args.process_id) {
            (AttachMode::Listen, _) => Topology::Listen(args),
            (AttachMode::Connect, Some(pid)) => Topology::AttachPid { pid, args },
            (AttachMode::Connect, None) => Topology::AttachAddress(args),
        }
    }

    pub fn is_launch(&self) -> bool {
        matches!(self, Topology::Launch(_))
    }

    pub fn path_mappings(&self) -> &[PathMapping] {
        match self {
            Topology::Launch(args) => &args.path_mappings,
            Topology::AttachPid { args, .. } => &args.path_mappings,
            Topology::AttachAddress(args) => &args.path_mappings,
            Topology::Listen(args) => &args.path_mappings,
        }
    }
}

/// Where and how to connect for an attach topology.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectTarget {
    pub address: SocketAddress,
    pub tls: Option<TlsOptions>,
}

impl ConnectTarget {
    /// TLS server name, the host of a TCP address or `localhost` for unix sockets.
    pub fn server_name(&self) -> String {
        match &self.address {
            SocketAddress::Tcp { host, .. } => SocketAddress::connect_host(host)
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string(),
            SocketAddress::Unix(_) => "localhost".to_string(),
        }
    }
}

fn tls_options(args: &AttachArguments, use_tls: bool) -> Option<TlsOptions> {
    use_tls.then(|| TlsOptions {
        verification: args.tls_verification.clone(),
        certificate: args.tls_certificate.clone(),
        key: args.tls_key.clone(),
    })
}

fn parse_address(address: Option<&str>) -> Result<SocketAddress, Error> {
    address
        .ok_or(Error::MissingArgument("attach", "address"))?
        .parse()
}

/// Resolve the connect target of `AttachPid` and `AttachAddress`.
///
/// A pid file overrides TLS use, the debuggee knows whether it wraps its socket.
pub fn connect_target(topology: &Topology) -> Result<ConnectTarget, Error> {
    match topology {
        Topology::AttachPid { pid, args } => {
            let file = PidFile::read(*pid)?;
            Ok(ConnectTarget {
                address: file.address.parse()?,
                tls: tls_options(args, file.use_tls),
            })
        }
        Topology::AttachAddress(args) => Ok(ConnectTarget {
            address: parse_address(args.address.as_deref())?,
            tls: tls_options(args, args.use_tls),
        }),
        Topology::Launch(_) | Topology::Listen(_) => Err(Error::InvalidState("listening")),
    }
}

/// Bind the listener of `Launch` and `Listen`.
pub fn bind(topology: &Topology) -> Result<DebuggeeListener, Error> {
    let address: SocketAddress = match topology {
        Topology::Launch(args) => args.listen_address.parse()?,
        Topology::Listen(args) => {
            if args.use_tls {
                return Err(Error::InvalidConfiguration(
                    "TLS is only supported when connecting to the debuggee".into(),
                ));
            }
            parse_address(args.address.as_deref())?
        }
        Topology::AttachPid { .. } | Topology::AttachAddress(_) => {
            return Err(Error::InvalidState("connecting"));
        }
    };
    let listener = DebuggeeListener::bind(&address)?;
    log::info!(target: "debuggee", "waiting for the debuggee on {}", listener.address());
    Ok(listener)
}

/// Bind the listener the `run` wrapper reports the end of a launched debuggee to.
pub fn bind_exit() -> Result<DebuggeeListener, Error> {
    DebuggeeListener::bind(&"uds://".parse()?)
}

/// `runInTerminal` arguments that start the debuggee under the `run` wrapper of `program`.
///
/// The debuggee connects back to `address`, the wrapper connects to `exit_address` once
/// the debuggee is gone.
pub fn run_in_terminal_arguments(
    args: &LaunchArguments,
    program: &Path,
    address: &SocketAddress,
    exit_address: &SocketAddress,
) -> Value {
    let cwd = args.cwd.clone().unwrap_or_else(|| {
        std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    });
    let mut command = vec![
        program.display().to_string(),
        "run".to_string(),
        "--exit-notify".to_string(),
        exit_address.to_string(),
        "--".to_string(),
    ];
    command.extend(args.command_line(&address.to_string()));
    json!({
        "kind": args.console.kind(),
        "title": TERMINAL_TITLE,
        "cwd": cwd,
        "args": command,
        "env": args.env,
    })
}

/// Wait for the debuggee on `listener` in a helper thread.
///
/// With an `exit` listener the wait ends early when the launched debuggee is gone.
pub fn spawn_accept(
    listener: DebuggeeListener,
    exit: Option<DebuggeeListener>,
    timeout: Duration,
    generation: u64,
    inputs: Sender<Input>,
) {
    std::thread::spawn(move || {
        let result = listener
            .accept_watching(timeout, exit.as_ref())
            .and_then(DebuggeeChannel::plain);
        if let Err(e) = &result {
            log::warn!(target: "debuggee", "no debuggee on {}: {e}", listener.address());
        }
        drop(listener);
        drop(exit);
        let _ = inputs.send(Input::DebuggeeConnected { generation, result });
    });
}

/// Connect to the debuggee in a helper thread.
pub fn spawn_connect(
    target: ConnectTarget,
    timeout: Duration,
    generation: u64,
    inputs: Sender<Input>,
) {
    std::thread::spawn(move || {
        log::info!(target: "debuggee", "connecting to {}", target.address);
        let result = socket::connect(&target.address, timeout).and_then(|stream| {
            socket::establish(stream, &target.server_name(), target.tls.as_ref(), timeout)
        });
        if let Err(e) = &result {
            log::warn!(target: "debuggee", "connect to {} failed: {e}", target.address);
        }
        let _ = inputs.send(Input::DebuggeeConnected { generation, result });
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dap::args::TlsVerification;
    use crate::debuggee::pidfile;
    use serial_test::serial;
    use std::path::PathBuf;

    fn attach(value: Value) -> AttachArguments {
        AttachArguments::from_value(&value).unwrap()
    }

    #[test]
    fn test_topology_from_attach() {
        struct TestCase {
            args: Value,
            expected: &'static str,
        }
        let cases = [
            TestCase {
                args: json!({"processId": 10}),
                expected: "pid",
            },
            TestCase {
                args: json!({"address": "tcp://h:1"}),
                expected: "address",
            },
            TestCase {
                args: json!({"address": "tcp://:0", "mode": "listen"}),
                expected: "listen",
            },
        ];
        for tc in cases {
            let kind = match Topology::from_attach(attach(tc.args.clone())) {
                Topology::AttachPid { .. } => "pid",
                Topology::AttachAddress(_) => "address",
                Topology::Listen(_) => "listen",
                Topology::Launch(_) => "launch",
            };
            assert_eq!(kind, tc.expected, "{}", tc.args);
        }
    }

    #[test]
    fn test_server_name() {
        let target = |address: &str| ConnectTarget {
            address: address.parse().unwrap(),
            tls: None,
        };
        assert_eq!(target("tcp://debug.example:9000").server_name(), "debug.example");
        assert_eq!(target("tcp://[::1]:9000").server_name(), "::1");
        assert_eq!(target("tcp://:9000").server_name(), "127.0.0.1");
        assert_eq!(target("uds:///tmp/x.sock").server_name(), "localhost");
    }

    #[test]
    fn test_connect_target_tls() {
        let topology = Topology::from_attach(attach(json!({
            "address": "tcp://localhost:1234",
            "useTls": true,
            "tlsVerification": "ignore",
        })));
        let target = connect_target(&topology).unwrap();
        assert_eq!(
            target.tls,
            Some(TlsOptions {
                verification: TlsVerification::Ignore,
                certificate: None,
                key: None,
            })
        );
    }

    #[test]
    #[serial]
    fn test_connect_target_from_pid_file() {
        let pid = 4_194_304 + 23;
        PidFile {
            address: "uds:///tmp/playdap-test.sock".to_string(),
            use_tls: false,
        }
        .write(pid)
        .unwrap();

        let topology = Topology::from_attach(attach(json!({"processId": pid, "useTls": true})));
        let target = connect_target(&topology).unwrap();
        assert_eq!(
            target.address,
            SocketAddress::Unix(PathBuf::from("/tmp/playdap-test.sock"))
        );
        assert_eq!(target.tls, None);

        std::fs::remove_file(pidfile::path(pid)).unwrap();
        let err = connect_target(&topology).unwrap_err();
        assert_eq!(err.to_string(), format!("process not found: {pid}"));
    }

    #[test]
    fn test_listen_rejects_tls() {
        let topology = Topology::from_attach(attach(json!({
            "address": "tcp://127.0.0.1:0",
            "mode": "listen",
            "useTls": true,
        })));
        assert!(matches!(
            bind(&topology),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_launch_accept_ends_on_exit() {
        let listener = DebuggeeListener::bind(&"tcp://127.0.0.1:0".parse().unwrap()).unwrap();
        let exit = bind_exit().unwrap();
        let exit_address = exit.address().clone();
        let (inputs, queue) = std::sync::mpsc::channel();
        spawn_accept(listener, Some(exit), Duration::from_secs(30), 4, inputs);

        let _notify = socket::connect(&exit_address, Duration::from_secs(1)).unwrap();
        let input = queue.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            input,
            Input::DebuggeeConnected {
                generation: 4,
                result: Err(Error::DebuggeeExited)
            }
        ));
    }

    #[test]
    fn test_run_in_terminal_arguments() {
        let args = LaunchArguments::from_value(&json!({
            "playbook": "main.yml",
            "args": ["-i", "inventory.ini"],
            "cwd": "/work",
            "console": "externalTerminal",
            "env": {"ANSIBLE_FORCE_COLOR": "1", "PAGER": null},
        }))
        .unwrap();
        let address: SocketAddress = "tcp://127.0.0.1:4000".parse().unwrap();
        let exit_address: SocketAddress = "uds:///tmp/exit.sock".parse().unwrap();
        let body = run_in_terminal_arguments(
            &args,
            Path::new("/usr/bin/playdap"),
            &address,
            &exit_address,
        );
        assert_eq!(body["kind"], json!("external"));
        assert_eq!(body["title"], json!(TERMINAL_TITLE));
        assert_eq!(body["cwd"], json!("/work"));
        assert_eq!(
            body["args"],
            json!([
                "/usr/bin/playdap",
                "run",
                "--exit-notify",
                "uds:/tmp/exit.sock",
                "--",
                "playdap-debuggee",
                "--connect",
                "tcp://127.0.0.1:4000",
                "main.yml",
                "-i",
                "inventory.ini"
            ])
        );
        assert_eq!(body["env"], json!({"ANSIBLE_FORCE_COLOR": "1", "PAGER": null}));
    }
}
