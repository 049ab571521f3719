//! Client configuration
//!
//! Defaults suit a viewer on the same machine. `from_env` lets a deployed
//! program be pointed at a remote viewer without code changes:
//!
//! | variable             | field     |
//! |----------------------|-----------|
//! | `FRAMESCOPE_HOST`    | `host`    |
//! | `FRAMESCOPE_PORT`    | `port`    |
//! | `FRAMESCOPE_PROGRAM` | `program` |

#![allow(unsafe_code)] // gethostname() requires unsafe

use framescope_common::DEFAULT_PORT;
use log::warn;
use std::time::Duration;

pub const ENV_HOST: &str = "FRAMESCOPE_HOST";
pub const ENV_PORT: &str = "FRAMESCOPE_PORT";
pub const ENV_PROGRAM: &str = "FRAMESCOPE_PROGRAM";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Program identifier sent in the handshake
    pub program: String,
    /// Viewer host used by `connect_default`
    pub host: String,
    /// Viewer port used by `connect_default`
    pub port: u16,
    /// Bound on establishing the TCP connection, per resolved address
    pub connect_timeout: Duration,
    /// Bound on waiting for the viewer's handshake reply
    pub handshake_timeout: Duration,
    /// Bound on a single socket write; a stalled viewer is dropped after this
    pub write_timeout: Duration,
    /// Frames buffered between `tick` and the socket writer
    pub queue_capacity: usize,
    /// Whether collectors record until the viewer says otherwise
    pub default_active: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            program: default_program_name(),
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
            queue_capacity: 1024,
            default_active: true,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `FRAMESCOPE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(host) = lookup(ENV_HOST).filter(|h| !h.trim().is_empty()) {
            config.host = host.trim().to_string();
        }
        if let Some(port) = lookup(ENV_PORT) {
            match port.trim().parse() {
                Ok(port) => config.port = port,
                Err(_) => warn!("Ignoring invalid {ENV_PORT}={port:?}"),
            }
        }
        if let Some(program) = lookup(ENV_PROGRAM).filter(|p| !p.trim().is_empty()) {
            config.program = program;
        }
        config
    }

    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    #[must_use]
    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_default_active(mut self, active: bool) -> Self {
        self.default_active = active;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, connect: Duration, handshake: Duration, write: Duration) -> Self {
        self.connect_timeout = connect;
        self.handshake_timeout = handshake;
        self.write_timeout = write;
        self
    }
}

fn default_program_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Host name of this machine, used as the handshake's machine identifier.
pub fn machine_name() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes; gethostname NUL-terminates on success
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    if rc != 0 || end == 0 {
        return "unknown".to_string();
    }
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
