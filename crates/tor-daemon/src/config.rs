//! Configuration for the runtime itself.
//!
//! This is about how *we* behave (budgets, timeouts, policies), not about
//! tor's options; those live in [`tor_torrc`].  Everything funnels through
//! a builder so that invalid combinations are caught before any I/O.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use derive_builder::Builder;

use tor_torrc::{HsService, PortValue, TorOption, UnixSocketAddr};

/// An error related to an option passed to the runtime via a
/// configuration builder.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigBuildError {
    /// A mandatory field was not present.
    #[error("Field was not provided: {0}")]
    MissingField(String),
    /// A single field had a value that proved to be unusable.
    #[error("Value of {0} was incorrect: {1}")]
    Invalid(String, String),
    /// Multiple fields are inconsistent.
    #[error("Fields {0:?} are inconsistent: {1}")]
    Inconsistent(Vec<String>, String),
}

impl From<derive_builder::UninitializedFieldError> for ConfigBuildError {
    fn from(val: derive_builder::UninitializedFieldError) -> Self {
        ConfigBuildError::MissingField(val.field_name().to_string())
    }
}

/// Where the control listener should live.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ControlListener {
    /// `ControlPort auto`: tor picks a port and reports it through the
    /// control-port file in the work directory.
    #[default]
    Auto,
    /// A fixed TCP port on localhost.
    Fixed(u16),
    /// An AF_UNIX socket.  Not available on every platform.
    Unix(UnixSocketAddr),
}

/// Whether to restart automatically after an unexpected
/// control-connection drop.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum RestartPolicy {
    /// Never restart automatically.
    Never,
    /// Schedule a single restart, but only when the most recent executed
    /// action was a start or restart and no stop has been requested since.
    #[default]
    AfterStart,
    /// Always schedule a single restart.
    Always,
}

/// How many output lines we give tor to reach readiness before declaring
/// startup failed.
const DEFAULT_LINE_BUDGET: usize = 300;

/// Configuration for a [`TorRuntime`](crate::TorRuntime).
#[derive(Clone, Debug, Builder)]
#[builder(build_fn(validate = "Self::validate", error = "ConfigBuildError"))]
#[non_exhaustive]
pub struct TorDaemonConfig {
    /// The tor binary to run, as supplied by the resource installer.
    #[builder(setter(into))]
    pub tor_path: PathBuf,

    /// The SOCKS listener to configure.
    #[builder(default = "PortValue::Auto")]
    pub socks_port: PortValue,

    /// Where the control listener should live.
    #[builder(default)]
    pub control_listener: ControlListener,

    /// Password for `HASHEDPASSWORD` control auth, when cookie auth is
    /// unavailable.
    #[builder(default)]
    pub control_password: Option<String>,

    /// Hidden services to configure at startup.
    #[builder(default)]
    pub hidden_services: Vec<HsService>,

    /// Extra torrc lines (`option`, `argument`) passed through verbatim
    /// for options this crate has no first-class knowledge of.
    #[builder(default)]
    pub extra_settings: Vec<(String, String)>,

    /// How many stdout/stderr lines tor may emit before readiness.
    #[builder(default = "DEFAULT_LINE_BUDGET")]
    pub startup_line_budget: usize,

    /// Wall-clock limit for reaching readiness.
    #[builder(default = "Duration::from_secs(45)")]
    pub readiness_timeout: Duration,

    /// How long to wait for tor to exit after a polite terminate before
    /// killing it.
    #[builder(default = "Duration::from_secs(2)")]
    pub terminate_timeout: Duration,

    /// Grace given to the executing job when the runtime is destroyed.
    #[builder(default = "Duration::from_millis(500)")]
    pub destroy_grace: Duration,

    /// Debounce window for connectivity flaps.
    #[builder(default = "Duration::from_millis(250)")]
    pub network_debounce: Duration,

    /// Automatic-restart policy after an unexpected connection drop.
    #[builder(default)]
    pub restart_policy: RestartPolicy,

    /// Consecutive startup failures tolerated before starts are rejected.
    #[builder(default = "3")]
    pub max_start_failures: u32,

    /// Tag that protects observers from bulk removal at shutdown.
    #[builder(default, setter(into, strip_option))]
    pub static_tag: Option<String>,

    /// Skip ownership/permission checks on the work and cache trees.
    ///
    /// Directories tor needs private are still created with mode 0700;
    /// only the verification of their ancestors is relaxed.  Meant for
    /// tests and containers with unusual ownership.
    #[builder(default)]
    pub trust_insecure_dirs: bool,

    /// Port options eligible for fixed-port to `auto` rewriting when
    /// their port turns out to be taken.
    #[builder(default = "default_reassignable()")]
    pub reassignable_ports: HashSet<TorOption>,
}

/// The port options reassigned to `auto` by default.
///
/// `ControlPort` is deliberately absent: the runtime has to know where
/// the control listener ends up, and it already handles `auto` through
/// the control-port file.
fn default_reassignable() -> HashSet<TorOption> {
    [
        TorOption::SOCKS_PORT,
        TorOption::SOCKS_PORT_NP,
        TorOption::DNS_PORT,
        TorOption::named("TransPort"),
        TorOption::named("HTTPTunnelPort"),
    ]
    .into_iter()
    .collect()
}

impl TorDaemonConfig {
    /// Return a new builder.
    pub fn builder() -> TorDaemonConfigBuilder {
        TorDaemonConfigBuilder::default()
    }
}

impl TorDaemonConfigBuilder {
    /// Reject combinations no tor could run with.
    fn validate(&self) -> Result<(), ConfigBuildError> {
        if let Some(path) = &self.tor_path {
            if path.as_os_str().is_empty() {
                return Err(ConfigBuildError::Invalid(
                    "tor_path".to_string(),
                    "empty path".to_string(),
                ));
            }
        }
        if let Some(Some(pw)) = &self.control_password {
            if pw.is_empty() {
                return Err(ConfigBuildError::Invalid(
                    "control_password".to_string(),
                    "empty password".to_string(),
                ));
            }
        }
        if cfg!(windows) {
            if let Some(ControlListener::Unix(_)) = &self.control_listener {
                return Err(ConfigBuildError::Invalid(
                    "control_listener".to_string(),
                    "AF_UNIX control listeners are unsupported on this platform".to_string(),
                ));
            }
        }
        if let Some(budget) = self.startup_line_budget {
            if budget == 0 {
                return Err(ConfigBuildError::Invalid(
                    "startup_line_budget".to_string(),
                    "budget must allow at least one line".to_string(),
                ));
            }
        }
        Ok(())
    }
}
