//! Argument values for torrc options.
//!
//! Tor's option arguments come in a small number of shapes (booleans
//! rendered as `0`/`1`, ports that may be `auto` or disabled, listener
//! addresses, paths).  We represent each shape as a typed value that knows
//! how to render itself in the form `tor` accepts, so that validation
//! happens when a value is constructed rather than when a file is written.

use std::fmt::{self, Display};
use std::net::{IpAddr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::err::TorrcError;

/// A boolean in the form Tor expects: `0` or `1`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[derive(strum::Display, strum::EnumString, strum::IntoStaticStr)]
#[allow(clippy::exhaustive_enums)]
pub enum TorBool {
    /// Rendered as `0`.
    #[strum(serialize = "0")]
    False,
    /// Rendered as `1`.
    #[strum(serialize = "1")]
    True,
}

impl From<bool> for TorBool {
    fn from(b: bool) -> TorBool {
        if b {
            TorBool::True
        } else {
            TorBool::False
        }
    }
}

impl From<TorBool> for bool {
    fn from(b: TorBool) -> bool {
        matches!(b, TorBool::True)
    }
}

/// The value of a port-like option: `auto`, `0` (disabled), or a concrete
/// port number.
///
/// Tor treats `0` as "remove every listener of this kind", and `auto` as
/// "pick an unused port for me and report it".
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[allow(clippy::exhaustive_enums)]
pub enum PortValue {
    /// Let tor choose a port; rendered as `auto`.
    Auto,
    /// No listener of this kind; rendered as `0`.
    Disabled,
    /// A concrete port; rendered in decimal.
    Fixed(u16),
}

impl PortValue {
    /// Return the concrete port, if there is one.
    pub fn as_fixed(&self) -> Option<u16> {
        match self {
            PortValue::Fixed(p) => Some(*p),
            _ => None,
        }
    }
}

impl Display for PortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortValue::Auto => write!(f, "auto"),
            PortValue::Disabled => write!(f, "0"),
            PortValue::Fixed(p) => write!(f, "{}", p),
        }
    }
}

impl FromStr for PortValue {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(PortValue::Auto);
        }
        match s.parse::<u16>()? {
            0 => Ok(PortValue::Disabled),
            p => Ok(PortValue::Fixed(p)),
        }
    }
}

/// Largest AF_UNIX socket path we will configure, in bytes.
///
/// The BSDs (and macOS) have a smaller `sun_path` than Linux and Windows.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub const UNIX_PATH_MAX: usize = 104;
/// Largest AF_UNIX socket path we will configure, in bytes.
#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
pub const UNIX_PATH_MAX: usize = 106;

/// A validated path for an AF_UNIX listener.
///
/// The path is absolute, normalized, single-line, valid UTF-8, and no longer
/// than [`UNIX_PATH_MAX`] bytes.  It renders as `unix:"<path>"`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixSocketAddr {
    /// The validated path.
    path: PathBuf,
}

impl UnixSocketAddr {
    /// Validate `path` as an AF_UNIX listener path.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, TorrcError> {
        let path = normalize_path("unix socket", path.into())?;
        let len = path
            .to_str()
            .map(str::len)
            .ok_or_else(|| TorrcError::invalid("unix socket", "path is not UTF-8"))?;
        if len > UNIX_PATH_MAX {
            return Err(TorrcError::UnixPathTooLong {
                path: path.display().to_string(),
                len,
                max: UNIX_PATH_MAX,
            });
        }
        Ok(UnixSocketAddr { path })
    }

    /// Return the underlying filesystem path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Display for UnixSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unix:\"{}\"", self.path.display())
    }
}

impl FromStr for UnixSocketAddr {
    type Err = TorrcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .strip_prefix("unix:\"")
            .and_then(|rest| rest.strip_suffix('"'))
            .ok_or_else(|| {
                TorrcError::invalid("unix socket", format!("{:?} is not unix:\"<path>\"", s))
            })?;
        UnixSocketAddr::new(inner)
    }
}

/// Check that `path` is absolute, single-line, UTF-8, and normalize it.
///
/// Normalization here is lexical: `.` components and redundant separators
/// are removed.  `..` components are rejected, since resolving them would
/// require consulting the filesystem.
pub(crate) fn normalize_path(option: &str, path: PathBuf) -> Result<PathBuf, TorrcError> {
    let as_str = path
        .to_str()
        .ok_or_else(|| TorrcError::invalid(option, "path is not UTF-8"))?;
    if as_str.contains(['\n', '\r']) {
        return Err(TorrcError::invalid(option, "path spans multiple lines"));
    }
    if !path.is_absolute() {
        return Err(TorrcError::invalid(
            option,
            format!("path {:?} is not absolute", as_str),
        ));
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TorrcError::invalid(
                    option,
                    format!("path {:?} contains a parent-directory component", as_str),
                ));
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    Ok(out)
}

/// A single validated option argument.
///
/// The variants mirror the shapes of argument that C Tor's configuration
/// accepts; each renders itself in the form `tor` parses back.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Argument {
    /// A boolean, rendered `0`/`1`.
    Bool(TorBool),
    /// A plain integer.
    Int(i64),
    /// A port: `auto`, disabled, or fixed.
    Port(PortValue),
    /// A bare IP address.
    Addr(IpAddr),
    /// An IP address and port.
    SockAddr(SocketAddr),
    /// An absolute filesystem path (file or directory).
    Path(PathBuf),
    /// An AF_UNIX listener path.
    UnixSocket(UnixSocketAddr),
    /// A single-line free-form string.
    Str(String),
}

impl Argument {
    /// Construct a path argument, validating and normalizing `path`.
    pub fn path(path: impl Into<PathBuf>) -> Result<Self, TorrcError> {
        Ok(Argument::Path(normalize_path("path", path.into())?))
    }

    /// Construct a free-form string argument, rejecting multi-line input.
    pub fn string(s: impl Into<String>) -> Result<Self, TorrcError> {
        let s = s.into();
        if s.contains(['\n', '\r']) {
            return Err(TorrcError::invalid("argument", "value spans multiple lines"));
        }
        Ok(Argument::Str(s))
    }

    /// A short label for this argument's kind, for error messages.
    pub(crate) fn kind_label(&self) -> &'static str {
        match self {
            Argument::Bool(_) => "boolean",
            Argument::Int(_) => "integer",
            Argument::Port(_) => "port",
            Argument::Addr(_) => "address",
            Argument::SockAddr(_) => "socket address",
            Argument::Path(_) => "path",
            Argument::UnixSocket(_) => "unix socket",
            Argument::Str(_) => "string",
        }
    }
}

impl Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Argument::Bool(b) => write!(f, "{}", b),
            Argument::Int(i) => write!(f, "{}", i),
            Argument::Port(p) => write!(f, "{}", p),
            Argument::Addr(a) => write!(f, "{}", a),
            Argument::SockAddr(a) => write!(f, "{}", a),
            Argument::Path(p) => {
                // torrc requires quoting for paths with spaces.
                let s = p.display();
                if p.to_str().is_some_and(|s| s.contains(char::is_whitespace)) {
                    write!(f, "\"{}\"", s)
                } else {
                    write!(f, "{}", s)
                }
            }
            Argument::UnixSocket(u) => write!(f, "{}", u),
            Argument::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<TorBool> for Argument {
    fn from(b: TorBool) -> Self {
        Argument::Bool(b)
    }
}
impl From<bool> for Argument {
    fn from(b: bool) -> Self {
        Argument::Bool(b.into())
    }
}
impl From<PortValue> for Argument {
    fn from(p: PortValue) -> Self {
        Argument::Port(p)
    }
}
impl From<SocketAddr> for Argument {
    fn from(a: SocketAddr) -> Self {
        Argument::SockAddr(a)
    }
}
impl From<UnixSocketAddr> for Argument {
    fn from(u: UnixSocketAddr) -> Self {
        Argument::UnixSocket(u)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn bools() {
        assert_eq!(TorBool::True.to_string(), "1");
        assert_eq!(TorBool::False.to_string(), "0");
        assert_eq!("0".parse::<TorBool>().unwrap(), TorBool::False);
        assert_eq!("1".parse::<TorBool>().unwrap(), TorBool::True);
        assert!("true".parse::<TorBool>().is_err());
    }

    #[test]
    fn ports() {
        assert_eq!("auto".parse::<PortValue>().unwrap(), PortValue::Auto);
        assert_eq!("AUTO".parse::<PortValue>().unwrap(), PortValue::Auto);
        assert_eq!("0".parse::<PortValue>().unwrap(), PortValue::Disabled);
        assert_eq!("9050".parse::<PortValue>().unwrap(), PortValue::Fixed(9050));
        assert!("65536".parse::<PortValue>().is_err());
        assert!("-1".parse::<PortValue>().is_err());

        assert_eq!(PortValue::Auto.to_string(), "auto");
        assert_eq!(PortValue::Disabled.to_string(), "0");
        assert_eq!(PortValue::Fixed(443).to_string(), "443");
    }

    #[test]
    fn unix_path_limits() {
        // A path of exactly the platform maximum is accepted...
        let max = "/".to_string() + &"a".repeat(UNIX_PATH_MAX - 1);
        assert_eq!(max.len(), UNIX_PATH_MAX);
        let addr = UnixSocketAddr::new(&max).unwrap();
        assert_eq!(addr.to_string(), format!("unix:\"{}\"", max));

        // ...and one byte longer is not.
        let too_long = max + "a";
        assert_matches!(
            UnixSocketAddr::new(&too_long),
            Err(TorrcError::UnixPathTooLong { len, max, .. })
                if len == UNIX_PATH_MAX + 1 && max == UNIX_PATH_MAX
        );
    }

    #[test]
    fn unix_path_shape() {
        assert_matches!(
            UnixSocketAddr::new("relative/socket"),
            Err(TorrcError::Invalid { .. })
        );
        assert_matches!(
            UnixSocketAddr::new("/run/../tor/ctrl.sock"),
            Err(TorrcError::Invalid { .. })
        );
        // "." components and doubled separators normalize away.
        let a = UnixSocketAddr::new("/run/./tor//ctrl.sock").unwrap();
        assert_eq!(a.path(), Path::new("/run/tor/ctrl.sock"));
    }

    #[test]
    fn unix_round_trip() {
        let a = UnixSocketAddr::new("/run/tor/ctrl.sock").unwrap();
        let rendered = a.to_string();
        assert_eq!(rendered, "unix:\"/run/tor/ctrl.sock\"");
        assert_eq!(rendered.parse::<UnixSocketAddr>().unwrap(), a);
    }

    #[test]
    fn render_path_quoting() {
        let plain = Argument::path("/var/lib/tor").unwrap();
        assert_eq!(plain.to_string(), "/var/lib/tor");
        let spaced = Argument::path("/Users/somebody/Library/Application Support/tor").unwrap();
        assert_eq!(
            spaced.to_string(),
            "\"/Users/somebody/Library/Application Support/tor\""
        );
    }

    #[test]
    fn multi_line_rejected() {
        assert_matches!(Argument::string("a\nb"), Err(TorrcError::Invalid { .. }));
        assert_matches!(Argument::path("/tmp/x\ny"), Err(TorrcError::Invalid { .. }));
    }
}
