//! The set of Tor options this crate knows about.
//!
//! Rather than one type per option, options are rows in a table: a
//! case-sensitive name, an attribute set, and an argument kind.  The table
//! drives validation in [`Item::new`](crate::setting::Item::new) and parsing
//! in [`parse`](crate::parse).

use std::fmt::{self, Display};

use crate::arg::{Argument, PortValue};
use crate::err::TorrcError;

/// Attributes an option can carry.
///
/// These drive the cross-option rules in
/// [`TorrcBuilder`](crate::build::TorrcBuilder): `unique` options admit a
/// single setting, `port` options understand `0`-disables, and
/// `hidden_service` options group into contiguous blocks.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct OptionAttrs {
    /// The option configures a listener port.
    pub port: bool,
    /// The option's port range is restricted to 1024..=65535.
    pub proxy: bool,
    /// The option's listener may be an AF_UNIX socket.
    pub unix_socket: bool,
    /// The option's argument is a directory path.
    pub directory: bool,
    /// The option's argument is a file path.
    pub file: bool,
    /// The option belongs to a hidden-service block.
    pub hidden_service: bool,
    /// At most one setting of this option may exist.
    pub unique: bool,
}

impl OptionAttrs {
    /// No attributes at all.
    const NONE: OptionAttrs = OptionAttrs {
        port: false,
        proxy: false,
        unix_socket: false,
        directory: false,
        file: false,
        hidden_service: false,
        unique: false,
    };

    /// Builder-style attribute setters, used by the option table.
    const fn port(mut self) -> Self {
        self.port = true;
        self
    }
    /// See [`OptionAttrs::proxy`].
    const fn proxy(mut self) -> Self {
        self.proxy = true;
        self
    }
    /// See [`OptionAttrs::unix_socket`].
    const fn unix_socket(mut self) -> Self {
        self.unix_socket = true;
        self
    }
    /// See [`OptionAttrs::directory`].
    const fn directory(mut self) -> Self {
        self.directory = true;
        self
    }
    /// See [`OptionAttrs::file`].
    const fn file(mut self) -> Self {
        self.file = true;
        self
    }
    /// See [`OptionAttrs::hidden_service`].
    const fn hidden_service(mut self) -> Self {
        self.hidden_service = true;
        self
    }
    /// See [`OptionAttrs::unique`].
    const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// The kind of argument an option expects.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ArgKind {
    /// `0` or `1`.
    Bool,
    /// A decimal integer.
    Int,
    /// A port value (`auto`/`0`/number), possibly an address:port pair, or
    /// an AF_UNIX listener if the option allows it.
    Port,
    /// A filesystem path.
    Path,
    /// A single-line free-form string.
    Str,
}

/// One row of the option table.
#[derive(Clone, Copy, Debug)]
pub struct OptionDef {
    /// The option name, with the capitalization Tor expects.
    name: &'static str,
    /// Attribute set.
    attrs: OptionAttrs,
    /// Expected argument kind.
    kind: ArgKind,
}

impl OptionDef {
    /// Construct a table row.
    const fn new(name: &'static str, kind: ArgKind, attrs: OptionAttrs) -> Self {
        OptionDef { name, attrs, kind }
    }

    /// The option's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The option's attributes.
    pub fn attrs(&self) -> OptionAttrs {
        self.attrs
    }

    /// The option's argument kind.
    pub fn kind(&self) -> ArgKind {
        self.kind
    }

    /// Check that `arg` is acceptable for this option.
    pub(crate) fn check(&self, arg: &Argument) -> Result<(), TorrcError> {
        let ok = match self.kind {
            ArgKind::Bool => matches!(arg, Argument::Bool(_)),
            ArgKind::Int => matches!(arg, Argument::Int(_)),
            ArgKind::Port => match arg {
                Argument::Port(PortValue::Fixed(p)) if self.attrs.proxy => {
                    if *p < 1024 {
                        return Err(TorrcError::invalid(
                            self.name,
                            format!("port {} is below the proxy range (1024..=65535)", p),
                        ));
                    }
                    true
                }
                Argument::Port(_) => true,
                Argument::SockAddr(_) | Argument::Addr(_) => true,
                Argument::UnixSocket(_) => {
                    if !self.attrs.unix_socket {
                        return Err(TorrcError::invalid(
                            self.name,
                            "option does not accept an AF_UNIX listener",
                        ));
                    }
                    true
                }
                _ => false,
            },
            ArgKind::Path => matches!(arg, Argument::Path(_)),
            ArgKind::Str => matches!(arg, Argument::Str(_)),
        };
        if ok {
            Ok(())
        } else {
            Err(TorrcError::WrongArgumentKind {
                option: self.name.to_string(),
                given: arg.kind_label(),
            })
        }
    }
}

/// Shorthands for the table below.
const NONE: OptionAttrs = OptionAttrs::NONE;

/// Every option this crate has first-class knowledge of.
///
/// Options not listed here can still be used through
/// [`TorOption::other`]; they get no attributes and a free-form
/// argument kind.
///
/// (This is a `const` so that [`TorOption`]'s associated constants can
/// borrow rows from it in const context; [`lookup`] goes through the
/// `static` mirror below to hand out `'static` references.)
const OPTION_TABLE: [OptionDef; 30] = [
    OptionDef::new("SocksPort", ArgKind::Port, NONE.port().proxy().unix_socket()),
    OptionDef::new("__SocksPort", ArgKind::Port, NONE.port().proxy().unix_socket()),
    OptionDef::new("ControlPort", ArgKind::Port, NONE.port().unix_socket()),
    OptionDef::new("__ControlPort", ArgKind::Port, NONE.port().unix_socket()),
    OptionDef::new("DNSPort", ArgKind::Port, NONE.port().proxy()),
    OptionDef::new("__DNSPort", ArgKind::Port, NONE.port().proxy()),
    OptionDef::new("TransPort", ArgKind::Port, NONE.port().proxy()),
    OptionDef::new("__TransPort", ArgKind::Port, NONE.port().proxy()),
    OptionDef::new("HTTPTunnelPort", ArgKind::Port, NONE.port().proxy()),
    OptionDef::new("ORPort", ArgKind::Port, NONE.port()),
    OptionDef::new("DataDirectory", ArgKind::Path, NONE.directory().unique()),
    OptionDef::new("CacheDirectory", ArgKind::Path, NONE.directory().unique()),
    OptionDef::new("ControlPortWriteToFile", ArgKind::Path, NONE.file().unique()),
    OptionDef::new("CookieAuthentication", ArgKind::Bool, NONE.unique()),
    OptionDef::new("CookieAuthFile", ArgKind::Path, NONE.file().unique()),
    OptionDef::new("HashedControlPassword", ArgKind::Str, NONE.unique()),
    OptionDef::new("DisableNetwork", ArgKind::Bool, NONE.unique()),
    OptionDef::new("RunAsDaemon", ArgKind::Bool, NONE.unique()),
    OptionDef::new("SyslogIdentityTag", ArgKind::Str, NONE.unique()),
    OptionDef::new("AutomapHostsOnResolve", ArgKind::Bool, NONE.unique()),
    OptionDef::new("DormantCanceledByStartup", ArgKind::Bool, NONE.unique()),
    OptionDef::new("Log", ArgKind::Str, NONE),
    OptionDef::new("GeoIPFile", ArgKind::Path, NONE.file().unique()),
    OptionDef::new("GeoIPv6File", ArgKind::Path, NONE.file().unique()),
    OptionDef::new("ClientOnionAuthDir", ArgKind::Path, NONE.directory().unique()),
    OptionDef::new("HiddenServiceDir", ArgKind::Path, NONE.directory().hidden_service()),
    OptionDef::new("HiddenServicePort", ArgKind::Port, NONE.port().hidden_service()),
    OptionDef::new("HiddenServiceVersion", ArgKind::Int, NONE.hidden_service()),
    OptionDef::new("__OwningControllerProcess", ArgKind::Int, NONE.unique()),
    OptionDef::new("__ReloadTorrcOnSIGHUP", ArgKind::Bool, NONE.unique()),
];

/// `static` mirror of [`OPTION_TABLE`].
static OPTIONS: [OptionDef; 30] = OPTION_TABLE;

/// Look up a known option by its (case-sensitive) name.
pub fn lookup(name: &str) -> Option<&'static OptionDef> {
    OPTIONS.iter().find(|def| def.name == name)
}

/// A Tor configuration option.
///
/// Known options carry their table row; unknown options are carried by name
/// with no attributes, so that consumers can still pass through settings we
/// have no first-class knowledge of.
#[derive(Clone, Debug)]
pub struct TorOption(Repr);

/// Internal representation of [`TorOption`].
#[derive(Clone, Debug)]
enum Repr {
    /// An option from the table.
    Known(&'static OptionDef),
    /// An option we have no row for.
    Other(String),
}

impl TorOption {
    /// A `SocksPort` option.
    pub const SOCKS_PORT: TorOption = TorOption(Repr::Known(&OPTION_TABLE[0]));
    /// A `__SocksPort` option (non-persistent variant).
    pub const SOCKS_PORT_NP: TorOption = TorOption(Repr::Known(&OPTION_TABLE[1]));
    /// A `ControlPort` option.
    pub const CONTROL_PORT: TorOption = TorOption(Repr::Known(&OPTION_TABLE[2]));
    /// A `__ControlPort` option (non-persistent variant).
    pub const CONTROL_PORT_NP: TorOption = TorOption(Repr::Known(&OPTION_TABLE[3]));
    /// A `DNSPort` option.
    pub const DNS_PORT: TorOption = TorOption(Repr::Known(&OPTION_TABLE[4]));
    /// A `DataDirectory` option.
    pub const DATA_DIRECTORY: TorOption = TorOption(Repr::Known(&OPTION_TABLE[10]));
    /// A `CacheDirectory` option.
    pub const CACHE_DIRECTORY: TorOption = TorOption(Repr::Known(&OPTION_TABLE[11]));
    /// A `ControlPortWriteToFile` option.
    pub const CONTROL_PORT_WRITE_TO_FILE: TorOption = TorOption(Repr::Known(&OPTION_TABLE[12]));
    /// A `CookieAuthentication` option.
    pub const COOKIE_AUTHENTICATION: TorOption = TorOption(Repr::Known(&OPTION_TABLE[13]));
    /// A `CookieAuthFile` option.
    pub const COOKIE_AUTH_FILE: TorOption = TorOption(Repr::Known(&OPTION_TABLE[14]));
    /// A `DisableNetwork` option.
    pub const DISABLE_NETWORK: TorOption = TorOption(Repr::Known(&OPTION_TABLE[16]));
    /// A `RunAsDaemon` option.
    pub const RUN_AS_DAEMON: TorOption = TorOption(Repr::Known(&OPTION_TABLE[17]));
    /// A `SyslogIdentityTag` option.
    pub const SYSLOG_IDENTITY_TAG: TorOption = TorOption(Repr::Known(&OPTION_TABLE[18]));
    /// A `DormantCanceledByStartup` option.
    pub const DORMANT_CANCELED_BY_STARTUP: TorOption = TorOption(Repr::Known(&OPTION_TABLE[20]));
    /// A `ClientOnionAuthDir` option.
    pub const CLIENT_ONION_AUTH_DIR: TorOption = TorOption(Repr::Known(&OPTION_TABLE[24]));
    /// A `HiddenServiceDir` option.
    pub const HIDDEN_SERVICE_DIR: TorOption = TorOption(Repr::Known(&OPTION_TABLE[25]));
    /// A `HiddenServicePort` option.
    pub const HIDDEN_SERVICE_PORT: TorOption = TorOption(Repr::Known(&OPTION_TABLE[26]));
    /// A `HiddenServiceVersion` option.
    pub const HIDDEN_SERVICE_VERSION: TorOption = TorOption(Repr::Known(&OPTION_TABLE[27]));
    /// An `__OwningControllerProcess` option.
    pub const OWNING_CONTROLLER_PROCESS: TorOption = TorOption(Repr::Known(&OPTION_TABLE[28]));

    /// Return the option named `name`: its table row if we have one,
    /// otherwise an attribute-less passthrough option.
    pub fn named(name: &str) -> TorOption {
        match lookup(name) {
            Some(def) => TorOption(Repr::Known(def)),
            None => TorOption(Repr::Other(name.to_string())),
        }
    }

    /// Construct a passthrough option with no attributes.
    ///
    /// Use this for options the table doesn't know; the argument is not
    /// validated beyond being single-line.
    pub fn other(name: impl Into<String>) -> TorOption {
        let name = name.into();
        TorOption::named(&name)
    }

    /// The option's name, capitalized as Tor expects.
    pub fn name(&self) -> &str {
        match &self.0 {
            Repr::Known(def) => def.name,
            Repr::Other(name) => name,
        }
    }

    /// The option's attributes.
    pub fn attrs(&self) -> OptionAttrs {
        match &self.0 {
            Repr::Known(def) => def.attrs,
            Repr::Other(_) => OptionAttrs::NONE,
        }
    }

    /// Check that `arg` is acceptable for this option.
    pub(crate) fn check(&self, arg: &Argument) -> Result<(), TorrcError> {
        match &self.0 {
            Repr::Known(def) => def.check(arg),
            Repr::Other(_) => Ok(()),
        }
    }
}

impl PartialEq for TorOption {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}
impl Eq for TorOption {}

impl std::hash::Hash for TorOption {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name().hash(state);
    }
}

impl Display for TorOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::arg::TorBool;
    use assert_matches::assert_matches;

    #[test]
    fn table_names_are_consistent() {
        // The associated constants index into the table; make sure nobody
        // reorders it without updating them.
        assert_eq!(TorOption::SOCKS_PORT.name(), "SocksPort");
        assert_eq!(TorOption::SOCKS_PORT_NP.name(), "__SocksPort");
        assert_eq!(TorOption::CONTROL_PORT.name(), "ControlPort");
        assert_eq!(TorOption::CONTROL_PORT_NP.name(), "__ControlPort");
        assert_eq!(TorOption::DNS_PORT.name(), "DNSPort");
        assert_eq!(TorOption::DATA_DIRECTORY.name(), "DataDirectory");
        assert_eq!(TorOption::CACHE_DIRECTORY.name(), "CacheDirectory");
        assert_eq!(
            TorOption::CONTROL_PORT_WRITE_TO_FILE.name(),
            "ControlPortWriteToFile"
        );
        assert_eq!(TorOption::COOKIE_AUTHENTICATION.name(), "CookieAuthentication");
        assert_eq!(TorOption::COOKIE_AUTH_FILE.name(), "CookieAuthFile");
        assert_eq!(TorOption::DISABLE_NETWORK.name(), "DisableNetwork");
        assert_eq!(TorOption::RUN_AS_DAEMON.name(), "RunAsDaemon");
        assert_eq!(TorOption::SYSLOG_IDENTITY_TAG.name(), "SyslogIdentityTag");
        assert_eq!(
            TorOption::DORMANT_CANCELED_BY_STARTUP.name(),
            "DormantCanceledByStartup"
        );
        assert_eq!(TorOption::CLIENT_ONION_AUTH_DIR.name(), "ClientOnionAuthDir");
        assert_eq!(TorOption::HIDDEN_SERVICE_DIR.name(), "HiddenServiceDir");
        assert_eq!(TorOption::HIDDEN_SERVICE_PORT.name(), "HiddenServicePort");
        assert_eq!(TorOption::HIDDEN_SERVICE_VERSION.name(), "HiddenServiceVersion");
        assert_eq!(
            TorOption::OWNING_CONTROLLER_PROCESS.name(),
            "__OwningControllerProcess"
        );
    }

    #[test]
    fn lookup_is_case_sensitive() {
        assert!(lookup("SocksPort").is_some());
        assert!(lookup("socksport").is_none());
    }

    #[test]
    fn proxy_port_range() {
        let def = lookup("SocksPort").unwrap();
        assert!(def.check(&Argument::Port(PortValue::Fixed(9050))).is_ok());
        assert!(def.check(&Argument::Port(PortValue::Auto)).is_ok());
        assert!(def.check(&Argument::Port(PortValue::Disabled)).is_ok());
        assert_matches!(
            def.check(&Argument::Port(PortValue::Fixed(443))),
            Err(TorrcError::Invalid { .. })
        );

        // HiddenServicePort is a generic port: low values are fine.
        let hs = lookup("HiddenServicePort").unwrap();
        assert!(hs.check(&Argument::Port(PortValue::Fixed(80))).is_ok());
    }

    #[test]
    fn unix_listener_gating() {
        let ctrl = lookup("ControlPort").unwrap();
        let dns = lookup("DNSPort").unwrap();
        let sock = crate::arg::UnixSocketAddr::new("/run/tor/ctrl.sock").unwrap();
        assert!(ctrl.check(&Argument::UnixSocket(sock.clone())).is_ok());
        assert_matches!(
            dns.check(&Argument::UnixSocket(sock)),
            Err(TorrcError::Invalid { .. })
        );
    }

    #[test]
    fn wrong_kind() {
        let dd = lookup("DataDirectory").unwrap();
        assert_matches!(
            dd.check(&Argument::Bool(TorBool::True)),
            Err(TorrcError::WrongArgumentKind { .. })
        );
    }
}
