//! Settings: validated `(option, argument)` pairs, possibly grouped.
//!
//! Most settings are a single line of torrc.  Hidden services are the
//! exception: one service is a block of lines that must stay contiguous and
//! satisfy internal requirements, so a [`Setting`] holds one *or more*
//! [`Item`]s.

use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use derive_builder::Builder;

use crate::arg::{normalize_path, Argument, PortValue, UnixSocketAddr};
use crate::err::TorrcError;
use crate::opt::TorOption;

/// A single configuration line: an option, its argument, and any trailing
/// tokens.
///
/// Tor allows some options to carry extra space-separated tokens after the
/// main argument (`SocksPort 9050 OnionTrafficOnly`, `HiddenServicePort 80
/// 127.0.0.1:8080`); those land in `extras` untyped.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Item {
    /// The option being configured.
    option: TorOption,
    /// The validated main argument.
    arg: Argument,
    /// Trailing tokens, if any.
    extras: Vec<String>,
}

impl Item {
    /// Construct an item, checking `arg` against what `option` accepts.
    pub fn new(option: TorOption, arg: impl Into<Argument>) -> Result<Self, TorrcError> {
        let arg = arg.into();
        option.check(&arg)?;
        Ok(Item {
            option,
            arg,
            extras: Vec::new(),
        })
    }

    /// Append a trailing token.
    pub fn with_extra(mut self, extra: impl Into<String>) -> Result<Self, TorrcError> {
        let extra = extra.into();
        if extra.contains(['\n', '\r']) {
            return Err(TorrcError::invalid(
                self.option.name(),
                "trailing token spans multiple lines",
            ));
        }
        self.extras.push(extra);
        Ok(self)
    }

    /// The option this item configures.
    pub fn option(&self) -> &TorOption {
        &self.option
    }

    /// The item's main argument.
    pub fn argument(&self) -> &Argument {
        &self.arg
    }

    /// The item's trailing tokens.
    pub fn extras(&self) -> &[String] {
        &self.extras
    }
}

impl Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.option, self.arg)?;
        for extra in &self.extras {
            write!(f, " {}", extra)?;
        }
        Ok(())
    }
}

/// One setting: a non-empty group of items that render contiguously.
///
/// For everything except hidden services this is a single item.  The first
/// item defines the setting's option and argument.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Setting {
    /// The items of this setting, in declaration order.  Never empty.
    items: Vec<Item>,
}

impl Setting {
    /// Construct a single-item setting.
    pub(crate) fn single(item: Item) -> Self {
        Setting { items: vec![item] }
    }

    /// Append an item to this setting.
    pub(crate) fn push(&mut self, item: Item) {
        self.items.push(item);
    }

    /// Replace the defining item's argument.
    ///
    /// The caller is responsible for keeping the new argument acceptable
    /// for the option; this is only used for fixed-port → `auto` rewrites.
    pub(crate) fn set_argument(&mut self, arg: Argument) {
        self.items[0].arg = arg;
    }

    /// The option of the setting's defining (first) item.
    pub fn option(&self) -> &TorOption {
        // Non-empty by construction.
        &self.items[0].option
    }

    /// The argument of the setting's defining (first) item.
    pub fn argument(&self) -> &Argument {
        &self.items[0].arg
    }

    /// All items, in declaration order.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Whether this setting is a hidden-service block.
    pub fn is_hidden_service(&self) -> bool {
        self.option().attrs().hidden_service
    }
}

impl Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for item in &self.items {
            if !first {
                writeln!(f)?;
            }
            first = false;
            write!(f, "{}", item)?;
        }
        Ok(())
    }
}

/// Where a hidden service forwards one virtual port.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum HsTarget {
    /// Forward to an IP address and port.
    Inet(SocketAddr),
    /// Forward to an AF_UNIX socket.
    Unix(UnixSocketAddr),
}

impl Display for HsTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HsTarget::Inet(a) => write!(f, "{}", a),
            HsTarget::Unix(u) => write!(f, "{}", u),
        }
    }
}

/// One `HiddenServicePort` mapping: a virtual port and an optional target.
///
/// With no target, tor forwards to the same port on localhost.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct HsPort {
    /// The port the service appears to listen on.
    virt: u16,
    /// Where connections are actually delivered.
    target: Option<HsTarget>,
}

impl HsPort {
    /// Map `virt` to the same port on localhost.
    pub fn new(virt: u16) -> Self {
        HsPort { virt, target: None }
    }

    /// Map `virt` to `target`.
    pub fn to_target(virt: u16, target: HsTarget) -> Self {
        HsPort {
            virt,
            target: Some(target),
        }
    }

    /// The virtual port.
    pub fn virtual_port(&self) -> u16 {
        self.virt
    }

    /// The target, if one was given.
    pub fn target(&self) -> Option<&HsTarget> {
        self.target.as_ref()
    }

    /// Convert into a `HiddenServicePort` item.
    fn into_item(self) -> Result<Item, TorrcError> {
        let item = Item::new(
            TorOption::HIDDEN_SERVICE_PORT,
            Argument::Port(PortValue::Fixed(self.virt)),
        )?;
        match self.target {
            Some(t) => item.with_extra(t.to_string()),
            None => Ok(item),
        }
    }
}

impl Display for HsPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(t) => write!(f, "{} {}", self.virt, t),
            None => write!(f, "{}", self.virt),
        }
    }
}

impl FromStr for HsPort {
    type Err = TorrcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |problem: &str| TorrcError::invalid("HiddenServicePort", problem);
        let mut words = s.split_whitespace();
        let virt = words
            .next()
            .ok_or_else(|| bad("missing virtual port"))?
            .parse::<u16>()
            .map_err(|_| bad("virtual port is not a number in 1..=65535"))?;
        if virt == 0 {
            return Err(bad("virtual port cannot be 0"));
        }
        let target = match words.next() {
            None => None,
            Some(t) if t.starts_with("unix:") => Some(HsTarget::Unix(t.parse()?)),
            Some(t) => Some(HsTarget::Inet(t.parse().map_err(|_| {
                bad("target is neither addr:port nor unix:\"<path>\"")
            })?)),
        };
        if words.next().is_some() {
            return Err(bad("trailing tokens after target"));
        }
        Ok(HsPort { virt, target })
    }
}

/// A hidden service: a directory, a protocol version, and at least one
/// virtual-port mapping.
///
/// Build one with [`HsService::builder`]; `build()` enforces the block
/// requirements, so a built value always converts into a valid
/// [`Setting`] via [`HsService::into_setting`].
#[derive(Clone, Debug, Eq, PartialEq, Builder)]
#[builder(build_fn(validate = "Self::validate", error = "TorrcError"))]
pub struct HsService {
    /// The service's key/hostname directory.  Must be absolute.
    #[builder(setter(into))]
    dir: PathBuf,
    /// The onion-service protocol version.  Only v3 exists today.
    #[builder(default = "3")]
    version: u8,
    /// The service's port mappings.
    #[builder(setter(custom), default)]
    ports: Vec<HsPort>,
}

impl HsService {
    /// Return a new builder.
    pub fn builder() -> HsServiceBuilder {
        HsServiceBuilder::default()
    }

    /// The service directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The protocol version.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// The port mappings.
    pub fn ports(&self) -> &[HsPort] {
        &self.ports
    }

    /// Convert into a contiguous hidden-service block.
    pub fn into_setting(self) -> Result<Setting, TorrcError> {
        let dir = Item::new(TorOption::HIDDEN_SERVICE_DIR, Argument::path(self.dir)?)?;
        let mut setting = Setting::single(dir);
        setting.push(Item::new(
            TorOption::HIDDEN_SERVICE_VERSION,
            Argument::Int(self.version.into()),
        )?);
        for port in self.ports {
            setting.push(port.into_item()?);
        }
        Ok(setting)
    }
}

impl HsServiceBuilder {
    /// Add one port mapping.
    pub fn port(&mut self, port: HsPort) -> &mut Self {
        self.ports.get_or_insert_with(Vec::new).push(port);
        self
    }

    /// Enforce the block requirements before `build()` succeeds.
    fn validate(&self) -> Result<(), TorrcError> {
        if self.ports.as_ref().map_or(true, Vec::is_empty) {
            return Err(TorrcError::MissingField("HiddenServicePort".to_string()));
        }
        if let Some(dir) = &self.dir {
            normalize_path("HiddenServiceDir", dir.clone()).map(|_| ())?;
        }
        if let Some(v) = self.version {
            if v != 3 {
                return Err(TorrcError::invalid(
                    "HiddenServiceVersion",
                    format!("unsupported version {}", v),
                ));
            }
        }
        Ok(())
    }
}
