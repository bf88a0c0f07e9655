//! Typed control commands and their decoded replies.
//!
//! Commands are one discriminated union rather than one type per command:
//! each variant knows how to encode itself on the wire and how to decode
//! its (already success-checked) reply into a [`CommandReply`].

use std::collections::BTreeSet;

use crate::auth::{AuthCredential, ProtocolInfo};
use crate::err::{Error, Result};
use crate::event::EventKind;
use crate::keys::{ClientAuthEntry, OnionAddrV3, X25519PublicKey, X25519SecretKey};
use crate::msg::Reply;

/// Signals tor accepts via `SIGNAL`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[derive(strum::Display, strum::EnumString)]
#[strum(serialize_all = "UPPERCASE")]
#[non_exhaustive]
pub enum TorSignal {
    /// Switch to new circuits, clear client-side caches.
    Newnym,
    /// Dump statistics to the log.
    Dump,
    /// Switch the log to debug verbosity.
    Debug,
    /// Reload configuration (as if on SIGHUP).
    Reload,
    /// Exit immediately.
    Halt,
    /// Clean shutdown: close listeners, exit after a grace period.
    Shutdown,
    /// Leave dormant mode.
    Active,
    /// Enter dormant mode.
    Dormant,
}

/// One `key[=value]` assignment for `SETCONF`/`RESETCONF`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConfSetting {
    /// The option name.
    pub key: String,
    /// The value; `None` resets the option to its default.
    pub value: Option<String>,
}

impl ConfSetting {
    /// Assign `value` to `key`.
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> ConfSetting {
        ConfSetting {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Reset `key` to its default.
    pub fn reset(key: impl Into<String>) -> ConfSetting {
        ConfSetting {
            key: key.into(),
            value: None,
        }
    }

    /// Wire form.
    fn encode(&self) -> String {
        match &self.value {
            None => self.key.clone(),
            Some(v) => format!("{}={}", self.key, quote_if_needed(v)),
        }
    }
}

/// Quote `v` as a control-protocol QuotedString when it needs it.
fn quote_if_needed(v: &str) -> String {
    if !v.is_empty() && !v.contains([' ', '"', '\\']) {
        return v.to_string();
    }
    let mut out = String::with_capacity(v.len() + 2);
    out.push('"');
    for c in v.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// The key material passed to `ADD_ONION`.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum AddOnionKey {
    /// Have tor generate a key with its best supported algorithm.
    NewBest,
    /// Have tor generate an ed25519 key.
    NewEd25519,
    /// Use an existing ed25519 key, as tor's base64 expanded-key blob.
    Ed25519V3(String),
}

impl AddOnionKey {
    /// Wire form.
    fn encode(&self) -> String {
        match self {
            AddOnionKey::NewBest => "NEW:BEST".to_string(),
            AddOnionKey::NewEd25519 => "NEW:ED25519-V3".to_string(),
            AddOnionKey::Ed25519V3(blob) => format!("ED25519-V3:{}", blob),
        }
    }
}

/// Flags accepted by `ADD_ONION`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, strum::Display)]
#[non_exhaustive]
pub enum OnionFlag {
    /// Do not return the private key in the reply.
    #[strum(serialize = "DiscardPK")]
    DiscardPk,
    /// Keep the service alive after this control connection closes.
    #[strum(serialize = "Detach")]
    Detach,
    /// The service requires client authorization.
    #[strum(serialize = "V3Auth")]
    V3Auth,
    /// Run in single-onion (non-anonymous) mode.
    #[strum(serialize = "NonAnonymous")]
    NonAnonymous,
    /// Close the circuit when `MaxStreams` is exceeded.
    #[strum(serialize = "MaxStreamsCloseCircuit")]
    MaxStreamsCloseCircuit,
}

/// One `Port=` mapping for `ADD_ONION`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OnionPort {
    /// The virtual port the service exposes.
    pub virt: u16,
    /// The target (`addr:port` or `unix:/path`); same-port localhost when
    /// absent.
    pub target: Option<String>,
}

impl OnionPort {
    /// Wire form.
    fn encode(&self) -> String {
        match &self.target {
            Some(t) => format!("Port={},{}", self.virt, t),
            None => format!("Port={}", self.virt),
        }
    }
}

/// Everything `ADD_ONION` needs.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct AddOnion {
    /// Service key.
    pub key: AddOnionKey,
    /// Service flags.
    pub flags: Vec<OnionFlag>,
    /// Stream limit, if any.
    pub max_streams: Option<u16>,
    /// Port mappings; tor requires at least one.
    pub ports: Vec<OnionPort>,
    /// Authorized client public keys.
    pub client_auth_v3: Vec<X25519PublicKey>,
}

impl AddOnion {
    /// Construct a minimal request: one key, one port.
    pub fn new(key: AddOnionKey, ports: Vec<OnionPort>) -> AddOnion {
        AddOnion {
            key,
            flags: Vec::new(),
            max_streams: None,
            ports,
            client_auth_v3: Vec::new(),
        }
    }
}

/// A typed control command.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Command {
    /// `PROTOCOLINFO`: what auth does this tor accept?
    ProtocolInfo,
    /// `AUTHENTICATE` with the given credential.
    Authenticate(AuthCredential),
    /// `GETCONF key...`
    GetConf(Vec<String>),
    /// `SETCONF key=value...`
    SetConf(Vec<ConfSetting>),
    /// `RESETCONF key[=value]...`
    ResetConf(Vec<ConfSetting>),
    /// `GETINFO key...`
    GetInfo(Vec<String>),
    /// `SIGNAL <sig>`
    Signal(TorSignal),
    /// `SETEVENTS <kinds>`
    SetEvents(BTreeSet<EventKind>),
    /// `ADD_ONION`
    AddOnion(AddOnion),
    /// `DEL_ONION <service-id>`
    DelOnion(OnionAddrV3),
    /// `ONION_CLIENT_AUTH_ADD`
    OnionClientAuthAdd {
        /// The service and secret key to register.
        entry: ClientAuthEntry,
        /// Optional human-readable client name.
        client_name: Option<String>,
        /// Ask tor to persist the credential to disk.
        permanent: bool,
    },
    /// `ONION_CLIENT_AUTH_REMOVE <service-id>`
    OnionClientAuthRemove(OnionAddrV3),
    /// `ONION_CLIENT_AUTH_VIEW [service-id]`
    OnionClientAuthView(Option<OnionAddrV3>),
    /// `TAKEOWNERSHIP`: tor exits when this connection closes.
    TakeOwnership,
    /// `RESOLVE [mode=reverse] <hostname>`; answers arrive as `ADDRMAP`
    /// events.
    Resolve {
        /// The name (or, reversed, address) to look up.
        hostname: String,
        /// Reverse lookup?
        reverse: bool,
    },
    /// `DROPGUARDS`
    DropGuards,
    /// `MAPADDRESS old=new...`
    MapAddress(Vec<(String, String)>),
    /// `SAVECONF [FORCE]`
    SaveConf {
        /// Overwrite the torrc even if `%include` is in use.
        force: bool,
    },
    /// `QUIT`: ask tor to close this connection.
    Quit,
}

impl Command {
    /// The keyword the command starts with, for logging.
    pub fn keyword(&self) -> &'static str {
        use Command::*;
        match self {
            ProtocolInfo => "PROTOCOLINFO",
            Authenticate(_) => "AUTHENTICATE",
            GetConf(_) => "GETCONF",
            SetConf(_) => "SETCONF",
            ResetConf(_) => "RESETCONF",
            GetInfo(_) => "GETINFO",
            Signal(_) => "SIGNAL",
            SetEvents(_) => "SETEVENTS",
            AddOnion(_) => "ADD_ONION",
            DelOnion(_) => "DEL_ONION",
            OnionClientAuthAdd { .. } => "ONION_CLIENT_AUTH_ADD",
            OnionClientAuthRemove(_) => "ONION_CLIENT_AUTH_REMOVE",
            OnionClientAuthView(_) => "ONION_CLIENT_AUTH_VIEW",
            TakeOwnership => "TAKEOWNERSHIP",
            Resolve { .. } => "RESOLVE",
            DropGuards => "DROPGUARDS",
            MapAddress(_) => "MAPADDRESS",
            SaveConf { .. } => "SAVECONF",
            Quit => "QUIT",
        }
    }

    /// The command's full wire form, without the trailing CRLF.
    pub fn encode(&self) -> String {
        use Command::*;
        match self {
            ProtocolInfo => "PROTOCOLINFO 1".to_string(),
            Authenticate(cred) => cred.encode(),
            GetConf(keys) => join_after("GETCONF", keys.iter()),
            SetConf(settings) => join_after("SETCONF", settings.iter().map(ConfSetting::encode)),
            ResetConf(settings) => {
                join_after("RESETCONF", settings.iter().map(ConfSetting::encode))
            }
            GetInfo(keys) => join_after("GETINFO", keys.iter()),
            Signal(sig) => format!("SIGNAL {}", sig),
            SetEvents(kinds) => join_after("SETEVENTS", kinds.iter().map(EventKind::to_string)),
            AddOnion(req) => {
                let mut line = format!("ADD_ONION {}", req.key.encode());
                if !req.flags.is_empty() {
                    line.push_str(" Flags=");
                    line.push_str(
                        &req.flags
                            .iter()
                            .map(OnionFlag::to_string)
                            .collect::<Vec<_>>()
                            .join(","),
                    );
                }
                if let Some(n) = req.max_streams {
                    line.push_str(&format!(" MaxStreams={}", n));
                }
                for port in &req.ports {
                    line.push(' ');
                    line.push_str(&port.encode());
                }
                for key in &req.client_auth_v3 {
                    line.push_str(&format!(" ClientAuthV3={}", key.to_base32()));
                }
                line
            }
            DelOnion(addr) => format!("DEL_ONION {}", addr),
            OnionClientAuthAdd {
                entry,
                client_name,
                permanent,
            } => {
                let mut line = format!(
                    "ONION_CLIENT_AUTH_ADD {} x25519:{}",
                    entry.addr,
                    entry.key.to_base64()
                );
                if let Some(name) = client_name {
                    line.push_str(&format!(" ClientName={}", name));
                }
                if *permanent {
                    line.push_str(" Flags=Permanent");
                }
                line
            }
            OnionClientAuthRemove(addr) => format!("ONION_CLIENT_AUTH_REMOVE {}", addr),
            OnionClientAuthView(addr) => match addr {
                Some(a) => format!("ONION_CLIENT_AUTH_VIEW {}", a),
                None => "ONION_CLIENT_AUTH_VIEW".to_string(),
            },
            TakeOwnership => "TAKEOWNERSHIP".to_string(),
            Resolve { hostname, reverse } => {
                if *reverse {
                    format!("RESOLVE mode=reverse {}", hostname)
                } else {
                    format!("RESOLVE {}", hostname)
                }
            }
            DropGuards => "DROPGUARDS".to_string(),
            MapAddress(pairs) => join_after(
                "MAPADDRESS",
                pairs.iter().map(|(old, new)| format!("{}={}", old, new)),
            ),
            SaveConf { force } => {
                if *force {
                    "SAVECONF FORCE".to_string()
                } else {
                    "SAVECONF".to_string()
                }
            }
            Quit => "QUIT".to_string(),
        }
    }

    /// Decode a success reply into this command's typed output.
    pub fn decode(&self, reply: Reply) -> Result<CommandReply> {
        use Command::*;
        match self {
            ProtocolInfo => Ok(CommandReply::ProtocolInfo(
                crate::auth::ProtocolInfo::from_reply(&reply)?,
            )),
            GetConf(_) => {
                let mut values = Vec::new();
                for line in reply.lines() {
                    match line.keyword_pair() {
                        Some((k, v)) => values.push((k.to_string(), Some(v.to_string()))),
                        // A bare keyword means "set to its default".
                        None if !line.text.is_empty() && line.text != "OK" => {
                            values.push((line.text.clone(), None));
                        }
                        None => {}
                    }
                }
                Ok(CommandReply::ConfValues(values))
            }
            GetInfo(_) => {
                let mut values = Vec::new();
                for line in reply.lines() {
                    if let Some(body) = &line.data {
                        let key = line.text.trim_end_matches('=').to_string();
                        values.push((key, String::from_utf8_lossy(body).into_owned()));
                    } else if let Some((k, v)) = line.keyword_pair() {
                        values.push((k.to_string(), v.to_string()));
                    }
                }
                Ok(CommandReply::Info(values))
            }
            AddOnion(_) => {
                let mut service_id = None;
                let mut private_key = None;
                for line in reply.lines() {
                    match line.keyword_pair() {
                        Some(("ServiceID", v)) => {
                            service_id =
                                Some(v.parse::<OnionAddrV3>().map_err(Error::proto)?);
                        }
                        Some(("PrivateKey", v)) => private_key = Some(v.to_string()),
                        _ => {}
                    }
                }
                let service_id =
                    service_id.ok_or_else(|| Error::proto("ADD_ONION reply without ServiceID"))?;
                Ok(CommandReply::Onion(OnionService {
                    service_id,
                    private_key,
                }))
            }
            OnionClientAuthView(_) => {
                let mut credentials = Vec::new();
                for line in reply.lines() {
                    let Some(rest) = line.text.strip_prefix("CLIENT ") else {
                        continue;
                    };
                    let mut words = rest.split_whitespace();
                    let (Some(addr), Some(keyspec)) = (words.next(), words.next()) else {
                        return Err(Error::proto("malformed ONION_CLIENT_AUTH_VIEW line"));
                    };
                    let key = keyspec
                        .strip_prefix("x25519:")
                        .ok_or_else(|| Error::proto("client auth key is not x25519"))?;
                    credentials.push(ClientAuthEntry {
                        addr: addr.parse().map_err(Error::proto)?,
                        key: X25519SecretKey::from_base64(key).map_err(Error::proto)?,
                    });
                }
                Ok(CommandReply::ClientAuthCredentials(credentials))
            }
            MapAddress(_) => {
                let mut mapped = Vec::new();
                for line in reply.lines() {
                    if let Some((old, new)) = line.keyword_pair() {
                        mapped.push((old.to_string(), new.to_string()));
                    }
                }
                Ok(CommandReply::Mapped(mapped))
            }
            _ => Ok(CommandReply::Ok),
        }
    }
}

/// `"<keyword> a b c"`, skipping the space when the list is empty.
fn join_after<I, T>(keyword: &str, items: I) -> String
where
    I: Iterator<Item = T>,
    T: AsRef<str>,
{
    let mut line = keyword.to_string();
    for item in items {
        line.push(' ');
        line.push_str(item.as_ref());
    }
    line
}

/// The typed output of a successfully executed [`Command`].
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum CommandReply {
    /// The command has no output beyond success.
    Ok,
    /// Output of `PROTOCOLINFO`.
    ProtocolInfo(ProtocolInfo),
    /// Output of `GETCONF`: `(key, value)` pairs, `None` meaning default.
    ConfValues(Vec<(String, Option<String>)>),
    /// Output of `GETINFO`: `(key, value)` pairs.
    Info(Vec<(String, String)>),
    /// Output of `ADD_ONION`.
    Onion(OnionService),
    /// Output of `ONION_CLIENT_AUTH_VIEW`.
    ClientAuthCredentials(Vec<ClientAuthEntry>),
    /// Output of `MAPADDRESS`.
    Mapped(Vec<(String, String)>),
}

impl CommandReply {
    /// Extract the single value of a one-key `GETINFO`.
    pub fn into_info_value(self, key: &str) -> Result<String> {
        match self {
            CommandReply::Info(values) => values
                .into_iter()
                .find_map(|(k, v)| (k == key).then_some(v))
                .ok_or_else(|| Error::proto(format!("GETINFO reply missing {}", key))),
            _ => Err(Error::proto("reply is not a GETINFO reply")),
        }
    }
}

/// An onion service created with `ADD_ONION`.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct OnionService {
    /// The service's address.
    pub service_id: OnionAddrV3,
    /// The service's private key, unless `DiscardPK` was set or the key
    /// was caller-supplied.
    pub private_key: Option<String>,
}
