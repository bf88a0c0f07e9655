//! Control-port authentication.
//!
//! Authentication is a two-step dance: `PROTOCOLINFO` reports which methods
//! this tor accepts (and where the auth cookie lives), then `AUTHENTICATE`
//! presents a credential.  We pick the strongest method we can actually
//! satisfy: a readable cookie beats a password, a password beats nothing.

use std::fmt;
use std::path::{Path, PathBuf};

use data_encoding::HEXLOWER;
use tracing::debug;

use crate::cmd::Command;
use crate::conn::ControlConn;
use crate::err::{Error, Result};
use crate::msg::Reply;

/// The length tor's control auth cookie always has.
const COOKIE_LEN: usize = 32;

/// An authentication method advertised in `PROTOCOLINFO`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[derive(strum::Display, strum::EnumString)]
#[non_exhaustive]
pub enum AuthMethod {
    /// No authentication required.
    #[strum(serialize = "NULL")]
    Null,
    /// A password, hashed into the tor configuration.
    #[strum(serialize = "HASHEDPASSWORD")]
    HashedPassword,
    /// The contents of a cookie file, in hex.
    #[strum(serialize = "COOKIE")]
    Cookie,
    /// Challenge-response over the cookie.  Not implemented here.
    #[strum(serialize = "SAFECOOKIE")]
    SafeCookie,
    /// A method this crate has no name for.
    #[strum(default, to_string = "{0}")]
    Unknown(String),
}

/// Parsed output of `PROTOCOLINFO`.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ProtocolInfo {
    /// Methods tor will accept, in tor's order.
    pub auth_methods: Vec<AuthMethod>,
    /// Where the auth cookie lives, when cookie auth is available.
    pub cookie_file: Option<PathBuf>,
    /// Tor's version string, if it sent one.
    pub tor_version: Option<String>,
}

impl ProtocolInfo {
    /// Parse a `PROTOCOLINFO` reply.
    pub(crate) fn from_reply(reply: &Reply) -> Result<ProtocolInfo> {
        let mut auth_methods = Vec::new();
        let mut cookie_file = None;
        let mut tor_version = None;
        for line in reply.lines() {
            if let Some(rest) = line.text.strip_prefix("AUTH ") {
                for field in split_fields(rest) {
                    if let Some(methods) = field.strip_prefix("METHODS=") {
                        auth_methods = methods
                            .split(',')
                            .map(|m| {
                                m.parse()
                                    .unwrap_or_else(|_| AuthMethod::Unknown(m.to_string()))
                            })
                            .collect();
                    } else if let Some(path) = field.strip_prefix("COOKIEFILE=") {
                        cookie_file = Some(PathBuf::from(unquote(path)));
                    }
                }
            } else if let Some(rest) = line.text.strip_prefix("VERSION ") {
                for field in split_fields(rest) {
                    if let Some(v) = field.strip_prefix("Tor=") {
                        tor_version = Some(unquote(v));
                    }
                }
            }
        }
        if auth_methods.is_empty() {
            return Err(Error::proto("PROTOCOLINFO reply without AUTH METHODS"));
        }
        Ok(ProtocolInfo {
            auth_methods,
            cookie_file,
            tor_version,
        })
    }
}

/// Split a PROTOCOLINFO line into fields, keeping quoted strings (which may
/// contain spaces) intact.
fn split_fields(s: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut rest = s.trim();
    while !rest.is_empty() {
        let end = match rest.find('"') {
            // A quote before the next space: the field runs to the closing
            // quote.
            Some(q) if rest[..q].find(' ').is_none() => rest[q + 1..]
                .find('"')
                .map(|close| q + 1 + close + 1)
                .unwrap_or(rest.len()),
            _ => rest.find(' ').unwrap_or(rest.len()),
        };
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    fields
}

/// Strip surrounding quotes and unescape `\"` and `\\`.
fn unquote(s: &str) -> String {
    let inner = s
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .unwrap_or(s);
    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    out
}

/// A credential to present with `AUTHENTICATE`.
#[derive(Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum AuthCredential {
    /// No credential (NULL auth).
    Null,
    /// The cookie's bytes.
    Cookie(Vec<u8>),
    /// A configured password.
    Password(String),
}

impl AuthCredential {
    /// Wire form of the `AUTHENTICATE` command carrying this credential.
    pub(crate) fn encode(&self) -> String {
        match self {
            AuthCredential::Null => "AUTHENTICATE".to_string(),
            AuthCredential::Cookie(bytes) => {
                format!("AUTHENTICATE {}", HEXLOWER.encode(bytes))
            }
            AuthCredential::Password(pw) => {
                let mut quoted = String::with_capacity(pw.len() + 2);
                quoted.push('"');
                for c in pw.chars() {
                    if matches!(c, '"' | '\\') {
                        quoted.push('\\');
                    }
                    quoted.push(c);
                }
                quoted.push('"');
                format!("AUTHENTICATE {}", quoted)
            }
        }
    }
}

impl fmt::Debug for AuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The credential is secret; say only which kind it is.
        match self {
            AuthCredential::Null => write!(f, "AuthCredential::Null"),
            AuthCredential::Cookie(_) => write!(f, "AuthCredential::Cookie(..)"),
            AuthCredential::Password(_) => write!(f, "AuthCredential::Password(..)"),
        }
    }
}

/// Read and check a control auth cookie.
fn read_cookie(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::Auth(format!("cannot read cookie {}: {}", path.display(), e)))?;
    if bytes.len() != COOKIE_LEN {
        return Err(Error::Auth(format!(
            "cookie {} has {} bytes, expected {}",
            path.display(),
            bytes.len(),
            COOKIE_LEN
        )));
    }
    Ok(bytes)
}

/// Choose the strongest credential we can satisfy from `info`.
pub(crate) fn select_credential(
    info: &ProtocolInfo,
    password: Option<&str>,
) -> Result<AuthCredential> {
    if info.auth_methods.contains(&AuthMethod::Cookie) {
        if let Some(path) = &info.cookie_file {
            match read_cookie(path) {
                Ok(cookie) => return Ok(AuthCredential::Cookie(cookie)),
                // Fall through: maybe another method works.
                Err(e) => debug!("cookie auth unavailable: {}", e),
            }
        }
    }
    if info.auth_methods.contains(&AuthMethod::HashedPassword) {
        if let Some(pw) = password {
            return Ok(AuthCredential::Password(pw.to_string()));
        }
    }
    if info.auth_methods.contains(&AuthMethod::Null) {
        return Ok(AuthCredential::Null);
    }
    Err(Error::Auth(format!(
        "no usable method among {:?}",
        info.auth_methods
    )))
}

/// Authenticate `conn`: `PROTOCOLINFO`, then `AUTHENTICATE` with the
/// strongest satisfiable method.
///
/// A failure here is fatal to the connection; callers should close it.
pub async fn authenticate(conn: &ControlConn, password: Option<&str>) -> Result<ProtocolInfo> {
    let reply = conn.execute(Command::ProtocolInfo).await?;
    let info = match reply {
        crate::cmd::CommandReply::ProtocolInfo(info) => info,
        _ => return Err(Error::proto("unexpected PROTOCOLINFO decode")),
    };
    let credential = select_credential(&info, password)?;
    conn.execute(Command::Authenticate(credential))
        .await
        .map_err(|e| match e {
            Error::Rejected { first_line, .. } => Error::Auth(first_line),
            other => other,
        })?;
    debug!(
        "control connection authenticated (tor {})",
        info.tor_version.as_deref().unwrap_or("unknown")
    );
    Ok(info)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::msg::{ReplyLine, Status};
    use assert_matches::assert_matches;

    fn protocolinfo_reply(auth_line: &str) -> Reply {
        Reply::from_lines(vec![
            ReplyLine {
                status: Status::OK,
                text: "PROTOCOLINFO 1".into(),
                data: None,
            },
            ReplyLine {
                status: Status::OK,
                text: auth_line.into(),
                data: None,
            },
            ReplyLine {
                status: Status::OK,
                text: "VERSION Tor=\"0.4.8.12\"".into(),
                data: None,
            },
            ReplyLine {
                status: Status::OK,
                text: "OK".into(),
                data: None,
            },
        ])
    }

    #[test]
    fn parse_protocolinfo() {
        let info = ProtocolInfo::from_reply(&protocolinfo_reply(
            "AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE=\"/run/tor/control auth cookie\"",
        ))
        .unwrap();
        assert_eq!(
            info.auth_methods,
            vec![AuthMethod::Cookie, AuthMethod::SafeCookie]
        );
        assert_eq!(
            info.cookie_file.as_deref(),
            Some(Path::new("/run/tor/control auth cookie"))
        );
        assert_eq!(info.tor_version.as_deref(), Some("0.4.8.12"));
    }

    #[test]
    fn missing_auth_line_is_a_protocol_error() {
        let reply = Reply::from_lines(vec![ReplyLine {
            status: Status::OK,
            text: "OK".into(),
            data: None,
        }]);
        assert_matches!(ProtocolInfo::from_reply(&reply), Err(Error::Protocol(_)));
    }

    #[test]
    fn cookie_beats_password_beats_null() {
        let dir = tempfile::tempdir().unwrap();
        let cookie_path = dir.path().join("control_auth_cookie");
        std::fs::write(&cookie_path, [0xAB_u8; 32]).unwrap();

        let info = ProtocolInfo {
            auth_methods: vec![
                AuthMethod::Null,
                AuthMethod::HashedPassword,
                AuthMethod::Cookie,
            ],
            cookie_file: Some(cookie_path.clone()),
            tor_version: None,
        };
        let cred = select_credential(&info, Some("hunter2")).unwrap();
        assert_matches!(cred, AuthCredential::Cookie(ref c) if c.len() == 32);

        // No cookie file on disk: fall back to the password.
        std::fs::remove_file(&cookie_path).unwrap();
        let cred = select_credential(&info, Some("hunter2")).unwrap();
        assert_matches!(cred, AuthCredential::Password(_));

        // No password either: NULL.
        let cred = select_credential(&info, None).unwrap();
        assert_matches!(cred, AuthCredential::Null);
    }

    #[test]
    fn unsupported_methods_fail() {
        let info = ProtocolInfo {
            auth_methods: vec![AuthMethod::SafeCookie],
            cookie_file: None,
            tor_version: None,
        };
        assert_matches!(select_credential(&info, None), Err(Error::Auth(_)));
    }

    #[test]
    fn credential_encodings() {
        assert_eq!(AuthCredential::Null.encode(), "AUTHENTICATE");
        assert_eq!(
            AuthCredential::Cookie(vec![0xAB, 0xCD]).encode(),
            "AUTHENTICATE abcd"
        );
        assert_eq!(
            AuthCredential::Password("pa\"ss".into()).encode(),
            "AUTHENTICATE \"pa\\\"ss\""
        );
        // And none of them leak through Debug.
        let shown = format!("{:?}", AuthCredential::Password("hunter2".into()));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn truncated_cookie_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cookie_path = dir.path().join("cookie");
        std::fs::write(&cookie_path, [0_u8; 7]).unwrap();
        assert_matches!(read_cookie(&cookie_path), Err(Error::Auth(_)));
    }
}
