//! Parsing torrc documents back into a [`TorrcBuilder`].
//!
//! The grammar is line-based: `Option Argument [extras...]`, `#` comments,
//! blank lines ignored.  Parsing goes through the same put path as the
//! builder API, so a parsed document obeys the same invariants as a
//! hand-built one.

use std::str::FromStr;

use crate::arg::{Argument, PortValue, TorBool, UnixSocketAddr};
use crate::build::{Torrc, TorrcBuilder};
use crate::err::TorrcError;
use crate::opt::{lookup, ArgKind, TorOption};
use crate::setting::Item;

impl FromStr for TorrcBuilder {
    type Err = TorrcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut builder = TorrcBuilder::new();
        for (idx, raw) in s.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let lineno = idx + 1;
            let item = parse_line(line).map_err(|e| TorrcError::Parse {
                line: lineno,
                problem: e.to_string(),
            })?;
            builder.put_item(item, false).map_err(|e| match e {
                stray @ TorrcError::StrayHsOption { .. } => TorrcError::Parse {
                    line: lineno,
                    problem: stray.to_string(),
                },
                other => other,
            })?;
        }
        Ok(builder)
    }
}

impl FromStr for Torrc {
    type Err = TorrcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<TorrcBuilder>()?.build()
    }
}

/// Parse one non-comment, non-blank torrc line into an [`Item`].
fn parse_line(line: &str) -> Result<Item, TorrcError> {
    let (name, rest) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    };
    let option = TorOption::named(name);
    let (arg, extras) = match lookup(name) {
        Some(def) => parse_known(name, def.kind(), rest)?,
        None => (Argument::string(rest)?, Vec::new()),
    };
    let mut item = Item::new(option, arg)?;
    for extra in extras {
        item = item.with_extra(extra)?;
    }
    Ok(item)
}

/// Parse the argument (and trailing tokens) of a known option.
fn parse_known(
    name: &str,
    kind: ArgKind,
    rest: &str,
) -> Result<(Argument, Vec<String>), TorrcError> {
    if rest.is_empty() {
        return Err(TorrcError::invalid(name, "missing argument"));
    }
    match kind {
        ArgKind::Bool => {
            let b: TorBool = rest
                .parse()
                .map_err(|_| TorrcError::invalid(name, format!("{:?} is not 0 or 1", rest)))?;
            Ok((Argument::Bool(b), Vec::new()))
        }
        ArgKind::Int => {
            let i: i64 = rest
                .parse()
                .map_err(|_| TorrcError::invalid(name, format!("{:?} is not an integer", rest)))?;
            Ok((Argument::Int(i), Vec::new()))
        }
        ArgKind::Path => {
            let path = unquote(rest);
            Ok((Argument::path(path)?, Vec::new()))
        }
        ArgKind::Str => Ok((Argument::string(rest)?, Vec::new())),
        ArgKind::Port => {
            let (first, remainder) = next_token(rest);
            let arg = parse_listener(name, first)?;
            let extras = remainder
                .split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>();
            Ok((arg, extras))
        }
    }
}

/// Parse a listener argument: a port value, a socket address, a bare
/// address, or an AF_UNIX path.
fn parse_listener(name: &str, token: &str) -> Result<Argument, TorrcError> {
    if token.starts_with("unix:") {
        let u: UnixSocketAddr = token.parse()?;
        return Ok(Argument::UnixSocket(u));
    }
    if let Ok(p) = token.parse::<PortValue>() {
        return Ok(Argument::Port(p));
    }
    if let Ok(sa) = token.parse::<std::net::SocketAddr>() {
        return Ok(Argument::SockAddr(sa));
    }
    if let Ok(a) = token.parse::<std::net::IpAddr>() {
        return Ok(Argument::Addr(a));
    }
    Err(TorrcError::invalid(
        name,
        format!("{:?} is not a port, address, or unix:\"<path>\" listener", token),
    ))
}

/// Split off the first token of `rest`, keeping `unix:"..."` (which may
/// contain spaces) intact.
fn next_token(rest: &str) -> (&str, &str) {
    if let Some(tail) = rest.strip_prefix("unix:\"") {
        if let Some(close) = tail.find('"') {
            let end = "unix:\"".len() + close + 1;
            return (&rest[..end], rest[end..].trim_start());
        }
    }
    match rest.split_once(char::is_whitespace) {
        Some((tok, tail)) => (tok, tail.trim_start()),
        None => (rest, ""),
    }
}

/// Strip one level of surrounding double quotes, if present.
fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(s)
}
