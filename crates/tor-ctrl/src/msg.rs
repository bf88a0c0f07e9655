//! Reply lines, complete replies, and asynchronous events.

use std::fmt::{self, Display};

use crate::err::{Error, Result};
use crate::event::EventKind;

/// A control-protocol status code: three decimal digits.
///
/// The leading digit gives the class: `2` success, `6` asynchronous event,
/// everything else an error of one flavor or another.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Status(u16);

impl Status {
    /// The canonical success status, `250`.
    pub const OK: Status = Status(250);

    /// Wrap a status code.  Returns `None` unless `code` has three digits.
    pub fn new(code: u16) -> Option<Status> {
        (100..=999).contains(&code).then_some(Status(code))
    }

    /// The numeric code.
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// True for `2xx` replies.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    /// True for `6xx` (asynchronous event) replies.
    pub fn is_async(&self) -> bool {
        (600..700).contains(&self.0)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

/// One parsed line of a reply.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplyLine {
    /// The line's status code.
    pub status: Status,
    /// The text after the `SSSD` header.
    pub text: String,
    /// For `+` lines: the data body, unescaped, without the terminating
    /// `.` line.  Lines within the body are joined with `\n`.
    ///
    /// Bytes, not a `String`: tor does not promise UTF-8 here (`CELL_STATS`
    /// in particular).
    pub data: Option<Vec<u8>>,
}

impl ReplyLine {
    /// Split `text` at the first `=`, if any.
    ///
    /// Most keyword replies (`GETCONF`, `GETINFO`, `ADD_ONION`) use
    /// `Key=Value` lines.
    pub fn keyword_pair(&self) -> Option<(&str, &str)> {
        self.text.split_once('=')
    }
}

/// A complete reply set: one or more lines, the last of which was
/// `' '`-terminated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reply {
    /// The reply's lines, in wire order.  Never empty.
    lines: Vec<ReplyLine>,
}

impl Reply {
    /// Assemble a reply from accumulated lines.
    ///
    /// Callers must pass at least one line.
    pub(crate) fn from_lines(lines: Vec<ReplyLine>) -> Reply {
        debug_assert!(!lines.is_empty());
        Reply { lines }
    }

    /// The status of the final line, which is the status of the reply.
    pub fn status(&self) -> Status {
        match self.lines.last() {
            Some(line) => line.status,
            // Unreachable by construction; return something non-2xx.
            None => Status(551),
        }
    }

    /// All lines of this reply.
    pub fn lines(&self) -> &[ReplyLine] {
        &self.lines
    }

    /// True if the reply is the canonical `250 OK`.
    pub fn is_ok(&self) -> bool {
        self.status() == Status::OK
    }

    /// Convert a non-success reply into [`Error::Rejected`].
    pub(crate) fn into_result(self) -> Result<Reply> {
        if self.status().is_success() {
            Ok(self)
        } else {
            let status = self.status();
            let lines = self.lines.into_iter().map(|l| l.text).collect();
            Err(Error::rejected(status, lines))
        }
    }
}

/// An asynchronous (`6xx`) message from tor.
#[derive(Clone, Debug)]
pub struct TorEvent {
    /// Which event this is.
    pub kind: EventKind,
    /// The remainder of the first line, after the event keyword.
    pub content: String,
    /// Any further lines of the event's reply set.
    pub extra: Vec<ReplyLine>,
}

impl TorEvent {
    /// Build an event from a completed `6xx` reply set.
    pub(crate) fn from_reply(reply: Reply) -> Result<TorEvent> {
        let mut lines = reply.lines.into_iter();
        let first = lines
            .next()
            .ok_or_else(|| Error::proto("empty event reply"))?;
        let (keyword, content) = match first.text.split_once(' ') {
            Some((k, rest)) => (k, rest.to_string()),
            None => (first.text.as_str(), String::new()),
        };
        let kind: EventKind = keyword
            .parse()
            .unwrap_or_else(|_| EventKind::Unrecognized(keyword.to_string()));
        Ok(TorEvent {
            kind,
            content,
            extra: lines.collect(),
        })
    }
}

/// Parse the `SSSD` header of a reply line.
///
/// Returns the status, the separator (`' '`, `'-'`, or `'+'`), and the
/// remaining text.
pub(crate) fn parse_header(line: &str) -> Result<(Status, char, &str)> {
    let mut chars = line.chars();
    let mut code: u16 = 0;
    for _ in 0..3 {
        let c = chars
            .next()
            .and_then(|c| c.to_digit(10))
            .ok_or_else(|| Error::proto(format!("malformed reply line {:?}", line)))?;
        code = code * 10 + c as u16;
    }
    let sep = chars
        .next()
        .ok_or_else(|| Error::proto(format!("truncated reply line {:?}", line)))?;
    if !matches!(sep, ' ' | '-' | '+') {
        return Err(Error::proto(format!(
            "unknown reply separator {:?} in {:?}",
            sep, line
        )));
    }
    let status =
        Status::new(code).ok_or_else(|| Error::proto(format!("status {} out of range", code)))?;
    Ok((status, sep, chars.as_str()))
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn header_parsing() {
        let (status, sep, rest) = parse_header("250 OK").unwrap();
        assert_eq!(status, Status::OK);
        assert_eq!(sep, ' ');
        assert_eq!(rest, "OK");

        let (status, sep, rest) = parse_header("650-BW 123 456").unwrap();
        assert_eq!(status.as_u16(), 650);
        assert_eq!(sep, '-');
        assert_eq!(rest, "BW 123 456");

        let (_, sep, rest) = parse_header("250+info/names=").unwrap();
        assert_eq!(sep, '+');
        assert_eq!(rest, "info/names=");

        assert_matches!(parse_header("xyz"), Err(Error::Protocol(_)));
        assert_matches!(parse_header("25"), Err(Error::Protocol(_)));
        assert_matches!(parse_header("250#nope"), Err(Error::Protocol(_)));
    }

    #[test]
    fn reply_status_classes() {
        assert!(Status::OK.is_success());
        assert!(!Status::OK.is_async());
        assert!(Status::new(650).unwrap().is_async());
        assert!(!Status::new(550).unwrap().is_success());
        assert!(Status::new(99).is_none());
        assert!(Status::new(1000).is_none());
    }

    #[test]
    fn rejected_replies_become_errors() {
        let reply = Reply::from_lines(vec![ReplyLine {
            status: Status::new(552).unwrap(),
            text: "Unrecognized option".into(),
            data: None,
        }]);
        let err = reply.into_result().unwrap_err();
        assert_matches!(
            err,
            Error::Rejected { status, ref first_line, .. }
                if status.as_u16() == 552 && first_line == "Unrecognized option"
        );
    }

    #[test]
    fn event_from_reply() {
        let reply = Reply::from_lines(vec![ReplyLine {
            status: Status::new(650).unwrap(),
            text: "STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=85".into(),
            data: None,
        }]);
        let event = TorEvent::from_reply(reply).unwrap();
        assert_eq!(event.kind, EventKind::StatusClient);
        assert_eq!(event.content, "NOTICE BOOTSTRAP PROGRESS=85");
        assert!(event.extra.is_empty());
    }

    #[test]
    fn unknown_event_kinds_pass_through() {
        let reply = Reply::from_lines(vec![ReplyLine {
            status: Status::new(650).unwrap(),
            text: "FROBNICATE all the things".into(),
            data: None,
        }]);
        let event = TorEvent::from_reply(reply).unwrap();
        assert_matches!(event.kind, EventKind::Unrecognized(ref k) if k == "FROBNICATE");
    }
}
