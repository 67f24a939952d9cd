//! beanstalkd text protocol: request encoding and reply parsing.
//!
//! Every request is a single CRLF-terminated line, optionally followed by a
//! body (`put`). Replies are a status line, optionally followed by
//! `<bytes>` of data and a trailing CRLF.

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::broker::TransportError;

/// Longest status line we accept before treating the stream as garbage.
const MAX_LINE: usize = 1024;

/// Largest body we will buffer for a single reply.
pub const MAX_BODY: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeekKind {
    Ready,
    Delayed,
    Buried,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    Use(&'a str),
    Watch(&'a str),
    Ignore(&'a str),
    Put {
        priority: u32,
        delay: u64,
        ttr: u64,
        body: &'a [u8],
    },
    /// Blocks server-side for at most the given number of seconds.
    ReserveWithTimeout(u64),
    Delete(u64),
    Release {
        id: u64,
        priority: u32,
        delay: u64,
    },
    Peek(PeekKind),
    StatsTube(&'a str),
    ListTubes,
    Quit,
}

impl Request<'_> {
    pub fn verb(&self) -> &'static str {
        match self {
            Request::Use(_) => "use",
            Request::Watch(_) => "watch",
            Request::Ignore(_) => "ignore",
            Request::Put { .. } => "put",
            Request::ReserveWithTimeout(_) => "reserve-with-timeout",
            Request::Delete(_) => "delete",
            Request::Release { .. } => "release",
            Request::Peek(PeekKind::Ready) => "peek-ready",
            Request::Peek(PeekKind::Delayed) => "peek-delayed",
            Request::Peek(PeekKind::Buried) => "peek-buried",
            Request::StatsTube(_) => "stats-tube",
            Request::ListTubes => "list-tubes",
            Request::Quit => "quit",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let verb = self.verb();
        let mut out = match self {
            Request::Use(tube)
            | Request::Watch(tube)
            | Request::Ignore(tube)
            | Request::StatsTube(tube) => format!("{verb} {tube}\r\n").into_bytes(),
            Request::Put {
                priority,
                delay,
                ttr,
                body,
            } => format!("{verb} {priority} {delay} {ttr} {}\r\n", body.len()).into_bytes(),
            Request::Delete(id) => format!("{verb} {id}\r\n").into_bytes(),
            Request::ReserveWithTimeout(secs) => format!("{verb} {secs}\r\n").into_bytes(),
            Request::Release {
                id,
                priority,
                delay,
            } => format!("{verb} {id} {priority} {delay}\r\n").into_bytes(),
            Request::Peek(_) | Request::ListTubes | Request::Quit => {
                format!("{verb}\r\n").into_bytes()
            }
        };
        if let Request::Put { body, .. } = self {
            out.extend_from_slice(body);
            out.extend_from_slice(b"\r\n");
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Inserted(u64),
    Buried(Option<u64>),
    Using(String),
    Watching(u32),
    Reserved { id: u64, body: Bytes },
    Found { id: u64, body: Bytes },
    Ok(Bytes),
    Deleted,
    Released,
    NotFound,
    NotIgnored,
    DeadlineSoon,
    TimedOut,
}

/// Parsed status line; `body` holds the announced data length, if any.
#[derive(Debug, PartialEq, Eq)]
enum Status {
    Done(Reply),
    WithBody { kind: BodyKind, len: usize },
}

#[derive(Debug, PartialEq, Eq)]
enum BodyKind {
    Reserved(u64),
    Found(u64),
    Ok,
}

fn number<T: std::str::FromStr>(token: Option<&str>, line: &str) -> Result<T, TransportError> {
    token
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| TransportError::Protocol(format!("malformed reply: {line:?}")))
}

fn parse_status(line: &str, verb: &str) -> Result<Status, TransportError> {
    let mut parts = line.split(' ');
    let word = parts.next().unwrap_or_default();
    let status = match word {
        "INSERTED" => Status::Done(Reply::Inserted(number(parts.next(), line)?)),
        "BURIED" => Status::Done(Reply::Buried(parts.next().and_then(|t| t.parse().ok()))),
        "USING" => Status::Done(Reply::Using(
            parts
                .next()
                .ok_or_else(|| TransportError::Protocol(format!("malformed reply: {line:?}")))?
                .to_string(),
        )),
        "WATCHING" => Status::Done(Reply::Watching(number(parts.next(), line)?)),
        "RESERVED" => {
            let id = number(parts.next(), line)?;
            Status::WithBody {
                kind: BodyKind::Reserved(id),
                len: number(parts.next(), line)?,
            }
        }
        "FOUND" => {
            let id = number(parts.next(), line)?;
            Status::WithBody {
                kind: BodyKind::Found(id),
                len: number(parts.next(), line)?,
            }
        }
        "OK" => Status::WithBody {
            kind: BodyKind::Ok,
            len: number(parts.next(), line)?,
        },
        "DELETED" => Status::Done(Reply::Deleted),
        "RELEASED" => Status::Done(Reply::Released),
        "NOT_FOUND" => Status::Done(Reply::NotFound),
        "NOT_IGNORED" => Status::Done(Reply::NotIgnored),
        "DEADLINE_SOON" => Status::Done(Reply::DeadlineSoon),
        "TIMED_OUT" => Status::Done(Reply::TimedOut),
        "OUT_OF_MEMORY" | "INTERNAL_ERROR" | "BAD_FORMAT" | "UNKNOWN_COMMAND"
        | "EXPECTED_CRLF" | "JOB_TOO_BIG" | "DRAINING" => {
            return Err(TransportError::rejected(verb, word));
        }
        _ => {
            return Err(TransportError::Protocol(format!(
                "unexpected reply to {verb}: {line:?}"
            )))
        }
    };
    Ok(status)
}

/// Read one reply from the stream. `verb` names the request for error messages.
pub async fn read_reply<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    verb: &str,
) -> Result<Reply, TransportError> {
    let mut raw = Vec::with_capacity(64);
    let n = (&mut *reader)
        .take(MAX_LINE as u64)
        .read_until(b'\n', &mut raw)
        .await?;
    if n == 0 {
        return Err(TransportError::Closed);
    }
    if !raw.ends_with(b"\r\n") {
        return Err(TransportError::Protocol(format!(
            "reply to {verb} is not CRLF terminated"
        )));
    }
    raw.truncate(raw.len() - 2);
    let line = String::from_utf8(raw)
        .map_err(|_| TransportError::Protocol(format!("reply to {verb} is not UTF-8")))?;

    match parse_status(&line, verb)? {
        Status::Done(reply) => Ok(reply),
        Status::WithBody { kind, len } => {
            let total = len
                .checked_add(2)
                .filter(|_| len <= MAX_BODY)
                .ok_or_else(|| {
                    TransportError::Protocol(format!(
                        "reply to {verb} announces {len} bytes, limit is {MAX_BODY}"
                    ))
                })?;
            let mut data = vec![0u8; total];
            reader.read_exact(&mut data).await?;
            if !data.ends_with(b"\r\n") {
                return Err(TransportError::Protocol(format!(
                    "body of {verb} reply is not CRLF terminated"
                )));
            }
            data.truncate(len);
            let body = Bytes::from(data);
            Ok(match kind {
                BodyKind::Reserved(id) => Reply::Reserved { id, body },
                BodyKind::Found(id) => Reply::Found { id, body },
                BodyKind::Ok => Reply::Ok(body),
            })
        }
    }
}
