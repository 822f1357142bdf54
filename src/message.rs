//! Wire formats.
//!
//! Two layers share the UDP socket: the link transport exchanges
//! [`Datagram`]s, and every payload the transport delivers in order is a
//! [`Control`] message for the layers above. Both are plain text, parsed in
//! a single step and never sniffed heuristically.

use std::fmt;
use std::str::FromStr;

use crate::routing::Route;

/// Error returned when a wire string does not parse.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed message")]
pub struct ParseError;

/// A sequenced transport packet, `<seq>_<payload>` on the wire.
///
/// Only the first underscore separates the fields; the payload may contain
/// more of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub seq: u64,
    pub payload: String,
}

/// One UDP datagram of the link transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    /// Acknowledgment of a single packet, `ACK,<seq>` on the wire.
    Ack(u64),
    /// A data packet carrying an upper-layer payload.
    Data(Packet),
}

/// An upper-layer payload carried by data packets.
///
/// The text before the first underscore selects the variant, the rest is the
/// body.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    /// Distance-vector advertisement: space-separated `dest,next,weight`
    /// triples. An all-underscore body is the bootstrap marker of a node
    /// with nothing to advertise and parses as an empty table.
    Dv(Vec<Route>),
    /// New loss rate for the link to the sending neighbor.
    Change(f64),
    /// One packet of a bulk-transfer burst: `source,dest,count`.
    Send { source: u16, dest: u16, count: u32 },
    /// Completion notice of a bulk-transfer leg: `source,finish_millis`.
    End { source: u16, finish_millis: u64 },
}

fn parse_num<T: FromStr>(s: &str) -> Result<T, ParseError> {
    s.parse().map_err(|_| ParseError)
}

impl FromStr for Datagram {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        if let Some(seq) = s.strip_prefix("ACK,") {
            return Ok(Datagram::Ack(parse_num(seq)?));
        }
        let (seq, payload) = s.split_once('_').ok_or(ParseError)?;
        Ok(Datagram::Data(Packet {
            seq: parse_num(seq)?,
            payload: payload.to_owned(),
        }))
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.seq, self.payload)
    }
}

impl fmt::Display for Datagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datagram::Ack(seq) => write!(f, "ACK,{seq}"),
            Datagram::Data(packet) => packet.fmt(f),
        }
    }
}

impl FromStr for Control {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        let (prefix, body) = s.split_once('_').ok_or(ParseError)?;
        match prefix {
            "DV" => {
                let mut routes = Vec::new();
                for token in body.split_whitespace() {
                    if token.chars().all(|c| c == '_') {
                        continue;
                    }
                    routes.push(token.parse()?);
                }
                Ok(Control::Dv(routes))
            }
            "CHANGE" => Ok(Control::Change(parse_num(body)?)),
            "SEND" => {
                let (source, rest) = body.split_once(',').ok_or(ParseError)?;
                let (dest, count) = rest.split_once(',').ok_or(ParseError)?;
                Ok(Control::Send {
                    source: parse_num(source)?,
                    dest: parse_num(dest)?,
                    count: parse_num(count)?,
                })
            }
            "END" => {
                let (source, finish) = body.split_once(',').ok_or(ParseError)?;
                Ok(Control::End {
                    source: parse_num(source)?,
                    finish_millis: parse_num(finish)?,
                })
            }
            _ => Err(ParseError),
        }
    }
}

// Weights go out through `{:?}`: it round-trips f64 exactly and keeps the
// trailing `.0` on integral values, so `2.0` stays `2.0` on the wire.
impl FromStr for Route {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        let (dest, rest) = s.split_once(',').ok_or(ParseError)?;
        let (next_hop, weight) = rest.split_once(',').ok_or(ParseError)?;
        Ok(Route::new(
            parse_num(dest)?,
            parse_num(next_hop)?,
            parse_num(weight)?,
        ))
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{:?}", self.dest, self.next_hop, self.weight)
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Control::Dv(routes) if routes.is_empty() => write!(f, "DV_ _"),
            Control::Dv(routes) => {
                write!(f, "DV_")?;
                for (i, route) in routes.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    route.fmt(f)?;
                }
                Ok(())
            }
            Control::Change(rate) => write!(f, "CHANGE_{rate:?}"),
            Control::Send {
                source,
                dest,
                count,
            } => write!(f, "SEND_{source},{dest},{count}"),
            Control::End {
                source,
                finish_millis,
            } => write!(f, "END_{source},{finish_millis}"),
        }
    }
}
