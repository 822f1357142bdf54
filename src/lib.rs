//! A lossy-link overlay network simulator on loopback UDP.
//!
//! Every node is one OS process bound to `127.0.0.1:<port>`. Nodes talk only
//! to statically configured neighbors, and the receiver of each datagram
//! drops it with the loss probability configured for that link. On top of the
//! lossy links sit two layers:
//!
//! - a per-link selective-repeat ARQ transport ([`Transport`]) that
//!   retransmits until every packet of a batch is acknowledged and delivers
//!   payloads in order, and
//! - a distance-vector routing layer ([`RoutingTable`]) in which nodes
//!   exchange their tables, converge on least-weight paths, and adapt when
//!   an operator changes a link's loss rate at runtime.
//!
//! Link weight is derived from the loss rate as `1 / (1 - rate)`, rounded to
//! three decimals. Bulk transfers (`send`) push a burst of identical packets
//! hop by hop toward a destination and measure per-neighbor transfer times
//! and realized loss, exercising every neighbor of the source in turn.
//!
//! The `node` binary wires a [`Node`] to stdin commands and console output;
//! the library itself never prints, it reports through the [`Reporter`]
//! trait and logs through `tracing`.

mod command;
mod config;
mod message;
mod node;
mod report;
mod routing;
mod transport;

pub use command::{Command, CommandError, SendKey, SendStat};
pub use config::{Error, NodeConfig, TransportConfig, CONFIG_ENV};
pub use message::{Control, Datagram, Packet, ParseError};
pub use node::{Neighbor, Node};
pub use report::{NullReporter, Reporter};
pub use routing::{link_weight, round3, Route, RoutingTable};
pub use transport::{Delivery, Transport};
