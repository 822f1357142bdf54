//! Observer boundary for the human-visible events of a node.
//!
//! Correctness never depends on a [`Reporter`]: the binary installs one that
//! prints, tests install recorders, and everything else gets
//! [`NullReporter`]. Per-packet wire events are not reported here; those go
//! to `tracing`.

use crate::command::{CommandError, SendKey};
use crate::routing::Route;

/// Receives the events an operator watching the node would see.
/// Every method defaults to a no-op so implementations pick what they need.
#[allow(unused_variables)]
pub trait Reporter: Send + Sync + 'static {
    /// Full table dump, after startup and after every recompute that
    /// changed the table.
    fn routing_table(&self, node: u16, routes: &[Route]) {}

    /// A distance-vector advertisement was delivered (and acked) to `to`.
    fn dv_sent(&self, to: u16) {}

    /// A distance-vector advertisement arrived from `from`.
    fn dv_received(&self, from: u16) {}

    /// The link to `neighbor` now drops inbound datagrams at `rate`.
    fn link_cost_changed(&self, neighbor: u16, rate: f64, weight: f64) {}

    /// A blocking bulk send (burst or END notice) is starting.
    fn transfer_started(&self, node: u16) {}

    /// The blocking bulk send was fully acked.
    fn transfer_finished(&self, node: u16) {}

    /// A full burst was collected here; `total` counts the raw datagrams
    /// the link saw while collecting it.
    fn burst_received(&self, from: u16, key: SendKey, total: u32, loss_rate: f64) {}

    /// One leg of the active send command finished, measured end to end.
    fn leg_finished(&self, neighbor: u16, dest: u16, elapsed_millis: u64) {}

    /// Every leg of the active send command finished.
    fn send_finished(&self, dest: u16) {}

    /// A `send` command was refused.
    fn send_rejected(&self, reason: &CommandError) {}

    /// An input line did not parse as any command.
    fn command_error(&self, line: &str, reason: &CommandError) {}
}

/// A [`Reporter`] that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {}
