//! Interactive operator commands and bulk-transfer bookkeeping.
//!
//! Two commands exist: `change <port> <rate> [<port> <rate>]...` retunes the
//! loss rate of one or more links, and `send <dest> <count>` starts a bulk
//! transfer that exercises every neighbor link in turn. The grammar is
//! deliberately unforgiving: anything that does not parse exactly is
//! rejected as a whole.

use std::collections::VecDeque;
use std::str::FromStr;

use crate::routing::round3;

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Retune the loss rate of each listed neighbor link.
    Change(Vec<(u16, f64)>),
    /// Measure a bulk transfer of `count` packets to `dest` over every
    /// neighbor link, one leg at a time.
    Send { dest: u16, count: u32 },
}

/// Why a command line or a send request was refused.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unrecognized command")]
    Unrecognized,
    #[error("a burst needs at least one packet")]
    EmptyBurst,
    #[error("no route to {0}")]
    NoRoute(u16),
    #[error("a send is already in progress")]
    SendBusy,
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, CommandError> {
        let mut words = line.split_whitespace();
        let command = match words.next() {
            Some("change") => {
                let args: Vec<&str> = words.collect();
                if args.is_empty() || args.len() % 2 != 0 {
                    return Err(CommandError::Unrecognized);
                }
                let mut updates = Vec::with_capacity(args.len() / 2);
                for pair in args.chunks(2) {
                    let port = parse_port(pair[0])?;
                    let rate: f64 = pair[1].parse().map_err(|_| CommandError::Unrecognized)?;
                    if !(0.0..1.0).contains(&rate) {
                        return Err(CommandError::Unrecognized);
                    }
                    updates.push((port, rate));
                }
                Command::Change(updates)
            }
            Some("send") => {
                let (dest, count) = match (words.next(), words.next(), words.next()) {
                    (Some(dest), Some(count), None) => (dest, count),
                    _ => return Err(CommandError::Unrecognized),
                };
                let dest = parse_port(dest)?;
                let count: u32 = count.parse().map_err(|_| CommandError::Unrecognized)?;
                if count == 0 {
                    return Err(CommandError::EmptyBurst);
                }
                Command::Send { dest, count }
            }
            _ => return Err(CommandError::Unrecognized),
        };
        Ok(command)
    }
}

fn parse_port(s: &str) -> Result<u16, CommandError> {
    match s.parse() {
        Ok(0) | Err(_) => Err(CommandError::Unrecognized),
        Ok(port) => Ok(port),
    }
}

/// Identity of one bulk transfer as seen anywhere on its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SendKey {
    /// Node that issued the `send` command.
    pub source: u16,
    /// Final destination of the burst.
    pub dest: u16,
    /// Packets per burst; doubles as the completion threshold.
    pub count: u32,
}

/// Receive-side tally for one [`SendKey`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendStat {
    /// Distinct burst packets delivered in order so far.
    pub valid: u32,
    /// Raw data datagrams the link saw while collecting them, duplicates
    /// and unrelated traffic included.
    pub total: u32,
}

impl SendStat {
    /// Counts one delivered burst packet plus the raw datagrams its
    /// delivery batch observed.
    pub fn record(&mut self, raw: u32) {
        self.valid += 1;
        self.total += raw;
    }

    /// Realized loss rate of the finished burst, rounded to 3 decimals.
    /// Exactly `0.0` when nothing was dropped. A delivery batch headed by
    /// a non-burst message swallows its raw count, so `total` can undercut
    /// `valid`; that clamps to `0.0` instead of wrapping.
    pub fn loss_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let wasted = self.total.saturating_sub(self.valid);
        round3(f64::from(wasted) / f64::from(self.total))
    }
}

/// Origin-side lifecycle of one `send` command: the remaining neighbor
/// legs, the leg under test, and when it started.
#[derive(Debug)]
pub(crate) struct SendCommand {
    pub(crate) dest: u16,
    pub(crate) count: u32,
    pending: VecDeque<u16>,
    pub(crate) current: u16,
    pub(crate) started_at: u64,
}

impl SendCommand {
    /// Plans a transfer over `neighbors`, in the order given.
    pub(crate) fn new(dest: u16, count: u32, neighbors: impl IntoIterator<Item = u16>) -> Self {
        SendCommand {
            dest,
            count,
            pending: neighbors.into_iter().collect(),
            current: 0,
            started_at: 0,
        }
    }

    /// Moves to the next leg, returning the neighbor it runs over, or
    /// `None` when every leg has been measured.
    pub(crate) fn next_leg(&mut self) -> Option<u16> {
        let next = self.pending.pop_front()?;
        self.current = next;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_change_pairs() {
        let cmd: Command = "change 8002 0.3".parse().unwrap();
        assert_eq!(cmd, Command::Change(vec![(8002, 0.3)]));
        let cmd: Command = "change 8002 0.3 8003 0".parse().unwrap();
        assert_eq!(cmd, Command::Change(vec![(8002, 0.3), (8003, 0.0)]));
    }

    #[test]
    fn parses_send() {
        let cmd: Command = "send 8003 100".parse().unwrap();
        assert_eq!(
            cmd,
            Command::Send {
                dest: 8003,
                count: 100
            }
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        for line in [
            "",
            "nonsense",
            "change",
            "change 8002",
            "change 8002 0.3 8003",
            "change 8002 1.0",
            "change 8002 -0.1",
            "change 0 0.3",
            "change 8002 umm",
            "send",
            "send 8003",
            "send 8003 ten",
            "send 8003 -4",
            "send 0 5",
            "send 8003 5 extra",
        ] {
            assert_eq!(
                line.parse::<Command>(),
                Err(CommandError::Unrecognized),
                "line {line:?} should be unrecognized"
            );
        }
        assert_eq!(
            "send 8003 0".parse::<Command>(),
            Err(CommandError::EmptyBurst)
        );
    }

    #[test]
    fn stat_loss_rate_is_exact_at_zero_loss() {
        let mut stat = SendStat::default();
        for _ in 0..5 {
            stat.record(1);
        }
        assert_eq!(stat.valid, 5);
        assert_eq!(stat.total, 5);
        assert_eq!(stat.loss_rate(), 0.0);
    }

    #[test]
    fn stat_loss_rate_rounds_to_three_decimals() {
        let mut stat = SendStat::default();
        stat.record(2);
        stat.record(1);
        // 2 valid out of 3 raw: one datagram in three was wasted.
        assert_eq!(stat.loss_rate(), 0.333);
        assert_eq!(SendStat::default().loss_rate(), 0.0);
    }

    #[test]
    fn stat_loss_rate_clamps_undercounted_totals() {
        let mut stat = SendStat::default();
        stat.record(1);
        // Raw count credited to an interleaved control batch instead.
        stat.record(0);
        assert_eq!((stat.valid, stat.total), (2, 1));
        assert_eq!(stat.loss_rate(), 0.0);
    }

    #[test]
    fn send_command_walks_neighbors_in_order() {
        let mut cmd = SendCommand::new(9000, 7, [8001, 8002, 8003]);
        assert_eq!(cmd.next_leg(), Some(8001));
        assert_eq!(cmd.current, 8001);
        assert_eq!(cmd.next_leg(), Some(8002));
        assert_eq!(cmd.next_leg(), Some(8003));
        assert_eq!(cmd.current, 8003);
        assert_eq!(cmd.next_leg(), None);
    }
}
