//! Per-connection viewer state: a cursor into the ring, a non-blocking send
//! in progress, the in-band control line buffer and transfer statistics.

use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;

use bytes::Bytes;

use crate::ring::RingSlot;

/// A parsed `S` control line: `host connector conntime up down`.
/// Missing fields default to zero / empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub host: String,
    pub connector: String,
    pub conntime: u64,
    pub up: u64,
    pub down: u64,
}

impl Stats {
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let mut fields = line.split_whitespace();
        Self {
            host: fields.next().unwrap_or("").to_string(),
            connector: fields.next().unwrap_or("").to_string(),
            conntime: fields.next().and_then(|f| f.parse().ok()).unwrap_or(0),
            up: fields.next().and_then(|f| f.parse().ok()).unwrap_or(0),
            down: fields.next().and_then(|f| f.parse().ok()).unwrap_or(0),
        }
    }
}

pub struct Viewer {
    pub id: u64,
    conn: UnixStream,
    connected: bool,
    /// Whether a disconnect reason was already printed for this viewer.
    logged: bool,
    /// Ring slot currently being sent.
    pub cursor: usize,
    /// Sequence number snapshotted when the current send started; -1 while
    /// awaiting a valid slot.
    expected: i64,
    sent: usize,
    /// Stable handle on the tag bytes being sent. A slot rewrite swaps the
    /// backing allocation, so pointer inequality against the slot detects it.
    in_flight: Option<Bytes>,
    line_buf: Vec<u8>,
    pub last_stats: Stats,
    pub up_rate: u64,
    pub down_rate: u64,
}

impl Viewer {
    pub fn new(id: u64, conn: UnixStream, cursor: usize) -> std::io::Result<Self> {
        conn.set_nonblocking(true)?;
        println!("User {id} connected");
        Ok(Self {
            id,
            conn,
            connected: true,
            logged: false,
            cursor,
            expected: -1,
            sent: 0,
            in_flight: None,
            line_buf: Vec::new(),
            last_stats: Stats::default(),
            up_rate: 0,
            down_rate: 0,
        })
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Consumes the viewer, handing back its socket (push promotion).
    #[must_use]
    pub fn into_stream(self) -> UnixStream {
        self.conn
    }

    /// Closes the connection and prints the operator-visible disconnect line.
    /// Printing happens once per viewer, whichever reason came first.
    pub fn disconnect(&mut self, reason: &str) {
        if self.connected {
            let _ = self.conn.shutdown(Shutdown::Both);
            self.connected = false;
        }
        if !self.logged {
            self.logged = true;
            println!(
                "Disconnected user {}: {}. {} transferred {} up and {} down in {} seconds to {}",
                self.id,
                reason,
                self.last_stats.connector,
                self.last_stats.up,
                self.last_stats.down,
                self.last_stats.conntime,
                self.last_stats.host
            );
        }
    }

    /// One-shot write used by the join protocol. Anything short of a full
    /// write disconnects the viewer with `reason`.
    pub fn write_all_now(&mut self, data: &[u8], reason: &str) -> bool {
        if !self.connected {
            return false;
        }
        match self.conn.write(data) {
            Ok(n) if n == data.len() => true,
            // a would-block counts as a short write here
            Ok(_) | Err(_) => {
                self.disconnect(reason);
                false
            }
        }
    }

    /// Drains readable bytes into the line buffer and returns every complete
    /// `\n`-terminated line. Partial lines persist across ticks.
    pub fn poll_control(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            match self.conn.read(&mut chunk) {
                Ok(0) => {
                    // peer closed; the relay reaps us on its next pass
                    self.connected = false;
                    break;
                }
                Ok(n) => {
                    for &byte in &chunk[..n] {
                        if byte == b'\n' {
                            lines.push(String::from_utf8_lossy(&self.line_buf).into_owned());
                            self.line_buf.clear();
                        } else {
                            self.line_buf.push(byte);
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => {
                    self.connected = false;
                    break;
                }
            }
        }
        lines
    }

    /// Folds a fresh stats report into per-second transfer rates.
    pub fn apply_stats(&mut self, stats: Stats) {
        let seconds = stats.conntime.saturating_sub(self.last_stats.conntime).max(1);
        self.up_rate = stats.up.saturating_sub(self.last_stats.up) / seconds;
        self.down_rate = stats.down.saturating_sub(self.last_stats.down) / seconds;
        self.last_stats = stats;
    }

    /// Tries to push this viewer forward by (at most) one tag.
    ///
    /// Snapshot the slot when a send starts; a rewrite under the in-flight
    /// send disconnects, an overrun detected after a completed send walks the
    /// cursor to the next keyframe.
    pub fn send(&mut self, ring: &[RingSlot]) {
        if !self.connected {
            return;
        }

        // still waiting for the slot to become valid?
        if self.expected < 0 {
            let slot = &ring[self.cursor];
            if slot.number < 0 {
                return;
            }
            let Some(tag) = slot.tag.as_ref() else {
                return;
            };
            self.expected = slot.number;
            self.in_flight = Some(tag.data.clone());
            self.sent = 0;
        }
        let Some(in_flight) = self.in_flight.clone() else {
            return;
        };

        // the slot was rewritten under our in-flight send
        let rewritten = match ring[self.cursor].tag.as_ref() {
            Some(tag) => tag.data.as_ptr() != in_flight.as_ptr(),
            None => true,
        };
        if rewritten {
            self.disconnect("Buffer resize at wrong time... had to disconnect");
            return;
        }

        match self.conn.write(&in_flight[self.sent..]) {
            Ok(0) => return,
            Ok(n) => self.sent += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) => {
                self.disconnect(&e.to_string());
                return;
            }
        }
        if self.sent < in_flight.len() {
            return;
        }

        // completed a send
        if ring[self.cursor].number != self.expected {
            println!(
                "Warning: user {} got overrun by the buffer, skipping to the next keyframe",
                self.id
            );
            let slots = ring.len();
            let mut hops = 0;
            loop {
                self.cursor = (self.cursor + 1) % slots;
                hops += 1;
                if ring[self.cursor].is_keyframe() || hops >= slots {
                    break;
                }
            }
            if hops >= slots && !ring[self.cursor].is_keyframe() {
                println!("Warning: no keyframe found in any buffer, retrying later");
                return;
            }
        } else {
            self.cursor = (self.cursor + 1) % ring.len();
        }
        self.expected = -1;
        self.in_flight = None;
        self.sent = 0;
    }
}
