//! Input source adapters: each converts one encapsulation family into IPv4 datagrams.
//!
//! All three sources share the same capability set (push bytes in, drain IPv4 datagrams
//! out, reset on demand), expressed by the [`InputSource`](trait.InputSource.html) trait.
//! The ETI-NA pipeline is deliberately *not* an `InputSource`: it produces ETI-NI frames,
//! not datagrams, and is driven directly by the [scanner](../scanner/index.html).

use crate::bbf::BbfSource;
use crate::gse::GseParser;
use crate::mpe::{self, MpeSectionAccumulator};
use crate::packet::{Packet, Pid};
use crate::udp;
use log::debug;
use std::collections::VecDeque;

/// The capability shared by every encapsulation adapter.
pub trait InputSource {
    /// Pushes raw bytes from the transport.  Any amount, any alignment.
    fn feed(&mut self, data: &[u8]);

    /// Discards all parser state.
    fn reset(&mut self);

    /// A short name for diagnostics.
    fn description(&self) -> &'static str;

    /// Takes the next recovered IPv4 datagram off the queue.
    fn pop_ip_packet(&mut self) -> Option<Vec<u8>>;

    /// The PID that produced the most recent datagrams (best-effort attribution).
    fn last_pid(&self) -> u16;

    /// Continuity-counter breaks seen so far.
    fn discontinuity_count(&self) -> u64;

    /// Processes anything held back at end of stream.  Most sources have nothing to do.
    fn flush(&mut self) {}
}

// 188-byte framing with a partial-packet buffer, shared by the adapters.
#[derive(Default)]
struct TsChunker {
    partial: Vec<u8>,
}

impl TsChunker {
    fn feed(&mut self, data: &[u8], mut handle: impl FnMut(&[u8])) {
        let mut pos = 0;
        if !self.partial.is_empty() {
            let needed = Packet::SIZE - self.partial.len();
            if data.len() < needed {
                self.partial.extend_from_slice(data);
                return;
            }
            self.partial.extend_from_slice(&data[..needed]);
            pos = needed;
            let pk = std::mem::take(&mut self.partial);
            handle(&pk);
        }
        while pos + Packet::SIZE <= data.len() {
            handle(&data[pos..pos + Packet::SIZE]);
            pos += Packet::SIZE;
        }
        if pos < data.len() {
            self.partial.extend_from_slice(&data[pos..]);
        }
    }

    fn reset(&mut self) {
        self.partial.clear();
    }
}

// Continuity tracking across all PIDs, as the adapters see multiple PIDs pass by.
struct CcTracker {
    last_cc: Vec<Option<u8>>,
    discontinuities: u64,
}

impl Default for CcTracker {
    fn default() -> CcTracker {
        CcTracker {
            last_cc: vec![None; Pid::PID_COUNT],
            discontinuities: 0,
        }
    }
}

impl CcTracker {
    // Returns false on a break in the counter sequence.
    fn check(&mut self, pid: u16, cc: u8) -> bool {
        let slot = &mut self.last_cc[usize::from(pid)];
        let continuous = match *slot {
            Some(last) => (last + 1) & 0x0F == cc,
            None => true,
        };
        *slot = Some(cc);
        if !continuous {
            self.discontinuities += 1;
        }
        continuous
    }

    fn reset(&mut self) {
        for slot in &mut self.last_cc {
            *slot = None;
        }
    }
}

/// MPE sections on one PID, with an optional destination ip/port filter (the streamer
/// configuration surface).
pub struct MpeTsSource {
    target_pid: u16,
    filter_ip: u32,
    filter_port: u16,
    chunker: TsChunker,
    cc: CcTracker,
    acc: MpeSectionAccumulator,
    datagrams: VecDeque<Vec<u8>>,
}

impl MpeTsSource {
    pub fn new(target_pid: u16) -> MpeTsSource {
        MpeTsSource {
            target_pid,
            filter_ip: 0,
            filter_port: 0,
            chunker: TsChunker::default(),
            cc: CcTracker::default(),
            acc: MpeSectionAccumulator::new(),
            datagrams: VecDeque::new(),
        }
    }

    /// Restricts output to one destination.  Zero values match anything.
    pub fn set_filter(&mut self, ip: u32, port: u16) {
        self.filter_ip = ip;
        self.filter_port = port;
    }

    fn matches_filter(&self, ip_packet: &[u8]) -> bool {
        if self.filter_ip == 0 && self.filter_port == 0 {
            return true;
        }
        match udp::extract(ip_packet) {
            Some(dg) => {
                (self.filter_ip == 0 || dg.dst_ip == self.filter_ip)
                    && (self.filter_port == 0 || dg.dst_port == self.filter_port)
            }
            None => false,
        }
    }

    fn process_packet(&mut self, buf: &[u8]) {
        if !Packet::is_sync_byte(buf[0]) {
            return;
        }
        let pk = Packet::new(buf);
        if u16::from(pk.pid()) != self.target_pid || pk.transport_error_indicator() {
            return;
        }
        let cc = pk.continuity_counter().count();
        if !self.cc.check(self.target_pid, cc) {
            self.acc.reset();
        }
        let payload = match pk.payload() {
            Some(p) => p,
            None => return,
        };
        self.acc
            .feed(payload, pk.payload_unit_start_indicator(), cc);
        while let Some(section) = self.acc.pop_section() {
            if let Some(ip) = mpe::ip_datagram(&section) {
                if self.matches_filter(ip) {
                    self.datagrams.push_back(ip.to_vec());
                }
            }
        }
    }
}

impl InputSource for MpeTsSource {
    fn feed(&mut self, data: &[u8]) {
        let mut chunker = std::mem::take(&mut self.chunker);
        chunker.feed(data, |pk| self.process_packet(pk));
        self.chunker = chunker;
    }

    fn reset(&mut self) {
        self.chunker.reset();
        self.cc.reset();
        self.acc.reset();
        self.datagrams.clear();
    }

    fn description(&self) -> &'static str {
        "MPE-in-TS"
    }

    fn pop_ip_packet(&mut self) -> Option<Vec<u8>> {
        self.datagrams.pop_front()
    }

    fn last_pid(&self) -> u16 {
        self.target_pid
    }

    fn discontinuity_count(&self) -> u64 {
        self.cc.discontinuities
    }
}

/// GSE packets carried directly in TS payloads.
pub struct GseTsSource {
    chunker: TsChunker,
    cc: CcTracker,
    gse: GseParser,
    last_pid: u16,
}

impl Default for GseTsSource {
    fn default() -> GseTsSource {
        GseTsSource {
            chunker: TsChunker::default(),
            cc: CcTracker::default(),
            gse: GseParser::new(),
            last_pid: 0,
        }
    }
}

impl GseTsSource {
    pub fn new() -> GseTsSource {
        Self::default()
    }

    fn process_packet(&mut self, buf: &[u8]) {
        if !Packet::is_sync_byte(buf[0]) {
            return;
        }
        let pk = Packet::new(buf);
        if pk.transport_error_indicator() || pk.pid() == Pid::NULL {
            return;
        }
        let pid = u16::from(pk.pid());
        if !self.cc.check(pid, pk.continuity_counter().count()) {
            debug!("continuity break on PID {}; resetting GSE state", pid);
            self.gse.reset();
        }
        if let Some(payload) = pk.payload() {
            self.last_pid = pid;
            self.gse.feed_ts_payload(payload);
        }
    }
}

impl InputSource for GseTsSource {
    fn feed(&mut self, data: &[u8]) {
        let mut chunker = std::mem::take(&mut self.chunker);
        chunker.feed(data, |pk| self.process_packet(pk));
        self.chunker = chunker;
    }

    fn reset(&mut self) {
        self.chunker.reset();
        self.cc.reset();
        self.gse.reset();
    }

    fn description(&self) -> &'static str {
        "GSE-in-TS"
    }

    fn pop_ip_packet(&mut self) -> Option<Vec<u8>> {
        self.gse.pop_datagram()
    }

    fn last_pid(&self) -> u16 {
        self.last_pid
    }

    fn discontinuity_count(&self) -> u64 {
        self.cc.discontinuities
    }
}

/// DVB-S2 baseband frames in pseudo-TS containers.
pub struct BbfTsSource {
    chunker: TsChunker,
    cc: CcTracker,
    bbf: BbfSource,
    last_pid: u16,
}

impl Default for BbfTsSource {
    fn default() -> BbfTsSource {
        BbfTsSource {
            chunker: TsChunker::default(),
            cc: CcTracker::default(),
            bbf: BbfSource::new(),
            last_pid: 0,
        }
    }
}

impl BbfTsSource {
    pub fn new() -> BbfTsSource {
        Self::default()
    }

    fn process_packet(&mut self, buf: &[u8]) {
        if !Packet::is_sync_byte(buf[0]) {
            return;
        }
        let pk = Packet::new(buf);
        let pid = u16::from(pk.pid());
        if !self.cc.check(pid, pk.continuity_counter().count()) {
            debug!("continuity break on PID {}; resetting BBF state", pid);
            self.bbf.reset();
        }
        self.last_pid = pid;
        self.bbf.feed_packet(buf);
    }
}

impl InputSource for BbfTsSource {
    fn feed(&mut self, data: &[u8]) {
        let mut chunker = std::mem::take(&mut self.chunker);
        chunker.feed(data, |pk| self.process_packet(pk));
        self.chunker = chunker;
    }

    fn reset(&mut self) {
        self.chunker.reset();
        self.cc.reset();
        self.bbf.reset();
    }

    fn description(&self) -> &'static str {
        "BBF-in-pseudo-TS"
    }

    fn pop_ip_packet(&mut self) -> Option<Vec<u8>> {
        self.bbf.gse().pop_datagram()
    }

    fn last_pid(&self) -> u16 {
        self.last_pid
    }

    fn discontinuity_count(&self) -> u64 {
        self.cc.discontinuities
    }

    fn flush(&mut self) {
        self.bbf.flush();
    }
}
