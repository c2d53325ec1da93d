//! Whole-transport-stream scanning: find every PID that carries a DAB ensemble, whatever
//! the encapsulation, and report what the ensembles contain.
//!
//! MPE carriers announce themselves: the first payload-unit start on a PID shows a
//! section with table_id `0x3E`.  ETI-NA carriers are the opposite: they never set the
//! payload-unit-start flag at all, so a PID with a long run of packets and no PUSI is
//! tried against the [ETI-NA pipeline](../etina/index.html).  Streams that produce
//! ensembles are reported through [`get_results()`](struct.TsScanner.html#method.get_results).

use crate::ensemble::{DiscoveredEnsemble, StreamKey};
use crate::etina::{EtiNaDetection, EtinaPipeline};
use crate::manager::{EnsembleManager, Event};
use crate::mpe::{self, MpeSectionAccumulator};
use crate::packet::{self, Packet, Pid};
use crate::udp;
use crate::unpacketise::Unpacketise;
use fixedbitset::FixedBitSet;
use log::{debug, info, warn};
use std::time::{Duration, Instant};

/// Returned by [`TsScanner::feed`](struct.TsScanner.html#method.feed).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FeedResult {
    /// Keep feeding data.
    Continue,
    /// Scanning has concluded (timeout, or everything discovered is complete).
    Done,
}

/// Where and how an ETI-NA stream was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EtiNaPidInfo {
    pub pid: u16,
    pub info: EtiNaDetection,
}

/// Packets without a payload-unit start needed on a PID before it is tried as ETI-NA.
const ETINA_PACKET_THRESHOLD: u32 = 100;
/// Unsynchronised search bytes after which an ETI-NA candidate is abandoned.
const ETINA_ABANDON_BYTES: usize = 16384;
/// With no DAB traffic at all, give up this long into the scan.
const EARLY_EXIT: Duration = Duration::from_millis(1000);

#[derive(Default)]
struct PidState {
    active: bool,
    checked: bool,
    is_mpe: bool,
    last_cc: Option<u8>,
    mpe: Option<Box<MpeSectionAccumulator>>,
    packet_count: u32,
    pusi_count: u32,
    etina_candidate: bool,
    etina_checked: bool,
    etina_streaming: bool,
    etina_reported: bool,
    etina: Option<Box<EtinaPipeline>>,
}

// The per-packet half of the scanner, kept separate so it can sit behind the
// byte-stream framing as a PacketConsumer.
struct ScannerCore {
    pids: Vec<PidState>,
    touched: FixedBitSet,
    mpe_pids: Vec<u16>,
    etina_results: Vec<EtiNaPidInfo>,
    etina_streaming_pids: Vec<u16>,
    etina_ensembles: Vec<(u16, DiscoveredEnsemble)>,
    manager: EnsembleManager,
    stream_pid_map: std::collections::BTreeMap<StreamKey, u16>,
    results_map: std::collections::BTreeMap<StreamKey, DiscoveredEnsemble>,
    total_packets: u64,
    discontinuities: u64,
}

impl ScannerCore {
    fn new() -> ScannerCore {
        ScannerCore {
            pids: (0..Pid::PID_COUNT).map(|_| PidState::default()).collect(),
            touched: FixedBitSet::with_capacity(Pid::PID_COUNT),
            mpe_pids: Vec::new(),
            etina_results: Vec::new(),
            etina_streaming_pids: Vec::new(),
            etina_ensembles: Vec::new(),
            manager: EnsembleManager::new(),
            stream_pid_map: std::collections::BTreeMap::new(),
            results_map: std::collections::BTreeMap::new(),
            total_packets: 0,
            discontinuities: 0,
        }
    }

    fn process_packet(&mut self, pk: &Packet<'_>) {
        self.total_packets += 1;
        let pid = u16::from(pk.pid());
        let pusi = pk.payload_unit_start_indicator();
        let cc = pk.continuity_counter().count();
        self.touched.insert(usize::from(pid));

        let state = &mut self.pids[usize::from(pid)];
        if !state.active {
            state.active = true;
            state.last_cc = Some(cc);
        } else if let Some(last) = state.last_cc {
            let expected = (last + 1) & 0x0F;
            if cc != expected && pk.adaptation_control().has_payload() {
                self.discontinuities += 1;
                if let Some(acc) = &mut state.mpe {
                    acc.reset();
                }
            }
        }
        state.last_cc = Some(cc);

        let payload = match pk.payload() {
            Some(p) => p,
            None => return,
        };

        // the first payload-unit start on a PID shows whether it carries MPE sections
        if !state.checked && pusi && payload.len() > 1 {
            state.checked = true;
            let pointer = usize::from(payload[0]);
            if pointer < payload.len() - 1 && payload[1 + pointer] == mpe::MPE_TABLE_ID {
                state.is_mpe = true;
                state.mpe = Some(Box::new(MpeSectionAccumulator::new()));
                self.mpe_pids.push(pid);
                info!("PID {} carries MPE sections", pid);
            }
        }

        if state.is_mpe {
            if let Some(acc) = &mut state.mpe {
                acc.feed(payload, pusi, cc);
                let mut sections = Vec::new();
                while let Some(section) = acc.pop_section() {
                    sections.push(section);
                }
                for section in sections {
                    self.handle_mpe_section(pid, &section);
                }
            }
            return;
        }

        let state = &mut self.pids[usize::from(pid)];
        state.packet_count += 1;
        if pusi {
            state.pusi_count += 1;
        }

        // a PID that has never shown a payload-unit start may be a raw ETI-NA stream
        if !state.etina_checked && state.packet_count >= ETINA_PACKET_THRESHOLD {
            if state.pusi_count == 0 {
                state.etina_candidate = true;
                state.etina = Some(Box::new(EtinaPipeline::new()));
                debug!("PID {} has no payload-unit starts; trying ETI-NA", pid);
            }
            state.etina_checked = true;
        }

        if state.etina_candidate || state.etina_streaming {
            self.feed_etina(pid, payload);
        }
    }

    fn handle_mpe_section(&mut self, pid: u16, section: &[u8]) {
        let ip = match mpe::ip_datagram(section) {
            Some(ip) => ip,
            None => return,
        };
        let dg = match udp::extract(ip) {
            Some(dg) => dg,
            None => return,
        };
        // only multicast destinations can be broadcast ensembles
        if !dg.is_multicast() || dg.payload.is_empty() {
            return;
        }
        let key = StreamKey::new(dg.dst_ip, dg.dst_port);
        self.stream_pid_map.entry(key).or_insert(pid);
        let events = self.manager.process_udp(dg.dst_ip, dg.dst_port, dg.payload);
        self.handle_stream_events(events);
    }

    fn handle_stream_events(&mut self, events: Vec<Event>) {
        for event in events {
            match event {
                Event::BasicReady { key, ensemble } | Event::Complete { key, ensemble } => {
                    let pid = self.stream_pid_map.get(&key).copied().unwrap_or(0);
                    self.results_map
                        .insert(key, DiscoveredEnsemble::from_ensemble(key, pid, &ensemble));
                }
                _ => {}
            }
        }
    }

    fn feed_etina(&mut self, pid: u16, payload: &[u8]) {
        let state = &mut self.pids[usize::from(pid)];
        let pipeline = match &mut state.etina {
            Some(p) => p,
            None => return,
        };
        pipeline.feed(payload);

        let mut frames = Vec::new();
        while let Some(frame) = pipeline.pop_frame() {
            frames.push(frame);
        }
        let detection = pipeline.detection();

        if !frames.is_empty() {
            if !state.etina_streaming {
                state.etina_streaming = true;
                state.etina_candidate = false;
                self.etina_streaming_pids.push(pid);
                info!("PID {} is streaming ETI-NA", pid);
            }
            if !state.etina_reported {
                state.etina_reported = true;
                if let Some(info) = detection {
                    self.etina_results.push(EtiNaPidInfo { pid, info });
                }
            }
        } else if state.etina_candidate
            && !state.etina_streaming
            && pipeline.sync_buffer_len() > ETINA_ABANDON_BYTES
        {
            // plenty of data, no E1 alignment: this PID is not ETI-NA
            debug!("PID {} never found E1 sync; abandoning", pid);
            state.etina_candidate = false;
            state.etina = None;
            return;
        }

        for frame in frames {
            let events = self.manager.process_eti_frame(pid, &frame[..]);
            for event in events {
                if let Event::Complete { key, ensemble } = event {
                    let mut de = DiscoveredEnsemble::from_ensemble(key, pid, &ensemble);
                    de.ip = 0;
                    de.port = 0;
                    de.is_etina = true;
                    de.etina_info = detection;
                    match self.etina_ensembles.iter_mut().find(|(p, _)| *p == pid) {
                        Some(entry) => entry.1 = de,
                        None => self.etina_ensembles.push((pid, de)),
                    }
                }
            }
        }
    }
}

impl packet::PacketConsumer for ScannerCore {
    fn consume(&mut self, pk: &Packet<'_>) {
        self.process_packet(pk);
    }
}

/// Scans raw transport stream bytes for DAB ensembles on any PID.
///
/// ```no_run
/// use dvbdab_reader::scanner::{FeedResult, TsScanner};
/// let mut scanner = TsScanner::new();
/// scanner.set_timeout(5000);
/// # let next_buffer = || -> Vec<u8> { vec![] };
/// loop {
///     let buf = next_buffer();
///     if scanner.feed(&buf) == FeedResult::Done {
///         break;
///     }
/// }
/// for ensemble in scanner.get_results() {
///     println!("{}: {}", ensemble.address(), ensemble.label);
/// }
/// ```
pub struct TsScanner {
    unpack: Unpacketise<ScannerCore>,
    timeout: Duration,
    start: Option<Instant>,
    done: bool,
}

impl Default for TsScanner {
    fn default() -> TsScanner {
        TsScanner {
            unpack: Unpacketise::new(ScannerCore::new()),
            timeout: Duration::from_millis(500),
            start: None,
            done: false,
        }
    }
}

impl TsScanner {
    pub fn new() -> TsScanner {
        Self::default()
    }

    /// Sets the overall scan timeout.  The default of 500 ms suits live captures; file
    /// scans generally want something much larger.
    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.timeout = Duration::from_millis(timeout_ms);
    }

    /// Feeds a run of transport stream bytes; any amount, any alignment.
    pub fn feed(&mut self, data: &[u8]) -> FeedResult {
        if self.done {
            return FeedResult::Done;
        }
        let start = *self.start.get_or_insert_with(Instant::now);
        self.unpack.push(data);

        let elapsed = start.elapsed();
        if elapsed >= self.timeout {
            self.done = true;
            return FeedResult::Done;
        }

        let core = self.unpack.consumer();
        let mpe_complete = core.results_map.keys().all(|&key| core.manager.is_complete(key));
        let etina_complete = core.etina_ensembles.len() >= core.etina_streaming_pids.len();
        let has_content = !core.results_map.is_empty() || !core.etina_streaming_pids.is_empty();
        if has_content && mpe_complete && etina_complete && core.manager.complete_count() > 0 {
            self.done = true;
            return FeedResult::Done;
        }

        // nothing DAB-shaped at all after a second: stop early rather than sit out the
        // whole timeout on an unrelated mux
        if elapsed >= EARLY_EXIT
            && core.mpe_pids.is_empty()
            && core.etina_streaming_pids.is_empty()
            && core.results_map.is_empty()
        {
            self.done = true;
            return FeedResult::Done;
        }
        FeedResult::Continue
    }

    /// The ensembles discovered so far: completed ones with full labels, plus
    /// basic-ready ones whose labels may still be empty.
    pub fn get_results(&mut self) -> Vec<DiscoveredEnsemble> {
        let core = self.unpack.consumer();
        let mut results: Vec<DiscoveredEnsemble> = core.results_map.values().cloned().collect();
        results.extend(core.etina_ensembles.iter().map(|(_, de)| de.clone()));
        results
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// True if any transport stream packets were seen at all.
    pub fn had_traffic(&mut self) -> bool {
        self.unpack.consumer().total_packets > 0
    }

    /// PIDs found to carry MPE sections.
    pub fn get_mpe_pids(&mut self) -> Vec<u16> {
        self.unpack.consumer().mpe_pids.clone()
    }

    /// ETI-NA detections (PID plus alignment parameters).
    pub fn get_etina_results(&mut self) -> Vec<EtiNaPidInfo> {
        self.unpack.consumer().etina_results.clone()
    }

    /// Every PID that has carried at least one packet, in ascending order.
    pub fn get_active_pids(&mut self) -> Vec<u16> {
        self.unpack
            .consumer()
            .touched
            .ones()
            .map(|pid| pid as u16)
            .collect()
    }

    /// Continuity-counter breaks observed across all PIDs.
    pub fn discontinuity_count(&mut self) -> u64 {
        self.unpack.consumer().discontinuities
    }
}

/// Scans a transport stream file, reading it in 64 KiB runs until the scanner concludes
/// or the file ends.  Returns an empty list when the file cannot be read.
pub fn scan_ts_file(path: &str, timeout_ms: u64) -> Vec<DiscoveredEnsemble> {
    use std::io::Read;

    let mut scanner = TsScanner::new();
    scanner.set_timeout(timeout_ms);

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!("cannot open {}: {}", path, e);
            return Vec::new();
        }
    };
    let mut buf = vec![0u8; 65536];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if scanner.feed(&buf[..n]) == FeedResult::Done {
                    break;
                }
            }
            Err(e) => {
                warn!("read error on {}: {}", path, e);
                break;
            }
        }
    }
    scanner.get_results()
}
