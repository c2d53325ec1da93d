//! Convenience discovery surfaces: scan a file or file descriptor in one call, or feed
//! IP packets incrementally through [`EnsembleDiscovery`](struct.EnsembleDiscovery.html).
//!
//! These wrap the push-based core ([sources](../sources/index.html) feeding an
//! [`EnsembleManager`](../manager/struct.EnsembleManager.html)) with timeout handling.
//! None of them return errors: a missing file, an unreadable fd or a stream with no DAB
//! content all produce an empty result list, in keeping with the best-effort nature of
//! broadcast reception.

use crate::ensemble::{DiscoveredEnsemble, StreamKey};
use crate::etina::EtiNaDetection;
use crate::manager::{EnsembleManager, Event};
use crate::sources::{BbfTsSource, GseTsSource, InputSource, MpeTsSource};
use crate::udp;
use log::warn;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// The encapsulation family a transport stream uses to carry its ensembles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    /// MPE sections on a known PID.
    Mpe,
    /// DVB-S2 baseband frames in pseudo-TS containers.
    Bbf,
    /// GSE packets directly in TS payloads.
    Gse,
}

/// Configuration surface for the external re-broadcast subsystem.
///
/// The output side (TS muxer, packetiser, socket sender) lives outside this crate; this
/// struct is the shape it is configured with.  The contract it consumes from this crate
/// is the ETI frame event stream and the discovered ensemble records.
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub format: InputFormat,
    /// Carrier PID (meaningful for `InputFormat::Mpe` and ETI-NA).
    pub pid: u16,
    /// Known ETI-NA alignment, when re-tuning a previously discovered stream.
    pub etina: Option<EtiNaDetection>,
    /// Restrict to one destination address (0 matches anything).
    pub filter_ip: u32,
    /// Restrict to one destination port (0 matches anything).
    pub filter_port: u16,
    /// Ensemble identifier, when already known from an earlier scan.
    pub eid: Option<u16>,
}

impl StreamerConfig {
    pub fn new(format: InputFormat, pid: u16) -> StreamerConfig {
        StreamerConfig {
            format,
            pid,
            etina: None,
            filter_ip: 0,
            filter_port: 0,
            eid: None,
        }
    }
}

fn mk_source(format: InputFormat, pid: u16) -> Box<dyn InputSource> {
    match format {
        InputFormat::Mpe => Box::new(MpeTsSource::new(pid)),
        InputFormat::Bbf => Box::new(BbfTsSource::new()),
        InputFormat::Gse => Box::new(GseTsSource::new()),
    }
}

// Drives a source's drained datagrams through the manager, keeping stream→PID
// attribution and a result per stream (partial from basic-ready, full from complete).
#[derive(Default)]
struct DiscoveryState {
    manager: EnsembleManager,
    stream_pid_map: BTreeMap<StreamKey, u16>,
    results_map: BTreeMap<StreamKey, DiscoveredEnsemble>,
}

impl DiscoveryState {
    fn drain_source(&mut self, source: &mut dyn InputSource) {
        while let Some(ip_packet) = source.pop_ip_packet() {
            let key = match udp::extract(&ip_packet) {
                Some(dg) => StreamKey::new(dg.dst_ip, dg.dst_port),
                None => continue,
            };
            self.stream_pid_map.entry(key).or_insert(source.last_pid());
            let events = self.manager.process_ip_packet(&ip_packet);
            for event in events {
                if let Event::BasicReady { key, ensemble } | Event::Complete { key, ensemble } =
                    event
                {
                    let pid = self.stream_pid_map.get(&key).copied().unwrap_or(0);
                    self.results_map
                        .insert(key, DiscoveredEnsemble::from_ensemble(key, pid, &ensemble));
                }
            }
        }
    }

    fn results(&self) -> Vec<DiscoveredEnsemble> {
        self.results_map.values().cloned().collect()
    }

    fn all_complete(&self) -> bool {
        self.manager.all_complete() && self.manager.complete_count() > 0
    }
}

/// Discovers the ensembles in a transport stream file.
///
/// `pid` selects the carrier for `InputFormat::Mpe` and is ignored otherwise.  Returns
/// whatever was discovered before the timeout or end of file; ensembles that had not
/// completed appear with empty labels.
pub fn discover_ensembles(
    path: &str,
    format: InputFormat,
    pid: u16,
    timeout_ms: u64,
) -> Vec<DiscoveredEnsemble> {
    use std::io::Read;

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!("cannot open {}: {}", path, e);
            return Vec::new();
        }
    };
    let mut source = mk_source(format, pid);
    let mut state = DiscoveryState::default();
    let timeout = Duration::from_millis(timeout_ms);
    let start = Instant::now();
    let mut buf = vec![0u8; 65536];

    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                source.feed(&buf[..n]);
                state.drain_source(source.as_mut());
            }
            Err(e) => {
                warn!("read error on {}: {}", path, e);
                break;
            }
        }
        if start.elapsed() >= timeout || state.all_complete() {
            break;
        }
    }
    source.flush();
    state.drain_source(source.as_mut());
    state.results()
}

/// Discovers ensembles by reading a file descriptor (a DVR device, a pipe), polling in
/// 100 ms slices until the timeout passes, the descriptor reaches end of file, or every
/// discovered stream completes.
#[cfg(unix)]
pub fn discover_ensembles_from_fd(
    fd: std::os::unix::io::RawFd,
    format: InputFormat,
    pid: u16,
    timeout_ms: u64,
) -> Vec<DiscoveredEnsemble> {
    if fd < 0 {
        return Vec::new();
    }
    let mut source = mk_source(format, pid);
    let mut state = DiscoveryState::default();
    let timeout = Duration::from_millis(timeout_ms);
    let start = Instant::now();
    let mut buf = vec![0u8; 65536];

    loop {
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            break;
        }
        let remaining = (timeout - elapsed).as_millis() as i32;
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, remaining.min(100)) };
        if ready < 0 {
            warn!("poll failed: {}", std::io::Error::last_os_error());
            break;
        }
        if ready > 0 && pfd.revents & libc::POLLIN != 0 {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 {
                warn!("read failed: {}", std::io::Error::last_os_error());
                break;
            }
            if n == 0 {
                break;
            }
            source.feed(&buf[..n as usize]);
            state.drain_source(source.as_mut());
        }
        if state.all_complete() {
            break;
        }
    }
    source.flush();
    state.drain_source(source.as_mut());
    state.results()
}

/// Returned by [`EnsembleDiscovery::feed_ip_packet`](struct.EnsembleDiscovery.html#method.feed_ip_packet).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DiscoveryResult {
    /// Keep feeding packets.
    Continue,
    /// Every discovered stream is complete (or the total timeout passed with results).
    Done,
    /// No multicast traffic within the early window, or the total timeout passed with
    /// nothing found.  Stop waiting and re-tune.
    Failed,
}

/// Incremental ensemble discovery for callers that already demultiplex their transport
/// stream: feed it the IPv4 datagrams extracted from MPE sections.
///
/// Two-tier timeout: if no *multicast* UDP arrives within `early_timeout_ms` the stream
/// evidently carries no DAB and discovery fails fast; otherwise packets accumulate until
/// every discovered stream completes or `total_timeout_ms` passes.
pub struct EnsembleDiscovery {
    manager: EnsembleManager,
    results: BTreeMap<StreamKey, DiscoveredEnsemble>,
    early_timeout: Duration,
    total_timeout: Duration,
    start: Instant,
    multicast_seen: bool,
    done: bool,
}

impl EnsembleDiscovery {
    pub fn new(early_timeout_ms: u64, total_timeout_ms: u64) -> EnsembleDiscovery {
        EnsembleDiscovery {
            manager: EnsembleManager::new(),
            results: BTreeMap::new(),
            early_timeout: Duration::from_millis(early_timeout_ms),
            total_timeout: Duration::from_millis(total_timeout_ms),
            start: Instant::now(),
            multicast_seen: false,
            done: false,
        }
    }

    /// Feeds one IPv4 packet (as carried by an MPE section).
    pub fn feed_ip_packet(&mut self, ip_packet: &[u8]) -> DiscoveryResult {
        if self.done {
            return if self.results.is_empty() {
                DiscoveryResult::Failed
            } else {
                DiscoveryResult::Done
            };
        }

        if let Some(dg) = udp::extract(ip_packet) {
            if dg.is_multicast() && !dg.payload.is_empty() {
                self.multicast_seen = true;
                let key = StreamKey::new(dg.dst_ip, dg.dst_port);
                let events = self.manager.process_udp(dg.dst_ip, dg.dst_port, dg.payload);
                for event in events {
                    if let Event::Complete { ensemble, .. } = event {
                        self.results
                            .insert(key, DiscoveredEnsemble::from_ensemble(key, 0, &ensemble));
                    }
                }
            }
        }

        if self.manager.all_complete() && self.manager.complete_count() > 0 {
            self.done = true;
            return DiscoveryResult::Done;
        }

        let elapsed = self.start.elapsed();
        if !self.multicast_seen && elapsed >= self.early_timeout {
            self.done = true;
            return DiscoveryResult::Failed;
        }
        if elapsed >= self.total_timeout {
            self.done = true;
            return if self.results.is_empty() {
                DiscoveryResult::Failed
            } else {
                DiscoveryResult::Done
            };
        }
        DiscoveryResult::Continue
    }

    /// The complete ensembles discovered so far.
    pub fn get_results(&self) -> Vec<DiscoveredEnsemble> {
        self.results.values().cloned().collect()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn has_ensembles(&self) -> bool {
        !self.results.is_empty()
    }
}

#[cfg(test)]
mod test {
    use crate::bbf::test::mk_bbf_containers;
    use crate::discover::{
        discover_ensembles, DiscoveryResult, EnsembleDiscovery, InputFormat, StreamerConfig,
    };
    use crate::edi::test::mk_eti_af;
    use crate::fic::test as fic_test;
    use crate::gse::test::{mk_gse_complete, mk_gse_fragments};
    use crate::scanner::test::mk_ts;
    use crate::udp::test::mk_ipv4_udp;

    fn write_temp(name: &str, data: &[u8]) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("dvbdab-reader-test-{}-{}", std::process::id(), name));
        std::fs::write(&path, data).unwrap();
        path
    }

    // The WDR ensemble's EDI stream as IPv4 datagrams.
    fn wdr_ip_packets(frames: usize) -> Vec<Vec<u8>> {
        let regions = fic_test::wdr_fic_regions();
        (0..frames)
            .map(|i| {
                let af = mk_eti_af(&regions[i % 2], i as u16, &[]);
                mk_ipv4_udp(0xEFC7_0201, 1234, &af)
            })
            .collect()
    }

    fn assert_wdr(results: &[crate::ensemble::DiscoveredEnsemble], pid: u16) {
        assert_eq!(results.len(), 1);
        let ens = &results[0];
        assert_eq!(ens.ip, 0xEFC7_0201);
        assert_eq!(ens.port, 1234);
        assert_eq!(ens.pid, pid);
        assert_eq!(ens.eid, 0xD1C2);
        assert_eq!(ens.label, "WDR RADIO");
        assert_eq!(ens.services.len(), 2);
        assert!(ens.services[0].dabplus);
        assert_eq!(ens.services[0].bitrate_kbps, 88);
        assert_eq!(ens.services[1].bitrate_kbps, 160);
        assert!(!ens.is_etina);
    }

    #[test]
    fn discover_gse_with_fragmentation() {
        // one complete packet establishes GSE sync; every further datagram arrives
        // fragmented across three GSE packets
        let packets = wdr_ip_packets(25);
        let mut stream = mk_gse_complete(&packets[0]);
        for (i, ip) in packets.iter().enumerate() {
            for frag in mk_gse_fragments(ip, (i & 0xFF) as u8) {
                stream.extend_from_slice(&frag);
            }
        }
        let mut ts = vec![];
        let mut cc = 0u8;
        for chunk in stream.chunks(184) {
            let mut payload = chunk.to_vec();
            while payload.len() < 184 {
                payload.push(0x00);
            }
            ts.extend_from_slice(&mk_ts(0x320, false, cc, &payload));
            cc = (cc + 1) & 0x0F;
        }
        let path = write_temp("gse", &ts);
        let results = discover_ensembles(path.to_str().unwrap(), InputFormat::Gse, 0, 10_000);
        std::fs::remove_file(&path).ok();
        assert_wdr(&results, 0x320);
    }

    #[test]
    fn discover_bbf() {
        let packets = wdr_ip_packets(25);
        let mut ts = vec![];
        let mut cc = 0u8;
        for ip in &packets {
            // one baseband frame per datagram
            let region = mk_gse_complete(ip);
            for container in mk_bbf_containers(&region, 0x2BC, cc) {
                ts.extend_from_slice(&container);
                cc = (cc + 1) & 0x0F;
            }
        }
        let path = write_temp("bbf", &ts);
        let results = discover_ensembles(path.to_str().unwrap(), InputFormat::Bbf, 0, 10_000);
        std::fs::remove_file(&path).ok();
        assert_wdr(&results, 0x2BC);
    }

    #[test]
    fn discover_mpe_file() {
        let ts = crate::scanner::test::mk_wdr_mpe_ts(3000, 25);
        let path = write_temp("mpe", &ts);
        let results = discover_ensembles(path.to_str().unwrap(), InputFormat::Mpe, 3000, 10_000);
        std::fs::remove_file(&path).ok();
        assert_wdr(&results, 3000);
    }

    #[test]
    fn missing_file_yields_empty() {
        let results = discover_ensembles("/nonexistent/definitely-not-here.ts", InputFormat::Mpe, 3000, 100);
        assert!(results.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn discover_from_fd() {
        use std::os::unix::io::AsRawFd;

        let ts = crate::scanner::test::mk_wdr_mpe_ts(3000, 25);
        let path = write_temp("fd", &ts);
        let file = std::fs::File::open(&path).unwrap();
        let results =
            super::discover_ensembles_from_fd(file.as_raw_fd(), InputFormat::Mpe, 3000, 5_000);
        std::fs::remove_file(&path).ok();
        assert_wdr(&results, 3000);

        // invalid fd fails soft
        assert!(super::discover_ensembles_from_fd(-1, InputFormat::Mpe, 3000, 100).is_empty());
    }

    #[test]
    fn incremental_discovery_completes() {
        let mut discovery = EnsembleDiscovery::new(1000, 10_000);
        let mut done = false;
        for ip in wdr_ip_packets(25) {
            match discovery.feed_ip_packet(&ip) {
                DiscoveryResult::Done => {
                    done = true;
                    break;
                }
                DiscoveryResult::Failed => panic!("discovery failed"),
                DiscoveryResult::Continue => {}
            }
        }
        assert!(done);
        assert!(discovery.is_done());
        assert!(discovery.has_ensembles());
        let results = discovery.get_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].eid, 0xD1C2);
    }

    #[test]
    fn unicast_only_fails_after_early_timeout() {
        let mut discovery = EnsembleDiscovery::new(50, 10_000);
        let unicast = mk_ipv4_udp(0x0A00_0001, 5004, b"not dab");
        assert_eq!(discovery.feed_ip_packet(&unicast), DiscoveryResult::Continue);
        std::thread::sleep(std::time::Duration::from_millis(60));
        assert_eq!(discovery.feed_ip_packet(&unicast), DiscoveryResult::Failed);
        assert!(discovery.is_done());
        assert!(!discovery.has_ensembles());
        // further feeding stays failed
        assert_eq!(discovery.feed_ip_packet(&unicast), DiscoveryResult::Failed);
    }

    #[test]
    fn streamer_config_defaults() {
        let cfg = StreamerConfig::new(InputFormat::Mpe, 3000);
        assert_eq!(cfg.pid, 3000);
        assert_eq!(cfg.filter_ip, 0);
        assert_eq!(cfg.filter_port, 0);
        assert!(cfg.etina.is_none());
        assert!(cfg.eid.is_none());
    }
}
