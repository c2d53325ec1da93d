//! Multiplexing of per-stream parsers and publication of discovery transitions.
//!
//! An [`EnsembleManager`](struct.EnsembleManager.html) owns one parser per logical
//! stream: UDP-carried EDI streams are keyed by `(dst_ip, dst_port)`, ETI-NA streams by
//! PID.  Each `process_*` call returns the [`Event`](enum.Event.html)s it produced, in
//! firing order; the caller reacts to them after the call returns.  `BasicReady` and
//! `Complete` are produced at most once per stream.

use crate::edi::EdiDecoder;
use crate::ensemble::{Ensemble, StreamKey, SubchannelChange, SUBCHANNEL_NONE};
use crate::fic::FicParser;
use crate::udp;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

/// A discovery transition or output produced by the manager.
pub enum Event {
    /// The stream's service structure is usable; audio routing may start.  Fired before
    /// the `EtiFrame` event of the frame on which it became true.
    BasicReady { key: StreamKey, ensemble: Ensemble },
    /// Every service is labelled and the service set is stable.
    Complete { key: StreamKey, ensemble: Ensemble },
    /// One reassembled ETI-NI frame (24 ms of ensemble content).
    EtiFrame {
        key: StreamKey,
        frame: Vec<u8>,
        /// Data Flow Counter for continuity checking; 0 when the source (ETI-NA) does
        /// not carry one.
        dflc: u16,
    },
    /// Post-completion changes to the service→sub-channel mapping (regional windowing).
    SubchannelChanges {
        key: StreamKey,
        changes: Vec<SubchannelChange>,
    },
}

// One UDP-carried stream: EDI reassembly feeding a FIC parser.
struct StreamParser {
    edi: EdiDecoder,
    fic: FicParser,
}

impl StreamParser {
    fn new() -> StreamParser {
        StreamParser {
            edi: EdiDecoder::new(),
            fic: FicParser::new(),
        }
    }
}

/// Routes stream data to per-stream parsers and reports their transitions.
#[derive(Default)]
pub struct EnsembleManager {
    parsers: BTreeMap<StreamKey, StreamParser>,
    etina_parsers: BTreeMap<u16, FicParser>,
    ensembles: BTreeMap<StreamKey, Ensemble>,
    basic_ready: BTreeSet<StreamKey>,
    complete: BTreeSet<StreamKey>,
    // sid -> sub-channel, as last reported, for post-completion diffing
    last_subchannel_map: BTreeMap<StreamKey, BTreeMap<u32, u8>>,
    complete_count: usize,
}

impl EnsembleManager {
    pub fn new() -> EnsembleManager {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = EnsembleManager::new();
    }

    /// Feeds one EDI packet for the stream addressed to `dst_ip:dst_port`.
    pub fn process_udp(&mut self, dst_ip: u32, dst_port: u16, payload: &[u8]) -> Vec<Event> {
        let key = StreamKey::new(dst_ip, dst_port);
        let mut events = Vec::new();

        let parser = self.parsers.entry(key).or_insert_with(StreamParser::new);
        if let Some(eti) = parser.edi.feed(payload) {
            parser.fic.process_eti_frame(&eti.data[..]);
            let frame: Box<[u8]> = eti.data;
            events.push(Event::EtiFrame {
                key,
                frame: frame.into_vec(),
                dflc: eti.dflc,
            });
        }
        let is_basic = parser.fic.is_basic_ready();
        let is_complete = parser.fic.is_complete();
        let ensemble = parser.fic.ensemble().clone();

        if is_basic && self.basic_ready.insert(key) {
            events.push(Event::BasicReady {
                key,
                ensemble: ensemble.clone(),
            });
        }
        if is_complete && self.complete.insert(key) {
            self.complete_count += 1;
            self.ensembles.insert(key, ensemble.clone());
            // seed the mapping so only later movement is reported
            self.last_subchannel_map
                .insert(key, Self::subchannel_map(&ensemble));
            events.push(Event::Complete {
                key,
                ensemble: ensemble.clone(),
            });
        }
        if self.complete.contains(&key) {
            if let Some(ev) = self.diff_subchannels(key, &ensemble) {
                events.push(ev);
            }
        }
        events
    }

    /// Extracts the UDP datagram from a raw IPv4 packet and feeds it.
    pub fn process_ip_packet(&mut self, ip_packet: &[u8]) -> Vec<Event> {
        match udp::extract(ip_packet) {
            Some(dg) if !dg.payload.is_empty() => {
                self.process_udp(dg.dst_ip, dg.dst_port, dg.payload)
            }
            _ => Vec::new(),
        }
    }

    /// Feeds one pre-assembled ETI-NI frame for the PID-keyed (ETI-NA) stream.
    ///
    /// The `BasicReady` event is ordered before this frame's `EtiFrame` event, so a
    /// downstream muxer exists before the first audio bytes reach it.
    pub fn process_eti_frame(&mut self, pid: u16, frame: &[u8]) -> Vec<Event> {
        let key = StreamKey::for_pid(pid);
        let mut events = Vec::new();

        let parser = self.etina_parsers.entry(pid).or_insert_with(FicParser::new);
        parser.process_eti_frame(frame);
        let is_basic = parser.is_basic_ready();
        let is_complete = parser.is_complete();
        let ensemble = parser.ensemble().clone();

        if is_basic && self.basic_ready.insert(key) {
            events.push(Event::BasicReady {
                key,
                ensemble: ensemble.clone(),
            });
        }
        events.push(Event::EtiFrame {
            key,
            frame: frame.to_vec(),
            dflc: 0,
        });
        if is_complete && self.complete.insert(key) {
            self.complete_count += 1;
            self.ensembles.insert(key, ensemble.clone());
            self.last_subchannel_map
                .insert(key, Self::subchannel_map(&ensemble));
            events.push(Event::Complete { key, ensemble });
        }
        events
    }

    fn subchannel_map(ensemble: &Ensemble) -> BTreeMap<u32, u8> {
        ensemble
            .services
            .iter()
            .map(|svc| (svc.sid, svc.subchannel_id))
            .collect()
    }

    fn diff_subchannels(&mut self, key: StreamKey, current: &Ensemble) -> Option<Event> {
        let prev = self.last_subchannel_map.entry(key).or_default();
        let current_map = Self::subchannel_map(current);
        let mut changes = Vec::new();
        for (&sid, &new_subch) in &current_map {
            match prev.get(&sid) {
                None => changes.push(SubchannelChange {
                    sid,
                    old_subchannel_id: SUBCHANNEL_NONE,
                    new_subchannel_id: new_subch,
                }),
                Some(&old) if old != new_subch => changes.push(SubchannelChange {
                    sid,
                    old_subchannel_id: old,
                    new_subchannel_id: new_subch,
                }),
                _ => {}
            }
        }
        for (&sid, &old) in prev.iter() {
            if !current_map.contains_key(&sid) {
                changes.push(SubchannelChange {
                    sid,
                    old_subchannel_id: old,
                    new_subchannel_id: SUBCHANNEL_NONE,
                });
            }
        }
        if changes.is_empty() {
            return None;
        }
        debug!("stream {} sub-channel changes: {}", key, changes.len());
        *prev = current_map;
        Some(Event::SubchannelChanges { key, changes })
    }

    /// Complete ensembles, keyed by stream.
    pub fn ensembles(&self) -> &BTreeMap<StreamKey, Ensemble> {
        &self.ensembles
    }

    /// Every stream's current ensemble model, complete or not.
    pub fn all_ensembles(&self) -> BTreeMap<StreamKey, Ensemble> {
        let mut all: BTreeMap<StreamKey, Ensemble> = self
            .parsers
            .iter()
            .map(|(&key, p)| (key, p.fic.ensemble().clone()))
            .collect();
        for (&pid, p) in &self.etina_parsers {
            all.insert(StreamKey::for_pid(pid), p.ensemble().clone());
        }
        all
    }

    pub fn is_complete(&self, key: StreamKey) -> bool {
        self.complete.contains(&key)
    }

    /// True when at least one stream exists and every known stream is complete.
    pub fn all_complete(&self) -> bool {
        if self.parsers.is_empty() && self.etina_parsers.is_empty() {
            return false;
        }
        self.parsers
            .keys()
            .copied()
            .chain(self.etina_parsers.keys().map(|&pid| StreamKey::for_pid(pid)))
            .all(|key| self.complete.contains(&key))
    }

    pub fn complete_count(&self) -> usize {
        self.complete_count
    }

    /// Number of distinct streams seen (UDP and ETI-NA).
    pub fn stream_count(&self) -> usize {
        self.parsers.len() + self.etina_parsers.len()
    }
}
