//! Parsing of the Fast Information Channel carried inside ETI-NI frames.
//!
//! # Concepts
//!
//! * Each ETI-NI frame with the FIC flag set carries 96 bytes of FIC data (128 in DAB
//!   mode 3), divided into 32-byte *Fast Information Blocks*: 30 data bytes plus a
//!   CRC-16 check-word.
//! * Each FIB carries a sequence of *Fast Information Groups*.  A FIG's single header
//!   byte gives its type (bits 7..5) and payload length (bits 4..0); `0xFF` marks the
//!   end of the useful FIGs in a FIB.
//! * FIG type 0 extensions describe the ensemble structure (sub-channels, services,
//!   components); FIG type 1 extensions carry labels.
//!
//! The parser accumulates this information across frames and derives two readiness
//! signals,
//!
//! * **basic ready**: enough structure is known to start routing audio (services with
//!   resolvable sub-channels, stable for a few frames), typically 150 to 300 ms in;
//! * **complete**: every service is labelled, the ensemble is labelled, and the service
//!   set has stopped changing.  Parsing continues after completion so that sub-channel
//!   reassignments (regional windowing) remain observable.

mod fig0;
mod fig1;

use crate::crc16;
use crate::edi::{ETI_NI_FSYNC_EVEN, ETI_NI_FSYNC_ODD};
use crate::ensemble::{Ensemble, Service, Subchannel};
use log::{debug, info};
use std::collections::BTreeMap;

const FIB_SIZE: usize = 32;
const FIB_DATA_SIZE: usize = 30;

/// Frames the service count must hold steady before `basic_ready`.
const BASIC_STABLE_FRAMES: usize = 3;
/// Frames the service count must hold steady before `complete`.
const COMPLETE_STABLE_FRAMES: usize = 10;

// A service's links into the sub-channel set, before labels arrive.
#[derive(Default)]
struct ServiceLink {
    primary: Option<u8>,
    secondary: Option<u8>,
}

// FIG 0/3 packet-mode component description.
#[allow(dead_code)]
struct PacketModeInfo {
    subchid: u8,
    dscty: u8,
    dg_flag: bool,
}

/// Parses the FIC of successive ETI-NI frames into an [`Ensemble`](../ensemble/struct.Ensemble.html).
pub struct FicParser {
    subchannels: BTreeMap<u8, Subchannel>,
    services: BTreeMap<u32, ServiceLink>,
    packet_mode: BTreeMap<u16, PacketModeInfo>,
    // FIG 0/13: user application types announced per service
    user_applications: BTreeMap<u32, Vec<u16>>,
    service_labels: BTreeMap<u32, String>,
    ensemble_label: String,
    eid: u16,
    ensemble: Ensemble,

    basic_ready: bool,
    complete: bool,
    last_basic_service_count: usize,
    basic_stable_frames: usize,
    last_service_count: usize,
    stable_frames: usize,

    fib_crc_failures: u64,
}

impl Default for FicParser {
    fn default() -> FicParser {
        FicParser {
            subchannels: BTreeMap::new(),
            services: BTreeMap::new(),
            packet_mode: BTreeMap::new(),
            user_applications: BTreeMap::new(),
            service_labels: BTreeMap::new(),
            ensemble_label: String::new(),
            eid: 0,
            ensemble: Ensemble::default(),
            basic_ready: false,
            complete: false,
            last_basic_service_count: 0,
            basic_stable_frames: 0,
            last_service_count: 0,
            stable_frames: 0,
            fib_crc_failures: 0,
        }
    }
}

impl FicParser {
    pub fn new() -> FicParser {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = FicParser::new();
    }

    /// The ensemble as currently known.  Labels may still be empty before
    /// [`is_complete()`](#method.is_complete).
    pub fn ensemble(&self) -> &Ensemble {
        &self.ensemble
    }

    /// True once every service carries its label, the ensemble label is present, and
    /// the service set has been stable for several frames.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// True once the service/sub-channel structure is usable, before labels arrive.
    pub fn is_basic_ready(&self) -> bool {
        self.basic_ready
    }

    /// Count of FIBs dropped for CRC failure.
    pub fn fib_crc_failures(&self) -> u64 {
        self.fib_crc_failures
    }

    /// The sub-channel a packet-mode service component (FIG 0/3) is carried in.
    pub fn packet_mode_subchannel(&self, scid: u16) -> Option<u8> {
        self.packet_mode.get(&scid).map(|info| info.subchid)
    }

    /// User application types (FIG 0/13) announced for the given service, in the order
    /// first seen.  EPG is `0x007`, SlideShow `0x002`.
    pub fn user_applications(&self, sid: u32) -> &[u16] {
        self.user_applications
            .get(&sid)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Processes one ETI-NI frame.  Returns `true` once the ensemble is complete.
    pub fn process_eti_frame(&mut self, frame: &[u8]) -> bool {
        if frame.len() < 8 {
            return self.complete;
        }
        let sync = u32::from(frame[0]) << 24
            | u32::from(frame[1]) << 16
            | u32::from(frame[2]) << 8
            | u32::from(frame[3]);
        if sync != ETI_NI_FSYNC_ODD && sync != ETI_NI_FSYNC_EVEN {
            debug!("ETI frame sync mismatch: {:#010x}", sync);
            return self.complete;
        }

        // FC word
        let ficf = frame[5] & 0x80 != 0;
        let nst = usize::from(frame[5] & 0x7F);
        let mid = frame[6] >> 3 & 0x03;
        if !ficf {
            return self.complete;
        }
        let fic_words = if mid == 3 { 32 } else { 24 };
        let stc_end = 8 + nst * 4 + 4;
        let fic_len = fic_words * 4;
        if stc_end + fic_len > frame.len() {
            return self.complete;
        }
        let fic = &frame[stc_end..stc_end + fic_len];
        for fib in fic.chunks_exact(FIB_SIZE) {
            self.process_fib(fib);
        }

        if !self.services.is_empty() {
            self.build_ensemble();
        }
        self.update_readiness();
        self.complete
    }

    fn process_fib(&mut self, fib: &[u8]) {
        if !crc16::check(&fib[..FIB_SIZE]) {
            self.fib_crc_failures += 1;
            return;
        }
        let mut pos = 0;
        while pos < FIB_DATA_SIZE {
            let header = fib[pos];
            if header == 0xFF {
                break;
            }
            let fig_type = header >> 5 & 0x07;
            let fig_len = usize::from(header & 0x1F);
            if pos + 1 + fig_len > FIB_DATA_SIZE {
                // a malformed length would overflow the FIB; stop here rather than
                // misread the check-word as FIG data
                break;
            }
            self.process_fig(fig_type, &fib[pos + 1..pos + 1 + fig_len]);
            pos += 1 + fig_len;
        }
    }

    fn process_fig(&mut self, fig_type: u8, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        match fig_type {
            0 => {
                let pd = payload[0] >> 5 & 0x01 == 1;
                let ext = payload[0] & 0x1F;
                fig0::process(self, ext, pd, &payload[1..]);
            }
            1 => {
                let ext = payload[0] & 0x07;
                fig1::process(self, ext, &payload[1..]);
            }
            // other FIG types carry conditional access and announcement data this
            // parser has no use for
            _ => {}
        }
    }

    fn build_ensemble(&mut self) {
        self.ensemble.eid = self.eid;
        self.ensemble.label = self.ensemble_label.clone();
        self.ensemble.services.clear();
        for (&sid, link) in &self.services {
            let primary = match link.primary {
                Some(p) => p,
                None => continue,
            };
            let sc = match self.subchannels.get(&primary) {
                Some(sc) => sc,
                None => continue,
            };
            self.ensemble.services.push(Service {
                sid,
                label: self.service_labels.get(&sid).cloned().unwrap_or_default(),
                bitrate_kbps: sc.bitrate_kbps,
                subchannel_id: sc.id,
                secondary_subchannel_id: link.secondary,
                start_addr: sc.start_addr,
                size: sc.size,
                protection: sc.protection,
                dabplus: sc.dabplus,
            });
        }
        // BTreeMap iteration already orders services by SID
    }

    fn update_readiness(&mut self) {
        if !self.basic_ready && !self.services.is_empty() {
            let valid_services = self
                .services
                .values()
                .filter(|link| {
                    link.primary
                        .map_or(false, |p| self.subchannels.contains_key(&p))
                })
                .count();
            if valid_services > 0 {
                if valid_services != self.last_basic_service_count {
                    self.last_basic_service_count = valid_services;
                    self.basic_stable_frames = 0;
                } else {
                    self.basic_stable_frames += 1;
                }
                if self.basic_stable_frames >= BASIC_STABLE_FRAMES {
                    self.basic_ready = true;
                    info!(
                        "ensemble {:#06x} basic ready with {} services",
                        self.eid, valid_services
                    );
                }
            }
        }

        if !self.services.is_empty() {
            if self.services.len() != self.last_service_count {
                self.last_service_count = self.services.len();
                self.stable_frames = 0;
            } else {
                self.stable_frames += 1;
            }
            if !self.complete {
                let labelled = self
                    .services
                    .keys()
                    .filter(|sid| self.service_labels.contains_key(sid))
                    .count();
                let all_labelled =
                    labelled == self.services.len() && !self.ensemble_label.is_empty();
                if all_labelled && self.stable_frames >= COMPLETE_STABLE_FRAMES {
                    self.complete = true;
                    info!(
                        "ensemble {:#06x} '{}' complete with {} services",
                        self.eid,
                        self.ensemble_label,
                        self.services.len()
                    );
                }
            }
        }
    }
}
