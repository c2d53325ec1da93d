//! The ensemble/service model produced by the Fast Information Channel parser, and the
//! result records surfaced to callers.

use crate::etina::EtiNaDetection;
use std::fmt;

/// Identifies a logical stream at UDP level: the destination address and port of the
/// datagrams that carry it.
///
/// ETI-NA streams have no UDP identity; they are keyed as `ip = pid, port = 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamKey {
    /// Destination address, most-significant-byte first.
    pub ip: u32,
    /// Destination port.
    pub port: u16,
}

impl StreamKey {
    pub fn new(ip: u32, port: u16) -> StreamKey {
        StreamKey { ip, port }
    }

    /// The key form used for ETI-NA streams, which have no UDP identity.
    pub fn for_pid(pid: u16) -> StreamKey {
        StreamKey {
            ip: u32::from(pid),
            port: 0,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}:{}",
            self.ip >> 24 & 0xFF,
            self.ip >> 16 & 0xFF,
            self.ip >> 8 & 0xFF,
            self.ip & 0xFF,
            self.port
        )
    }
}

/// The error protection applied to a sub-channel, per _ETSI EN 300 401_.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Unequal error protection, described by an index into the standard table.
    Uep { table_index: u8 },
    /// Equal error protection; levels 0..3 are EEP-1A..4A, 4..7 are EEP-1B..4B.
    Eep { level: u8 },
}

impl Default for Protection {
    fn default() -> Protection {
        Protection::Uep { table_index: 0 }
    }
}

/// One sub-channel of the Main Service Channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subchannel {
    /// Sub-channel identifier, 0..63.
    pub id: u8,
    /// Start address in capacity units.
    pub start_addr: u16,
    /// Size in capacity units (0 when only the short form has been seen).
    pub size: u16,
    /// Derived audio bitrate in kbit/s.
    pub bitrate_kbps: u32,
    pub protection: Protection,
    /// True when the sub-channel carries HE-AAC (DAB+) audio rather than MPEG-1 Layer II.
    pub dabplus: bool,
}

/// One service of an ensemble.
///
/// Audio services carry a 16-bit SID; data services a 32-bit one (ECC + country + short
/// SID).  A service points into at most two sub-channels; the fields here describe the
/// primary one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Service {
    pub sid: u32,
    /// UTF-8 service label; empty until FIG 1/1 has been seen.
    pub label: String,
    pub bitrate_kbps: u32,
    pub subchannel_id: u8,
    /// Secondary sub-channel, where the service announced one.
    pub secondary_subchannel_id: Option<u8>,
    pub start_addr: u16,
    pub size: u16,
    pub protection: Protection,
    pub dabplus: bool,
}

/// A DAB ensemble as learned from the FIC.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ensemble {
    /// Ensemble identifier from FIG 0/0.
    pub eid: u16,
    /// UTF-8 ensemble label; empty until FIG 1/0 has been seen.
    pub label: String,
    /// Services ordered by SID.  Every service's primary sub-channel is present in the
    /// sub-channel set the FIC has announced.
    pub services: Vec<Service>,
}

/// A service entry within a [`DiscoveredEnsemble`](struct.DiscoveredEnsemble.html).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredService {
    pub sid: u32,
    pub label: String,
    pub bitrate_kbps: u32,
    pub subchannel_id: u8,
    pub dabplus: bool,
}

/// A discovery result: one ensemble, where it was found, and what it carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredEnsemble {
    /// Multicast destination address (0 for ETI-NA streams).
    pub ip: u32,
    /// UDP destination port (0 for ETI-NA streams).
    pub port: u16,
    /// The PID the stream was carried on (0 when the input was not a transport stream).
    pub pid: u16,
    pub eid: u16,
    pub label: String,
    pub services: Vec<DiscoveredService>,
    /// True for ensembles recovered from an ETI-NA bit-stream.
    pub is_etina: bool,
    /// ETI-NA alignment parameters, when `is_etina`.
    pub etina_info: Option<EtiNaDetection>,
}

impl DiscoveredEnsemble {
    pub fn from_ensemble(key: StreamKey, pid: u16, ens: &Ensemble) -> DiscoveredEnsemble {
        DiscoveredEnsemble {
            ip: key.ip,
            port: key.port,
            pid,
            eid: ens.eid,
            label: ens.label.clone(),
            services: ens
                .services
                .iter()
                .map(|svc| DiscoveredService {
                    sid: svc.sid,
                    label: svc.label.clone(),
                    bitrate_kbps: svc.bitrate_kbps,
                    subchannel_id: svc.subchannel_id,
                    dabplus: svc.dabplus,
                })
                .collect(),
            is_etina: false,
            etina_info: None,
        }
    }

    /// Convenience: a human-readable source description.
    pub fn address(&self) -> String {
        if self.is_etina {
            format!("ETI-NA PID {}", self.pid)
        } else {
            format!("{}", StreamKey::new(self.ip, self.port))
        }
    }
}

/// Sentinel sub-channel value marking a service addition or removal in a
/// [`SubchannelChange`](struct.SubchannelChange.html).
pub const SUBCHANNEL_NONE: u8 = 0xFF;

/// Reports that a service moved between sub-channels (regional windowing), appeared, or
/// disappeared, after its ensemble completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubchannelChange {
    pub sid: u32,
    /// Previous sub-channel, or [`SUBCHANNEL_NONE`](constant.SUBCHANNEL_NONE.html) for a
    /// new service.
    pub old_subchannel_id: u8,
    /// New sub-channel, or [`SUBCHANNEL_NONE`](constant.SUBCHANNEL_NONE.html) for a
    /// removed service.
    pub new_subchannel_id: u8,
}
