//! FIG type 0 extensions: ensemble structure, sub-channel organisation, service and
//! component definitions.

use super::{FicParser, PacketModeInfo, ServiceLink};
use crate::ensemble::{Protection, Subchannel};
use log::debug;

// UEP sub-channel bitrates by protection profile index, _ETSI EN 300 401_ table 6.
#[rustfmt::skip]
const UEP_BITRATES: [u32; 64] = [
    32, 32, 32, 32, 32,
    48, 48, 48, 48, 48,
    56, 56, 56, 56,
    64, 64, 64, 64, 64, 64, 64,
    80, 80, 80, 80, 80, 80,
    96, 96, 96, 96, 96, 96,
    112, 112, 112, 112,
    128, 128, 128, 128, 128, 128, 128,
    160, 160, 160, 160, 160, 160,
    192, 192, 192, 192, 192, 192, 192,
    224, 224, 224, 224, 224,
    256, 256,
];

// Long-form (EEP) bitrate: the sub-channel size in capacity units divided by a
// per-protection-level factor gives the bitrate in multiples of 8 kbit/s.
fn eep_bitrate(size: u16, level: u8) -> u32 {
    let divisor = match level {
        0 => 12, // EEP-1A
        1 => 8,  // EEP-2A
        2 => 6,  // EEP-3A
        3 => 4,  // EEP-4A
        4 => 27, // EEP-1B
        5 => 21, // EEP-2B
        6 => 18, // EEP-3B
        7 => 15, // EEP-4B
        _ => return 0,
    };
    u32::from(size) / divisor * 8
}

pub(super) fn process(parser: &mut FicParser, ext: u8, pd: bool, data: &[u8]) {
    match ext {
        0 => ensemble_information(parser, data),
        1 => subchannel_organisation(parser, data),
        2 => service_components(parser, pd, data),
        3 => packet_mode_components(parser, data),
        8 => component_global_definition(parser, pd, data),
        13 => user_applications(parser, pd, data),
        // remaining extensions (announcements, frequencies, dates) are not needed to
        // describe the ensemble
        _ => {}
    }
}

// FIG 0/0: the ensemble identifier, repeated far more often than the ensemble label.
fn ensemble_information(parser: &mut FicParser, data: &[u8]) {
    if data.len() < 4 {
        return;
    }
    let eid = u16::from(data[0]) << 8 | u16::from(data[1]);
    if parser.eid != eid {
        debug!("FIG 0/0: ensemble {:#06x}", eid);
        parser.eid = eid;
    }
}

// FIG 0/1: sub-channel organisation; 3-byte short form (UEP) or 4-byte long form (EEP)
// entries.
fn subchannel_organisation(parser: &mut FicParser, data: &[u8]) {
    let mut pos = 0;
    while pos + 3 <= data.len() {
        let subchid = data[pos] >> 2 & 0x3F;
        let start_addr = u16::from(data[pos] & 0x03) << 8 | u16::from(data[pos + 1]);
        let long_form = data[pos + 2] & 0x80 != 0;

        // FIG 0/2 may have marked the sub-channel DAB+ already; keep that
        let dabplus = parser
            .subchannels
            .get(&subchid)
            .map_or(false, |sc| sc.dabplus);
        let mut sc = Subchannel {
            id: subchid,
            start_addr,
            dabplus,
            ..Subchannel::default()
        };

        if long_form {
            if pos + 4 > data.len() {
                break;
            }
            let option = data[pos + 2] >> 4 & 0x07;
            let prot_lvl = data[pos + 2] >> 2 & 0x03;
            let size = u16::from(data[pos + 2] & 0x03) << 8 | u16::from(data[pos + 3]);
            let level = prot_lvl + if option != 0 { 4 } else { 0 };
            sc.size = size;
            sc.protection = Protection::Eep { level };
            sc.bitrate_kbps = eep_bitrate(size, level);
            pos += 4;
        } else {
            let table_index = data[pos + 2] & 0x3F;
            sc.protection = Protection::Uep { table_index };
            sc.bitrate_kbps = UEP_BITRATES[usize::from(table_index)];
            pos += 3;
        }
        parser.subchannels.insert(subchid, sc);
    }
}

// FIG 0/2: services and their components.  The PD flag selects 16- or 32-bit SIDs.
fn service_components(parser: &mut FicParser, pd: bool, data: &[u8]) {
    let mut pos = 0;
    let min_service_size = if pd { 5 } else { 3 };
    while pos + min_service_size <= data.len() {
        let sid;
        if pd {
            sid = u32::from(data[pos]) << 24
                | u32::from(data[pos + 1]) << 16
                | u32::from(data[pos + 2]) << 8
                | u32::from(data[pos + 3]);
            pos += 4;
        } else {
            sid = u32::from(data[pos]) << 8 | u32::from(data[pos + 1]);
            pos += 2;
        }
        let num_components = usize::from(data[pos] & 0x0F);
        pos += 1;

        let mut link = ServiceLink::default();
        for _ in 0..num_components {
            if pos + 2 > data.len() {
                break;
            }
            let tmid = data[pos] >> 6 & 0x03;
            let subchid = data[pos + 1] >> 2 & 0x3F;
            let primary = data[pos + 1] & 0x02 != 0;
            match tmid {
                0 => {
                    // MSC stream audio; ASCTy 63 marks HE-AAC (DAB+)
                    let ascty = data[pos] & 0x3F;
                    if let Some(sc) = parser.subchannels.get_mut(&subchid) {
                        sc.dabplus = ascty == 63;
                    }
                    if primary && link.primary.is_none() {
                        link.primary = Some(subchid);
                    } else if link.secondary.is_none() {
                        link.secondary = Some(subchid);
                    }
                }
                1 => {
                    // MSC packet-mode data
                    let dscty = data[pos] & 0x3F;
                    debug!(
                        "FIG 0/2: data service {:#x} subch {} DSCTy {}",
                        sid, subchid, dscty
                    );
                    if primary && link.primary.is_none() {
                        link.primary = Some(subchid);
                    }
                }
                _ => {}
            }
            pos += 2;
        }

        if link.primary.is_some() {
            parser.services.insert(sid, link);
        }
    }
}

// FIG 0/3: packet-mode service components; maps an SCId to the sub-channel the packet
// decoder must read.
fn packet_mode_components(parser: &mut FicParser, data: &[u8]) {
    let mut pos = 0;
    while pos + 5 <= data.len() {
        let scid = u16::from(data[pos] & 0x0F) << 8 | u16::from(data[pos + 1]);
        let scca_flag = data[pos + 2] & 0x10 != 0;
        let dg_flag = data[pos + 2] & 0x08 != 0;
        let dscty = data[pos + 3] & 0x3F;
        let subchid = data[pos + 4] & 0x3F;
        pos += 5;
        if scca_flag {
            if pos + 2 > data.len() {
                break;
            }
            pos += 2;
        }
        debug!(
            "FIG 0/3: SCId {} -> subch {} DSCTy {} DG {}",
            scid, subchid, dscty, dg_flag
        );
        parser.packet_mode.insert(
            scid,
            PacketModeInfo {
                subchid,
                dscty,
                dg_flag,
            },
        );
    }
}

// FIG 0/8: service component global definition, linking components to sub-channels
// (short form) or SCIds (long form).
fn component_global_definition(_parser: &mut FicParser, pd: bool, data: &[u8]) {
    let mut pos = 0;
    while pos < data.len() {
        let sid;
        if pd {
            if pos + 4 > data.len() {
                break;
            }
            sid = u32::from(data[pos]) << 24
                | u32::from(data[pos + 1]) << 16
                | u32::from(data[pos + 2]) << 8
                | u32::from(data[pos + 3]);
            pos += 4;
        } else {
            if pos + 2 > data.len() {
                break;
            }
            sid = u32::from(data[pos]) << 8 | u32::from(data[pos + 1]);
            pos += 2;
        }
        if pos >= data.len() {
            break;
        }
        let ext_flag = data[pos] & 0x80 != 0;
        let scids = data[pos] & 0x0F;
        pos += 1;
        if pos >= data.len() {
            break;
        }
        let long_form = data[pos] & 0x80 != 0;
        if long_form {
            if pos + 2 > data.len() {
                break;
            }
            let scid = u16::from(data[pos] & 0x0F) << 8 | u16::from(data[pos + 1]);
            debug!("FIG 0/8: service {:#x} SCIdS {} -> SCId {}", sid, scids, scid);
            pos += 2;
        } else {
            let subchid = data[pos] & 0x3F;
            debug!(
                "FIG 0/8: service {:#x} SCIdS {} -> subch {}",
                sid, scids, subchid
            );
            pos += 1;
        }
        if ext_flag && pos < data.len() {
            pos += 1; // Rfa
        }
    }
}

fn user_application_name(ua_type: u16) -> &'static str {
    match ua_type {
        0x002 => "SlideShow",
        0x003 => "BWS",
        0x004 => "TPEG",
        0x005 => "DGPS",
        0x006 => "TMC",
        0x007 => "EPG",
        0x008 => "DABJava",
        0x009 => "DMB",
        0x00a => "IPDC",
        0x00b => "Voice",
        0x00c => "Middleware",
        0x00d => "Filecasting",
        0x44a => "Journaline",
        _ => "unknown",
    }
}

// FIG 0/13: which data applications (EPG, SlideShow, ...) a service carries.
fn user_applications(parser: &mut FicParser, pd: bool, data: &[u8]) {
    let mut pos = 0;
    while pos < data.len() {
        let sid;
        if pd {
            if pos + 4 > data.len() {
                break;
            }
            sid = u32::from(data[pos]) << 24
                | u32::from(data[pos + 1]) << 16
                | u32::from(data[pos + 2]) << 8
                | u32::from(data[pos + 3]);
            pos += 4;
        } else {
            if pos + 2 > data.len() {
                break;
            }
            sid = u32::from(data[pos]) << 8 | u32::from(data[pos + 1]);
            pos += 2;
        }
        if pos >= data.len() {
            break;
        }
        let num_apps = usize::from(data[pos] & 0x0F);
        pos += 1;

        for _ in 0..num_apps {
            if pos + 2 > data.len() {
                return;
            }
            let ua_word = u16::from(data[pos]) << 8 | u16::from(data[pos + 1]);
            let ua_type = ua_word >> 5 & 0x7FF;
            let ua_len = usize::from(ua_word & 0x1F);
            pos += 2;
            debug!(
                "FIG 0/13: service {:#x} application {:#x} ({})",
                sid,
                ua_type,
                user_application_name(ua_type)
            );
            let apps = parser.user_applications.entry(sid).or_default();
            if !apps.contains(&ua_type) {
                apps.push(ua_type);
            }
            pos += ua_len;
        }
    }
}
