//! FIG type 1 extensions: ensemble and programme service labels.
//!
//! Labels are 16 bytes of ISO 8859-1 padded with spaces, followed (for services) by a
//! character-flag field this parser does not use.

use super::FicParser;
use crate::charset;
use log::debug;

pub(super) fn process(parser: &mut FicParser, ext: u8, data: &[u8]) {
    match ext {
        0 => ensemble_label(parser, data),
        1 => service_label(parser, data),
        // other label types (region, component, data service) are not needed
        _ => {}
    }
}

fn ensemble_label(parser: &mut FicParser, data: &[u8]) {
    if data.len() < 18 {
        return;
    }
    parser.eid = u16::from(data[0]) << 8 | u16::from(data[1]);
    let label = charset::label(&data[2..18]);
    if parser.ensemble_label != label {
        debug!("FIG 1/0: ensemble {:#06x} '{}'", parser.eid, label);
        parser.ensemble_label = label;
    }
}

fn service_label(parser: &mut FicParser, data: &[u8]) {
    // 2-byte SID, 16-byte label, 2-byte character flags
    if data.len() < 20 {
        return;
    }
    let sid = u32::from(data[0]) << 8 | u32::from(data[1]);
    let label = charset::label(&data[2..18]);
    if parser.service_labels.get(&sid) != Some(&label) {
        debug!("FIG 1/1: service {:#06x} '{}'", sid, label);
        parser.service_labels.insert(sid, label);
    }
}
