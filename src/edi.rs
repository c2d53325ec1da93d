//! Decoding of DVB EDI (_ETSI TS 102 821_) packet streams into ETI-NI frames.
//!
//! An EDI stream arrives as UDP payloads holding either AF (Application Framework)
//! packets directly, or PF (Protocol Fragment) packets which reassemble into AF packets.
//! Each AF packet carries a TAG stream; the `*ptr`, `deti` and `est<n>` tags together
//! describe one 24 ms ETI frame, which [`EdiDecoder`](struct.EdiDecoder.html) re-emits in
//! the 6144-byte ETI-NI layout of _ETSI EN 300 799_.

use crate::crc16;
use log::debug;
use std::collections::BTreeMap;

/// The fixed size of an ETI-NI frame.
pub const ETI_NI_FRAME_SIZE: usize = 6144;

/// ERR byte plus FSYNC pattern for odd frames, as a big-endian word.
pub const ETI_NI_FSYNC_ODD: u32 = 0xFFF8_C549;
/// ERR byte plus FSYNC pattern for even frames, as a big-endian word.
pub const ETI_NI_FSYNC_EVEN: u32 = 0xFF07_3AB6;

/// Upper bound on live PF reassembly slots.
const PF_COLLECTOR_LIMIT: usize = 64;
/// Upper bound on the size of one reassembled AF packet.
const PF_PAYLOAD_LIMIT: usize = 65_536;

const AF_HEADER_LEN: usize = 10;
const PF_HEADER_LEN: usize = 14;

fn read_16(p: &[u8]) -> u16 {
    u16::from(p[0]) << 8 | u16::from(p[1])
}
fn read_24(p: &[u8]) -> u32 {
    u32::from(p[0]) << 16 | u32::from(p[1]) << 8 | u32::from(p[2])
}
fn read_32(p: &[u8]) -> u32 {
    u32::from(p[0]) << 24 | u32::from(p[1]) << 16 | u32::from(p[2]) << 8 | u32::from(p[3])
}

/// A complete 6144-byte ETI-NI frame together with its Data Flow Counter value.
pub struct EtiFrame {
    pub data: Box<[u8; ETI_NI_FRAME_SIZE]>,
    /// Data Flow Counter, 0..7999, incrementing once per 24 ms frame.
    pub dflc: u16,
}

/// Parsed PF packet header.
#[derive(Debug, Clone, Copy)]
pub struct PfHeader {
    pub pseq: u16,
    pub findex: u32,
    pub fcount: u32,
    pub fec: bool,
    pub addr: bool,
    pub plen: u16,
}

impl PfHeader {
    /// Parses a PF header, returning `None` unless the magic matches and the declared
    /// payload length fits within the packet.
    pub fn parse(pkt: &[u8]) -> Option<PfHeader> {
        if pkt.len() < PF_HEADER_LEN || pkt[0] != b'P' || pkt[1] != b'F' {
            return None;
        }
        let word = read_16(&pkt[10..]);
        let hdr = PfHeader {
            pseq: read_16(&pkt[2..]),
            findex: read_24(&pkt[4..]),
            fcount: read_24(&pkt[7..]),
            fec: word & 0x8000 != 0,
            addr: word & 0x4000 != 0,
            plen: word & 0x3FFF,
        };
        if usize::from(hdr.plen) > pkt.len() - PF_HEADER_LEN {
            debug!(
                "PF plen {} exceeds available {}",
                hdr.plen,
                pkt.len() - PF_HEADER_LEN
            );
            return None;
        }
        Some(hdr)
    }

    fn payload_offset(&self) -> usize {
        // fixed part, optional FEC / address words, then the 2-byte header CRC
        12 + if self.fec { 2 } else { 0 } + if self.addr { 4 } else { 0 } + 2
    }
}

#[derive(Default)]
struct PfCollector {
    fcount: u32,
    collected: u32,
    accumulated: usize,
    processed: bool,
    fragments: BTreeMap<u32, Vec<u8>>,
}

/// Collects PF fragments, keyed by packet sequence number, until a whole AF packet can be
/// produced.
///
/// Slots are bounded: at most 64 live sequence numbers, each reassembling at most 64 KiB.
#[derive(Default)]
pub struct PfReassembler {
    collectors: BTreeMap<u16, PfCollector>,
}

impl PfReassembler {
    pub fn new() -> PfReassembler {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.collectors.clear();
    }

    /// Adds one fragment.  Returns the reassembled AF packet once every fragment of the
    /// sequence has arrived; duplicate fragment indices are absorbed without effect.
    pub fn add_fragment(&mut self, hdr: &PfHeader, pkt: &[u8]) -> Option<Vec<u8>> {
        let offset = hdr.payload_offset();
        let plen = usize::from(hdr.plen);
        if pkt.len() < offset + plen {
            return None;
        }
        let payload = &pkt[offset..offset + plen];

        if self.collectors.len() >= PF_COLLECTOR_LIMIT
            && !self.collectors.contains_key(&hdr.pseq)
        {
            // shed the oldest slot rather than grow without bound
            let oldest = *self.collectors.keys().next().unwrap();
            self.collectors.remove(&oldest);
        }
        let c = self.collectors.entry(hdr.pseq).or_default();

        // a fresh slot, or one left over from an earlier pass through this Pseq value
        if c.fcount == 0 || c.processed {
            c.fcount = hdr.fcount;
            c.collected = 0;
            c.accumulated = 0;
            c.processed = false;
            c.fragments.clear();
        }

        if hdr.findex >= c.fcount || c.fragments.contains_key(&hdr.findex) {
            return None;
        }
        if c.accumulated + plen > PF_PAYLOAD_LIMIT {
            debug!("PF Pseq {} exceeds reassembly size limit", hdr.pseq);
            self.collectors.remove(&hdr.pseq);
            return None;
        }
        c.fragments.insert(hdr.findex, payload.to_vec());
        c.accumulated += plen;
        c.collected += 1;

        if c.collected < c.fcount {
            return None;
        }
        c.processed = true;
        let mut af = Vec::with_capacity(c.accumulated);
        for i in 0..c.fcount {
            af.extend_from_slice(c.fragments.get(&i)?);
        }
        self.cleanup();
        Some(af)
    }

    fn cleanup(&mut self) {
        if self.collectors.len() > 16 {
            let done: Vec<u16> = self
                .collectors
                .iter()
                .filter(|(_, c)| c.processed)
                .map(|(&pseq, _)| pseq)
                .collect();
            for pseq in done {
                if self.collectors.len() <= 8 {
                    break;
                }
                self.collectors.remove(&pseq);
            }
        }
    }
}

#[derive(Default, Clone)]
struct StreamCharacterisation {
    scid: u8,
    sad: u16,
    tpl: u8,
    mst: Vec<u8>,
}

/// Decodes an EDI packet stream (AF packets, or PF fragments thereof) and assembles
/// ETI-NI frames.
///
/// One decoder instance serves one logical stream; feed it each UDP payload in arrival
/// order.
pub struct EdiDecoder {
    pf: PfReassembler,
    // frame state from the current tag packet
    is_eti: bool,
    fc_valid: bool,
    tsta: u32,
    ficf: bool,
    nst: usize,
    dflc: u16,
    mid: u8,
    fp: u8,
    mnsc: u16,
    rfu: u16,
    fic: Vec<u8>,
    stc: Vec<Option<StreamCharacterisation>>,
    // statistics
    af_count: u64,
    crc_fail_count: u64,
}

impl Default for EdiDecoder {
    fn default() -> EdiDecoder {
        EdiDecoder {
            pf: PfReassembler::new(),
            is_eti: false,
            fc_valid: false,
            tsta: 0xFF_FFFF,
            ficf: false,
            nst: 0,
            dflc: 0,
            mid: 0,
            fp: 0,
            mnsc: 0,
            rfu: 0xFFFF,
            fic: Vec::with_capacity(128),
            stc: vec![None; 64],
            af_count: 0,
            crc_fail_count: 0,
        }
    }
}

impl EdiDecoder {
    pub fn new() -> EdiDecoder {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = EdiDecoder::new();
    }

    /// Number of AF packets whose CRC check failed.
    pub fn crc_fail_count(&self) -> u64 {
        self.crc_fail_count
    }

    /// Number of AF packets decoded.
    pub fn af_count(&self) -> u64 {
        self.af_count
    }

    /// Consumes one EDI packet (the payload of one UDP datagram).  Returns a frame when
    /// this packet completed one.
    pub fn feed(&mut self, pkt: &[u8]) -> Option<EtiFrame> {
        if pkt.len() < 2 {
            return None;
        }
        match (pkt[0], pkt[1]) {
            (b'A', b'F') => {
                if self.decode_af(pkt) {
                    self.assemble()
                } else {
                    None
                }
            }
            (b'P', b'F') => {
                let hdr = PfHeader::parse(pkt)?;
                let af = self.pf.add_fragment(&hdr, pkt)?;
                if self.decode_af(&af) {
                    self.assemble()
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn decode_af(&mut self, pkt: &[u8]) -> bool {
        if pkt.len() < AF_HEADER_LEN || pkt[0] != b'A' || pkt[1] != b'F' {
            return false;
        }
        // taglength is carried in BYTES by the deployed encoders, despite the standard
        // calling the field a bit count
        let taglength = read_32(&pkt[2..]) as usize;
        let has_crc = pkt[8] & 0x80 != 0;
        let pt = pkt[9];
        if pt != b'T' {
            debug!("AF payload type {:#x} is not a tag packet", pt);
            return false;
        }
        let total_len = AF_HEADER_LEN + taglength + if has_crc { 2 } else { 0 };
        if pkt.len() < total_len {
            debug!("AF truncated: {} < {}", pkt.len(), total_len);
            return false;
        }
        if has_crc && !crc16::check(&pkt[..total_len]) {
            self.crc_fail_count += 1;
            debug!("AF crc check failed");
            return false;
        }
        self.af_count += 1;
        self.decode_tag_packet(&pkt[AF_HEADER_LEN..AF_HEADER_LEN + taglength]);
        true
    }

    fn decode_tag_packet(&mut self, pkt: &[u8]) {
        self.nst = 0;
        let mut i = 0;
        while i + 8 <= pkt.len() {
            let tag_id = read_32(&pkt[i..]);
            let taglen_bits = read_32(&pkt[i + 4..]) as usize;
            if taglen_bits % 8 != 0 {
                // tag values are byte aligned in practice; treat anything else as a
                // framing error and stop
                break;
            }
            let taglen = taglen_bits / 8;
            if i + 8 + taglen > pkt.len() {
                break;
            }
            let value = &pkt[i + 8..i + 8 + taglen];
            match tag_id {
                0x2A70_7472 => self.decode_starptr(value), // "*ptr"
                0x6465_7469 => self.decode_deti(value),    // "deti"
                id if id & 0xFFFF_FF00 == 0x6573_7400 => {
                    self.decode_est(value, (id & 0xFF) as u8) // "est" + stream index
                }
                _ => {} // unknown tags are skipped
            }
            i += 8 + taglen;
        }
    }

    fn decode_starptr(&mut self, value: &[u8]) {
        if value.len() != 8 {
            return;
        }
        let proto = read_32(value);
        let major = read_16(&value[4..]);
        let minor = read_16(&value[6..]);
        // "DETI"
        self.is_eti = proto == 0x4445_5449 && major == 0 && minor == 0;
    }

    fn decode_deti(&mut self, value: &[u8]) {
        if value.len() < 6 {
            return;
        }
        let deti_header = read_16(value);
        let atstf = deti_header & 0x8000 != 0;
        self.ficf = deti_header & 0x4000 != 0;
        let rfudf = deti_header & 0x2000 != 0;
        let fcth = (deti_header >> 8) & 0x1F;
        let fct = deti_header & 0xFF;
        self.dflc = fcth * 250 + fct;

        let eti_header = read_32(&value[2..]);
        self.mid = (eti_header >> 22 & 0x03) as u8;
        self.fp = (eti_header >> 19 & 0x07) as u8;
        let rfu = eti_header >> 16 & 1 != 0;
        self.mnsc = if rfu { 0xFFFF } else { eti_header as u16 };

        let fic_length = if self.ficf {
            if self.mid == 3 {
                32 * 4
            } else {
                24 * 4
            }
        } else {
            0
        };

        let mut i = 6;
        if atstf {
            // utco byte, 4 seconds bytes, then the 24-bit timestamp
            if value.len() < i + 8 {
                return;
            }
            i += 5;
            self.tsta = read_24(&value[i..]);
            i += 3;
        } else {
            self.tsta = 0xFF_FFFF;
        }

        if self.ficf {
            if value.len() < i + fic_length {
                return;
            }
            self.fic.clear();
            self.fic.extend_from_slice(&value[i..i + fic_length]);
            i += fic_length;
        }

        self.rfu = 0xFFFF;
        if rfudf {
            if value.len() < i + 3 {
                return;
            }
            let rfud = read_24(&value[i..]);
            self.rfu = (rfud >> 8) as u16;
        }

        self.fc_valid = true;
    }

    fn decode_est(&mut self, value: &[u8], n: u8) {
        if value.len() < 3 || n == 0 || n > 64 {
            return;
        }
        let sstc = read_24(value);
        self.stc[usize::from(n) - 1] = Some(StreamCharacterisation {
            scid: (sstc >> 18 & 0x3F) as u8,
            sad: (sstc >> 8 & 0x3FF) as u16,
            tpl: (sstc >> 2 & 0x3F) as u8,
            mst: value[3..].to_vec(),
        });
        self.nst += 1;
    }

    // Lays out the frame state gathered from the current tag packet as a 6144-byte
    // ETI-NI frame.
    fn assemble(&mut self) -> Option<EtiFrame> {
        if !self.is_eti || !self.fc_valid || self.fic.is_empty() {
            return None;
        }
        let fic_len = self.fic.len();
        if (self.mid == 3 && fic_len != 32 * 4) || (self.mid != 3 && fic_len != 24 * 4) {
            debug!("FIC length {} does not match mode {}", fic_len, self.mid);
            return None;
        }
        let nst = self.nst.min(64);
        let mst_total: usize = (0..nst)
            .map(|i| self.stc[i].as_ref().map_or(0, |s| s.mst.len()))
            .sum();
        // SYNC + FC + STC + EOH + FIC + MST + EOF must fit the frame
        if 8 + nst * 4 + 4 + fic_len + mst_total + 8 > ETI_NI_FRAME_SIZE {
            debug!("frame content would exceed {} bytes", ETI_NI_FRAME_SIZE);
            return None;
        }

        let mut eti = Box::new([0x55u8; ETI_NI_FRAME_SIZE]);

        // ERR + FSYNC; the FSYNC pattern alternates with frame-count parity
        let fct = (self.dflc % 250) as u8;
        let sync = if fct % 2 == 1 {
            ETI_NI_FSYNC_ODD
        } else {
            ETI_NI_FSYNC_EVEN
        };
        eti[0..4].copy_from_slice(&sync.to_be_bytes());

        // FC
        eti[4] = fct;
        eti[5] = if self.ficf { 0x80 } else { 0 } | nst as u8;
        let mut fl = (nst + 1 + fic_len / 4) as u16;
        for i in 0..nst {
            if let Some(s) = &self.stc[i] {
                fl += (s.mst.len() / 4) as u16;
            }
        }
        let fp_mid_fl = u16::from(self.fp) << 13 | u16::from(self.mid) << 11 | fl;
        eti[6..8].copy_from_slice(&fp_mid_fl.to_be_bytes());

        // STC
        for i in 0..nst {
            if let Some(s) = &self.stc[i] {
                let stl = (s.mst.len() / 8) as u16;
                let o = 8 + i * 4;
                eti[o] = s.scid << 2 | (s.sad >> 8) as u8 & 0x03;
                eti[o + 1] = s.sad as u8;
                eti[o + 2] = s.tpl << 2 | (stl >> 8) as u8 & 0x03;
                eti[o + 3] = stl as u8;
            }
        }
        let mut idx = 8 + nst * 4;

        // EOH: MNSC then a CRC over FC..MNSC
        eti[idx..idx + 2].copy_from_slice(&self.mnsc.to_be_bytes());
        let eoh_crc = crc16::sum16(&eti[4..idx + 2]);
        eti[idx + 2..idx + 4].copy_from_slice(&eoh_crc.to_be_bytes());
        idx += 4;

        // MST: FIC then each stream's bytes in index order
        let mst_start = idx;
        eti[idx..idx + fic_len].copy_from_slice(&self.fic);
        idx += fic_len;
        for i in 0..nst {
            if let Some(s) = &self.stc[i] {
                eti[idx..idx + s.mst.len()].copy_from_slice(&s.mst);
                idx += s.mst.len();
            }
        }

        // EOF: MST CRC, RFU, then the 24-bit timestamp as TIST
        let mst_crc = crc16::sum16(&eti[mst_start..idx]);
        eti[idx..idx + 2].copy_from_slice(&mst_crc.to_be_bytes());
        eti[idx + 2..idx + 4].copy_from_slice(&self.rfu.to_be_bytes());
        eti[idx + 4..idx + 8].copy_from_slice(&self.tsta.to_be_bytes());

        Some(EtiFrame {
            data: eti,
            dflc: self.dflc,
        })
    }
}

#[cfg(test)]
pub(crate) mod test {
    use crate::crc16;
    use crate::edi::{EdiDecoder, EtiFrame, PfHeader, PfReassembler};

    // ---- fixture builders, shared with other modules' tests ----

    pub(crate) fn mk_tag(id: u32, value: &[u8]) -> Vec<u8> {
        let mut tag = id.to_be_bytes().to_vec();
        tag.extend_from_slice(&((value.len() as u32) * 8).to_be_bytes());
        tag.extend_from_slice(value);
        tag
    }

    pub(crate) fn mk_starptr() -> Vec<u8> {
        let mut value = b"DETI".to_vec();
        value.extend_from_slice(&[0, 0, 0, 0]); // major 0, minor 0
        mk_tag(0x2A70_7472, &value)
    }

    // A deti tag value with FICF set, no timestamp, no RFU descriptor.
    pub(crate) fn mk_deti(fic: &[u8], dflc: u16, mid: u8, mnsc: u16) -> Vec<u8> {
        let fcth = dflc / 250;
        let fct = dflc % 250;
        let deti_header = 0x4000u16 | (fcth << 8) | fct; // FICF only
        let eti_header = u32::from(mid) << 22 | u32::from(mnsc);
        let mut value = deti_header.to_be_bytes().to_vec();
        value.extend_from_slice(&eti_header.to_be_bytes());
        value.extend_from_slice(fic);
        mk_tag(0x6465_7469, &value)
    }

    pub(crate) fn mk_est(n: u8, scid: u8, sad: u16, tpl: u8, mst: &[u8]) -> Vec<u8> {
        let sstc =
            u32::from(scid) << 18 | u32::from(sad) << 8 | u32::from(tpl) << 2;
        let mut value = sstc.to_be_bytes()[1..].to_vec();
        value.extend_from_slice(mst);
        mk_tag(0x6573_7400 | u32::from(n), &value)
    }

    pub(crate) fn mk_af(tags: &[Vec<u8>], with_crc: bool) -> Vec<u8> {
        let tag_packet: Vec<u8> = tags.iter().flatten().copied().collect();
        let mut af = b"AF".to_vec();
        af.extend_from_slice(&(tag_packet.len() as u32).to_be_bytes());
        af.extend_from_slice(&[0, 1]); // sequence number
        af.push(if with_crc { 0x90 } else { 0x10 }); // CRC flag, version
        af.push(b'T');
        af.extend_from_slice(&tag_packet);
        if with_crc {
            let crc = crc16::sum16(&af);
            af.extend_from_slice(&crc.to_be_bytes());
        }
        af
    }

    // Splits an AF packet into `n` PF fragments under the given sequence number.
    pub(crate) fn mk_pf_fragments(af: &[u8], pseq: u16, n: usize) -> Vec<Vec<u8>> {
        let chunk = (af.len() + n - 1) / n;
        af.chunks(chunk)
            .enumerate()
            .map(|(findex, payload)| {
                let mut pf = b"PF".to_vec();
                pf.extend_from_slice(&pseq.to_be_bytes());
                pf.extend_from_slice(&(findex as u32).to_be_bytes()[1..]);
                pf.extend_from_slice(&(n as u32).to_be_bytes()[1..]);
                pf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                pf.extend_from_slice(&[0, 0]); // header CRC, not validated
                pf.extend_from_slice(payload);
                pf
            })
            .collect()
    }

    // An AF packet describing one frame with a FIC and a single MSC stream.
    pub(crate) fn mk_eti_af(fic: &[u8], dflc: u16, mst: &[u8]) -> Vec<u8> {
        mk_af(
            &[
                mk_starptr(),
                mk_deti(fic, dflc, 1, 0x1234),
                mk_est(1, 5, 0, 0x21, mst),
            ],
            true,
        )
    }

    fn decode_one(af: &[u8]) -> Option<EtiFrame> {
        let mut decoder = EdiDecoder::new();
        decoder.feed(af)
    }

    // ---- tests ----

    #[test]
    fn assembles_frame_from_af() {
        let fic = [0xA5u8; 96];
        let mst = [0x3Cu8; 64];
        let frame = decode_one(&mk_eti_af(&fic, 123, &mst)).expect("frame");
        assert_eq!(frame.dflc, 123);
        let eti = &frame.data[..];
        // dflc 123 -> fct 123, odd parity sync
        assert_eq!(&eti[0..4], &[0xFF, 0xF8, 0xC5, 0x49]);
        assert_eq!(eti[4], 123);
        assert_eq!(eti[5], 0x80 | 1); // FICF + NST=1
        let fl = (u16::from(eti[6]) << 8 | u16::from(eti[7])) & 0x7FF;
        // FL*4 = NST*4 + 4 (EOH) + FIC + MST
        assert_eq!(usize::from(fl) * 4, 4 + 4 + fic.len() + mst.len());
        // STC for stream 1
        assert_eq!(eti[8] >> 2, 5); // SCID
        let stl = (u16::from(eti[10]) & 0x03) << 8 | u16::from(eti[11]);
        assert_eq!(usize::from(stl) * 8, mst.len());
    }

    #[test]
    fn eoh_and_mst_crcs_verify() {
        let fic = [0x11u8; 96];
        let mst = [0x22u8; 32];
        let frame = decode_one(&mk_eti_af(&fic, 4, &mst)).expect("frame");
        let eti = &frame.data[..];
        let nst = usize::from(eti[5] & 0x7F);
        let eoh = 8 + nst * 4;
        assert!(crc16::check(&eti[4..eoh + 4]));
        let mst_start = eoh + 4;
        let mst_end = mst_start + fic.len() + mst.len();
        assert_eq!(
            crc16::sum16(&eti[mst_start..mst_end]),
            u16::from(eti[mst_end]) << 8 | u16::from(eti[mst_end + 1])
        );
        // remainder is 0x55 padding after the 8-byte EOF
        assert!(eti[mst_end + 8..].iter().all(|&b| b == 0x55));
    }

    #[test]
    fn even_dflc_selects_even_sync() {
        let frame = decode_one(&mk_eti_af(&[0u8; 96], 250, &[])).expect("frame");
        // dflc 250 -> fct 0, even
        assert_eq!(&frame.data[0..4], &[0xFF, 0x07, 0x3A, 0xB6]);
    }

    #[test]
    fn af_crc_failure_discards() {
        let mut af = mk_eti_af(&[0u8; 96], 1, &[0u8; 8]);
        let len = af.len();
        af[len - 1] ^= 0xFF;
        let mut decoder = EdiDecoder::new();
        assert!(decoder.feed(&af).is_none());
        assert_eq!(decoder.crc_fail_count(), 1);
    }

    #[test]
    fn unknown_tags_are_skipped() {
        let fic = [0x55u8; 96];
        let af = mk_af(
            &[
                mk_tag(0x64_6D_6D_79, b"opaque"), // unrecognised tag first
                mk_starptr(),
                mk_deti(&fic, 9, 1, 0),
            ],
            true,
        );
        assert!(decode_one(&af).is_some());
    }

    #[test]
    fn non_byte_aligned_tag_length_stops_parse() {
        let fic = [0x55u8; 96];
        let mut bad_tag = 0x6161_6161u32.to_be_bytes().to_vec();
        bad_tag.extend_from_slice(&13u32.to_be_bytes()); // 13 bits
        bad_tag.extend_from_slice(&[0xFF, 0xFF]);
        let af = mk_af(&[bad_tag, mk_starptr(), mk_deti(&fic, 9, 1, 0)], true);
        // parsing stopped before the deti tag, so no frame can be assembled
        assert!(decode_one(&af).is_none());
    }

    #[test]
    fn fic_length_must_match_mode() {
        // mode 3 expects a 128-byte FIC; a 96-byte one must be rejected
        let af = mk_af(&[mk_starptr(), mk_deti(&[0u8; 96], 9, 3, 0)], true);
        assert!(decode_one(&af).is_none());
        let af = mk_af(&[mk_starptr(), mk_deti(&[0u8; 128], 9, 3, 0)], true);
        assert!(decode_one(&af).is_some());
    }

    #[test]
    fn pf_reassembly_any_order() {
        let af = mk_eti_af(&[0x77u8; 96], 55, &[0x44; 40]);
        let frags = mk_pf_fragments(&af, 1000, 4);

        // reference: in-order
        let mut r = PfReassembler::new();
        let mut in_order = None;
        for f in &frags {
            let hdr = PfHeader::parse(f).unwrap();
            if let Some(af) = r.add_fragment(&hdr, f) {
                in_order = Some(af);
            }
        }
        let in_order = in_order.expect("reassembly should complete");
        assert_eq!(in_order, af);

        // reversed order, with a duplicate thrown in
        let mut r = PfReassembler::new();
        let mut out_of_order = None;
        let mut sequence: Vec<&Vec<u8>> = frags.iter().rev().collect();
        sequence.insert(2, &frags[3]); // duplicate findex
        for f in sequence {
            let hdr = PfHeader::parse(f).unwrap();
            if let Some(af) = r.add_fragment(&hdr, f) {
                assert!(out_of_order.is_none());
                out_of_order = Some(af);
            }
        }
        assert_eq!(out_of_order.expect("reassembly should complete"), af);
    }

    #[test]
    fn pf_pseq_slot_reuse() {
        let af_a = mk_eti_af(&[0x01u8; 96], 1, &[]);
        let af_b = mk_eti_af(&[0x02u8; 96], 2, &[]);
        let mut r = PfReassembler::new();
        for f in mk_pf_fragments(&af_a, 42, 3) {
            let hdr = PfHeader::parse(&f).unwrap();
            r.add_fragment(&hdr, &f);
        }
        // the same Pseq arrives again (wrapped around): slot must reinitialise
        let mut result = None;
        for f in mk_pf_fragments(&af_b, 42, 3) {
            let hdr = PfHeader::parse(&f).unwrap();
            if let Some(af) = r.add_fragment(&hdr, &f) {
                result = Some(af);
            }
        }
        assert_eq!(result.unwrap(), af_b);
    }

    #[test]
    fn pf_plen_bounds_checked() {
        let mut pf = b"PF".to_vec();
        pf.extend_from_slice(&[0, 1]); // pseq
        pf.extend_from_slice(&[0, 0, 0]); // findex
        pf.extend_from_slice(&[0, 0, 1]); // fcount
        pf.extend_from_slice(&[0x3F, 0xFF]); // plen = 0x3FFF, far beyond the packet
        pf.extend_from_slice(&[0, 0]); // hcrc
        pf.extend_from_slice(&[0xAA; 10]);
        assert!(PfHeader::parse(&pf).is_none());
    }

    #[test]
    fn collector_count_stays_bounded() {
        let mut r = PfReassembler::new();
        for pseq in 0..200u16 {
            // first fragment of a 2-fragment sequence that never completes
            let mut pf = b"PF".to_vec();
            pf.extend_from_slice(&pseq.to_be_bytes());
            pf.extend_from_slice(&[0, 0, 0]); // findex 0
            pf.extend_from_slice(&[0, 0, 2]); // fcount 2
            pf.extend_from_slice(&[0, 4]); // plen 4
            pf.extend_from_slice(&[0, 0]); // hcrc
            pf.extend_from_slice(&[1, 2, 3, 4]);
            let hdr = PfHeader::parse(&pf).unwrap();
            r.add_fragment(&hdr, &pf);
            assert!(r.collectors.len() <= 64);
        }
    }
}
