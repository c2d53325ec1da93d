//! Recovery of ETI-NI frames from an ETI-NA bit-stream (_ETSI EN 300 799_ with E1/G.704
//! interleaving), as found on satellite DAB feeds.
//!
//! The stream arrives as the payload of TS packets that never set the payload-unit-start
//! flag.  Four stages run in sequence,
//!
//!  1. strip the run of `0xFF` padding bytes that precedes the useful data in every
//!     payload (the run length is learned from the first few payloads);
//!  2. find E1 frame alignment: 32-byte frames whose first byte, masked with `0x7F`,
//!     equals `0x1B` on every other frame, at one of 8 bit offsets and either signal
//!     polarity;
//!  3. gather aligned frames into 192-frame multiframes (8 frames per block, 8 blocks per
//!     superblock, 3 superblocks), aligned by the block/superblock numbering in each
//!     frame's management byte;
//!  4. deinterleave each multiframe into one 6144-byte ETI-NI frame.

use crate::edi::ETI_NI_FRAME_SIZE;
use log::debug;
use std::collections::VecDeque;

const E1_FRAME_SIZE: usize = 32;
const E1_SYNC_VAL: u8 = 0x1B;
const E1_SYNC_MASK: u8 = 0x7F;
// the sync byte appears on every other frame
const E1_SYNC_INTERVAL: usize = E1_FRAME_SIZE * 2;
const FRAMES_IN_BLOCK: usize = 8;
const BLOCKS_IN_SUPERBLOCK: usize = 8;
const SUPERBLOCKS_IN_MULTIFRAME: usize = 3;
const FRAMES_IN_MULTIFRAME: usize =
    FRAMES_IN_BLOCK * BLOCKS_IN_SUPERBLOCK * SUPERBLOCKS_IN_MULTIFRAME;
const INTERLEAVE_ROWS: usize = 8;
const INTERLEAVE_COLS: usize = 240;
const SUPERBLOCK_SIZE: usize = FRAMES_IN_BLOCK * BLOCKS_IN_SUPERBLOCK * E1_FRAME_SIZE;

/// Payloads examined before the padding length is taken as settled.
const OFFSET_DETECTION_PACKET_COUNT: u32 = 5;

/// How the E1 alignment of a stream was recovered; reported once a stream starts
/// producing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EtiNaDetection {
    /// Leading `0xFF` bytes stripped from every payload (typically 12).
    pub padding_bytes: u8,
    /// Bit position at which E1 sync was found (0..7).
    pub bit_offset: u8,
    /// True when the signal is inverted.
    pub inverted: bool,
}

// Stage 1: learn the padding run length, then strip it from every payload.
struct PaddingStrip {
    packet_count: u32,
    min_ff_count: usize,
    detected: Option<usize>,
}

impl PaddingStrip {
    fn new() -> PaddingStrip {
        PaddingStrip {
            packet_count: 0,
            min_ff_count: 255,
            detected: None,
        }
    }

    fn feed<'a>(&mut self, payload: &'a [u8]) -> Option<&'a [u8]> {
        if let Some(offset) = self.detected {
            return payload.get(offset..);
        }
        let ff_count = payload.iter().take_while(|&&b| b == 0xFF).count();
        self.min_ff_count = self.min_ff_count.min(ff_count);
        self.packet_count += 1;
        if self.packet_count >= OFFSET_DETECTION_PACKET_COUNT {
            self.detected = Some(self.min_ff_count);
            return payload.get(self.min_ff_count..);
        }
        None
    }
}

// Stage 2: bit-level search for E1 frame alignment, then emission of aligned frames.
struct E1Sync {
    buffer: Vec<u8>,
    bit_offset: u8,
    inverted: bool,
    synced: bool,
}

impl E1Sync {
    fn new() -> E1Sync {
        E1Sync {
            buffer: Vec::with_capacity(8192),
            bit_offset: 0,
            inverted: false,
            synced: false,
        }
    }

    fn extract_byte(buf: &[u8], pos: usize, bit_offset: u8, inverted: bool) -> u8 {
        let mut b = if bit_offset == 0 {
            buf[pos]
        } else if pos + 1 < buf.len() {
            buf[pos] << bit_offset | buf[pos + 1] >> (8 - bit_offset)
        } else {
            0
        };
        if inverted {
            b ^= 0xFF;
        }
        b
    }

    fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        if !self.synced {
            self.search();
        }
    }

    fn search(&mut self) {
        // four consecutive sync positions confirm a candidate
        let bytes_needed = E1_SYNC_INTERVAL * 4 + 1;
        if self.buffer.len() < bytes_needed {
            return;
        }
        for bit_offset in 0..8u8 {
            for &inverted in &[false, true] {
                for start in 0..1024usize {
                    if start + bytes_needed >= self.buffer.len() {
                        break;
                    }
                    let all_sync = (0..4).all(|frame| {
                        let pos = start + frame * E1_SYNC_INTERVAL;
                        Self::extract_byte(&self.buffer, pos, bit_offset, inverted)
                            & E1_SYNC_MASK
                            == E1_SYNC_VAL
                    });
                    if all_sync {
                        self.synced = true;
                        self.bit_offset = bit_offset;
                        self.inverted = inverted;
                        self.buffer.drain(..start);
                        debug!(
                            "E1 sync at +{} bit_offset={} inverted={}",
                            start, bit_offset, inverted
                        );
                        return;
                    }
                }
            }
        }
        // no alignment in this window; let the oldest half go
        if self.buffer.len() > 8192 {
            self.buffer.drain(..4096);
        }
    }

    fn next_frame(&mut self) -> Option<[u8; E1_FRAME_SIZE]> {
        if !self.synced || self.buffer.len() < E1_FRAME_SIZE + 1 {
            return None;
        }
        let mut frame = [0u8; E1_FRAME_SIZE];
        for (i, b) in frame.iter_mut().enumerate() {
            *b = Self::extract_byte(&self.buffer, i, self.bit_offset, self.inverted);
        }
        self.buffer.drain(..E1_FRAME_SIZE);
        Some(frame)
    }
}

// Stage 3: accumulate aligned frames and cut multiframes on the management-byte pattern.
struct MultiframeAccumulator {
    frames: Vec<u8>,
    synced: bool,
}

impl MultiframeAccumulator {
    fn new() -> MultiframeAccumulator {
        MultiframeAccumulator {
            frames: Vec::with_capacity((FRAMES_IN_MULTIFRAME + FRAMES_IN_BLOCK) * E1_FRAME_SIZE),
            synced: false,
        }
    }

    fn push_frame(&mut self, frame: &[u8; E1_FRAME_SIZE]) {
        self.frames.extend_from_slice(frame);
    }

    // Returns true when a whole multiframe is waiting at the front of the buffer.
    fn multiframe_ready(&mut self) -> bool {
        let frames_needed = FRAMES_IN_MULTIFRAME + FRAMES_IN_BLOCK;
        if self.frames.len() < frames_needed * E1_FRAME_SIZE {
            return false;
        }
        if !self.synced {
            self.search();
            if !self.synced {
                // shed a block's worth so the buffer cannot grow unchecked
                if self.frames.len() > FRAMES_IN_BLOCK * E1_FRAME_SIZE * 2 {
                    self.frames.drain(..FRAMES_IN_BLOCK * E1_FRAME_SIZE);
                }
                return false;
            }
        }
        self.frames.len() >= FRAMES_IN_MULTIFRAME * E1_FRAME_SIZE
    }

    fn search(&mut self) {
        let max_search = FRAMES_IN_BLOCK * BLOCKS_IN_SUPERBLOCK;
        for frame_offset in 0..max_search {
            let valid = (0..BLOCKS_IN_SUPERBLOCK).all(|block| {
                let frame_idx = frame_offset + block * FRAMES_IN_BLOCK;
                let mgmt_pos = frame_idx * E1_FRAME_SIZE + 1;
                if mgmt_pos >= self.frames.len() {
                    return false;
                }
                let mgmt = self.frames[mgmt_pos];
                let block_num = usize::from(mgmt >> 5 & 0x07);
                let superblock_num = mgmt >> 3 & 0x03;
                block_num == block && superblock_num == 0
            });
            if valid {
                self.frames.drain(..frame_offset * E1_FRAME_SIZE);
                self.synced = true;
                return;
            }
        }
    }

    fn take_multiframe(&mut self) -> Vec<u8> {
        self.frames
            .drain(..FRAMES_IN_MULTIFRAME * E1_FRAME_SIZE)
            .collect()
    }
}

// Stage 4: deinterleave one multiframe into an ETI-NI frame.
struct Deinterleaver {
    even_frame: bool,
}

impl Deinterleaver {
    // ETI-NI sync words as stored little-endian by this stage
    const FSYNC_EVEN: u32 = 0xb63a_07ff;
    const FSYNC_ODD: u32 = 0x49c5_f8ff;

    fn new() -> Deinterleaver {
        Deinterleaver { even_frame: true }
    }

    fn deinterleave(&mut self, multiframe: &[u8], out: &mut [u8; ETI_NI_FRAME_SIZE]) {
        let sync = if self.even_frame {
            Self::FSYNC_EVEN
        } else {
            Self::FSYNC_ODD
        };
        out[0..4].copy_from_slice(&sync.to_le_bytes());

        // gather the three superblocks into row-major form, skipping the framing byte
        // that occupies every 16th input position
        let mut deint = vec![0u8; INTERLEAVE_ROWS * INTERLEAVE_COLS * SUPERBLOCKS_IN_MULTIFRAME];
        for sb in 0..SUPERBLOCKS_IN_MULTIFRAME {
            let superblock = &multiframe[sb * SUPERBLOCK_SIZE..(sb + 1) * SUPERBLOCK_SIZE];
            let dst = &mut deint[sb * INTERLEAVE_ROWS * INTERLEAVE_COLS..];
            let mut in_ptr = 0;
            for col in 0..INTERLEAVE_COLS {
                for row in 0..INTERLEAVE_ROWS {
                    if in_ptr % 16 == 0 {
                        in_ptr += 1;
                    }
                    dst[col + row * INTERLEAVE_COLS] = superblock[in_ptr];
                    in_ptr += 1;
                }
            }
        }

        // the M01 byte's type bit governs how much of each row is meaningful; it can
        // change between multiframes, so it is re-read here every time
        let type_bit = deint[30] >> 1 & 0x01;
        let max_read = if type_bit == 1 { 226 } else { 235 };

        let mut out_pos = 4;
        for row in 0..INTERLEAVE_ROWS * SUPERBLOCKS_IN_MULTIFRAME {
            let row_data = &deint[row * INTERLEAVE_COLS..(row + 1) * INTERLEAVE_COLS];
            if row % INTERLEAVE_ROWS < 2 {
                // the first two rows of each superblock interleave a management byte at
                // the head of every 30-byte segment
                let mut read_ptr = 0;
                while read_ptr < max_read {
                    let mut to_read = 29;
                    if read_ptr + to_read > max_read {
                        to_read = max_read - read_ptr - 1;
                    }
                    read_ptr += 1;
                    out[out_pos..out_pos + to_read]
                        .copy_from_slice(&row_data[read_ptr..read_ptr + to_read]);
                    out_pos += to_read;
                    read_ptr += to_read;
                }
            } else {
                out[out_pos..out_pos + max_read].copy_from_slice(&row_data[..max_read]);
                out_pos += max_read;
            }
        }
        for b in &mut out[out_pos..] {
            *b = 0x55;
        }
        self.even_frame = !self.even_frame;
    }
}

/// The composed four-stage pipeline.  Feed TS packet payloads (adaptation field already
/// stripped); drain recovered ETI-NI frames from [`pop_frame()`](#method.pop_frame).
pub struct EtinaPipeline {
    padding: PaddingStrip,
    e1: E1Sync,
    multiframe: MultiframeAccumulator,
    deint: Deinterleaver,
    frames: VecDeque<Box<[u8; ETI_NI_FRAME_SIZE]>>,
}

impl Default for EtinaPipeline {
    fn default() -> EtinaPipeline {
        EtinaPipeline {
            padding: PaddingStrip::new(),
            e1: E1Sync::new(),
            multiframe: MultiframeAccumulator::new(),
            deint: Deinterleaver::new(),
            frames: VecDeque::new(),
        }
    }
}

impl EtinaPipeline {
    pub fn new() -> EtinaPipeline {
        Self::default()
    }

    /// Consumes one TS packet payload.
    pub fn feed(&mut self, payload: &[u8]) {
        let stripped = match self.padding.feed(payload) {
            Some(s) => s,
            None => return,
        };
        self.e1.feed(stripped);
        while let Some(frame) = self.e1.next_frame() {
            self.multiframe.push_frame(&frame);
            if self.multiframe.multiframe_ready() {
                let mf = self.multiframe.take_multiframe();
                let mut out = Box::new([0u8; ETI_NI_FRAME_SIZE]);
                self.deint.deinterleave(&mf, &mut out);
                self.frames.push_back(out);
            }
        }
    }

    /// Takes the next recovered ETI-NI frame off the queue.
    pub fn pop_frame(&mut self) -> Option<Box<[u8; ETI_NI_FRAME_SIZE]>> {
        self.frames.pop_front()
    }

    /// The detection parameters, once E1 alignment has been found.
    pub fn detection(&self) -> Option<EtiNaDetection> {
        if !self.e1.synced {
            return None;
        }
        Some(EtiNaDetection {
            padding_bytes: self.padding.detected.unwrap_or(0) as u8,
            bit_offset: self.e1.bit_offset,
            inverted: self.e1.inverted,
        })
    }

    /// Bytes waiting in the bit-sync search buffer.  A stream that accumulates a large
    /// amount here without ever synchronising is not ETI-NA and can be abandoned.
    pub fn sync_buffer_len(&self) -> usize {
        self.e1.buffer.len()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use crate::edi::ETI_NI_FRAME_SIZE;
    use crate::etina::{EtiNaDetection, EtinaPipeline};

    // ---- inverse-transform builders, shared with the scanner's end-to-end tests ----

    // Lays an ETI-NI frame's content (bytes 4..) out as the 24 deinterleave rows, with
    // management slots holding the block/superblock numbering stage 3 aligns on.
    // Row layout matches max_read=235 (M01 type bit clear).
    fn content_to_rows(eti: &[u8; ETI_NI_FRAME_SIZE]) -> Vec<[u8; 240]> {
        let max_read = 235;
        let mut rows = vec![[0u8; 240]; 24];
        let mut src = 4;
        for (row_idx, row) in rows.iter_mut().enumerate() {
            let sb = row_idx / 8;
            if row_idx % 8 < 2 {
                let mut write_ptr = 0;
                while write_ptr < max_read {
                    let mut to_write = 29;
                    if write_ptr + to_write > max_read {
                        to_write = max_read - write_ptr - 1;
                    }
                    // management slot at the head of each 30-byte segment
                    let block = write_ptr / 30;
                    row[write_ptr] = if row_idx % 8 == 0 {
                        ((block as u8) << 5) | ((sb as u8) << 3)
                    } else {
                        0x06 // filler; type bit clear
                    };
                    write_ptr += 1;
                    row[write_ptr..write_ptr + to_write]
                        .copy_from_slice(&eti[src..src + to_write]);
                    src += to_write;
                    write_ptr += to_write;
                }
            } else {
                row[..max_read].copy_from_slice(&eti[src..src + max_read]);
                src += max_read;
            }
        }
        rows
    }

    // Interleaves rows back into a 6144-byte multiframe, inserting the E1 framing bytes
    // stage 4 skips (sync on even frames).
    fn rows_to_multiframe(rows: &[[u8; 240]]) -> Vec<u8> {
        let mut multiframe = vec![0u8; 3 * 2048];
        for sb in 0..3 {
            let superblock = &mut multiframe[sb * 2048..(sb + 1) * 2048];
            let mut in_ptr = 0;
            for col in 0..240 {
                for row in 0..8 {
                    if in_ptr % 16 == 0 {
                        superblock[in_ptr] = if in_ptr % 64 == 0 { 0x1B } else { 0x75 };
                        in_ptr += 1;
                    }
                    superblock[in_ptr] = rows[sb * 8 + row][col];
                    in_ptr += 1;
                }
            }
        }
        multiframe
    }

    // Re-encodes an aligned byte stream at bit offset 3 with inverted polarity.
    fn shift3_invert(aligned: &[u8]) -> Vec<u8> {
        let inv: Vec<u8> = aligned.iter().map(|&b| b ^ 0xFF).collect();
        let mut out = Vec::with_capacity(inv.len() + 1);
        out.push(inv[0] >> 3);
        for i in 1..inv.len() {
            out.push(inv[i - 1] << 5 | inv[i] >> 3);
        }
        out.push(inv[inv.len() - 1] << 5);
        out
    }

    // A transmitted ETI-NA byte stream carrying the given ETI-NI frames, at bit offset 3,
    // inverted.
    pub(crate) fn build_transmitted(frames: &[&[u8; ETI_NI_FRAME_SIZE]]) -> Vec<u8> {
        let mut aligned = vec![];
        for frame in frames {
            aligned.extend_from_slice(&rows_to_multiframe(&content_to_rows(frame)));
        }
        shift3_invert(&aligned)
    }

    // Splits a transmitted stream into TS packet payloads with the given 0xFF padding.
    pub(crate) fn paddedize(stream: &[u8], padding: usize, payload_size: usize) -> Vec<Vec<u8>> {
        let data_per_packet = payload_size - padding;
        stream
            .chunks(data_per_packet)
            .map(|chunk| {
                let mut payload = vec![0xFFu8; padding];
                payload.extend_from_slice(chunk);
                while payload.len() < payload_size {
                    payload.push(0x00);
                }
                payload
            })
            .collect()
    }

    fn mk_content_frame(fill: u8) -> Box<[u8; ETI_NI_FRAME_SIZE]> {
        let mut frame = Box::new([0x55u8; ETI_NI_FRAME_SIZE]);
        frame[0..4].copy_from_slice(&[0xFF, 0x07, 0x3A, 0xB6]);
        for (i, b) in frame[4..600].iter_mut().enumerate() {
            *b = fill.wrapping_add(i as u8);
        }
        frame
    }

    #[test]
    fn recovers_frames_with_bit_offset_and_inversion() {
        let a = mk_content_frame(0x10);
        let b = mk_content_frame(0x80);
        // alternate the two contents; the pipeline loses some leading multiframes to
        // padding detection and multiframe alignment, so assertions key off content
        let mut sequence: Vec<&[u8; ETI_NI_FRAME_SIZE]> = vec![];
        for _ in 0..6 {
            sequence.push(&a);
            sequence.push(&b);
        }
        let stream = build_transmitted(&sequence);
        let mut pipeline = EtinaPipeline::new();
        for payload in paddedize(&stream, 12, 184) {
            pipeline.feed(&payload);
        }
        assert_eq!(
            pipeline.detection(),
            Some(EtiNaDetection {
                padding_bytes: 12,
                bit_offset: 3,
                inverted: true,
            })
        );
        let mut recovered = vec![];
        while let Some(frame) = pipeline.pop_frame() {
            recovered.push(frame);
        }
        assert!(recovered.len() >= 2, "only {} frames out", recovered.len());
        for (i, frame) in recovered.iter().enumerate() {
            // the deinterleaver alternates its own sync words, 'even' first
            let expected_sync: &[u8] = if i % 2 == 0 {
                &[0xFF, 0x07, 0x3A, 0xB6]
            } else {
                &[0xFF, 0xF8, 0xC5, 0x49]
            };
            assert_eq!(&frame[0..4], expected_sync);
            assert!(frame[5600..].iter().all(|&x| x == 0x55));
        }
        // content beyond the sync word survives the round trip, in alternation
        let start = recovered
            .iter()
            .position(|f| f[4..600] == a[4..600])
            .expect("a-content frame recovered");
        if start + 1 < recovered.len() {
            assert_eq!(&recovered[start + 1][4..600], &b[4..600]);
        }
    }

    #[test]
    fn padding_detection_uses_minimum() {
        // one payload with a data byte of 0xFF right after the padding must not inflate
        // the detected offset
        let a = mk_content_frame(0x42);
        let stream = build_transmitted(&[&a, &a, &a, &a]);
        let mut pipeline = EtinaPipeline::new();
        for payload in paddedize(&stream, 12, 184) {
            pipeline.feed(&payload);
        }
        assert_eq!(pipeline.detection().unwrap().padding_bytes, 12);
    }

    #[test]
    fn no_output_before_detection_window() {
        let a = mk_content_frame(0x00);
        let stream = build_transmitted(&[&a]);
        let mut pipeline = EtinaPipeline::new();
        let payloads = paddedize(&stream, 12, 184);
        for payload in &payloads[..4] {
            pipeline.feed(payload);
        }
        // fewer than OFFSET_DETECTION_PACKET_COUNT payloads: everything still buffered
        assert!(pipeline.pop_frame().is_none());
        assert_eq!(pipeline.sync_buffer_len(), 0);
    }

    #[test]
    fn mid_stream_join_still_synchronises() {
        let a = mk_content_frame(0x33);
        let frames: Vec<&[u8; ETI_NI_FRAME_SIZE]> = std::iter::repeat(&*a).take(8).collect();
        let stream = build_transmitted(&frames);
        // drop a prefix that is not a multiple of the multiframe size
        let cut = 1000;
        let mut pipeline = EtinaPipeline::new();
        for payload in paddedize(&stream[cut..], 12, 184) {
            pipeline.feed(&payload);
        }
        let frame = pipeline.pop_frame().expect("should recover alignment");
        assert_eq!(&frame[4..600], &a[4..600]);
    }

    #[test]
    fn garbage_never_synchronises() {
        let mut pipeline = EtinaPipeline::new();
        // a deterministic pseudo-random byte soup with no E1 structure
        let mut x: u32 = 0x1234_5678;
        for _ in 0..200 {
            let payload: Vec<u8> = (0..184)
                .map(|_| {
                    x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                    // avoid the sync value in either polarity
                    match (x >> 16) as u8 {
                        b if b & 0x7F == 0x1B => 0x00,
                        b if (b ^ 0xFF) & 0x7F == 0x1B => 0x00,
                        b => b,
                    }
                })
                .collect();
            pipeline.feed(&payload);
        }
        assert!(pipeline.detection().is_none());
        assert!(pipeline.pop_frame().is_none());
        // the search buffer stays bounded
        assert!(pipeline.sync_buffer_len() <= 8192 + 184);
    }
}
