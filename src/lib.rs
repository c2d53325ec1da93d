//! Structures for discovering DAB/DAB+ ensembles carried inside MPEG2 Transport Stream data,
//! and for reassembling their ETI-NI frames.
//!
//! A transport stream may carry a DAB ensemble in one of three encapsulations,
//!
//!  * DVB MPE sections (table_id `0x3E`) holding IPv4/UDP datagrams with EDI (PF/AF) packets,
//!  * DVB GSE packets in TS payloads, or DVB-S2 baseband frames in pseudo-TS containers,
//!    again holding IPv4/UDP/EDI,
//!  * a raw ETI-NA bit-stream (E1/G.704 interleaving) on a PID with no payload-unit starts.
//!
//! This crate recovers 6144-byte ETI-NI frames from all three, parses the Fast Information
//! Channel inside those frames into an ensemble/service model, and reports what it found.
//!
//! # Design Principals
//!
//!  * *Avoid copying and allocating* where practical.  Packet and section types borrow slices
//!    of the underlying byte buffer; reassembly stages that genuinely need to accumulate
//!    (fragmented GSE, EDI protocol-fragments, the ETI-NA deinterleaver) own bounded buffers.
//!  * *Non-blocking*.  The caller 'pushes' data; every `feed` call does a finite amount of
//!    work and never waits.  The only blocking code in the crate is in the convenience
//!    file/fd entry points in the [`discover`](discover/index.html) module.
//!  * *Transport Neutral*.  The parsing APIs accept `&[u8]`; the caller handles providing
//!    the data from a file, a DVR device, or anywhere else.
//!  * *Best effort*.  Broadcast streams contain bit errors.  Bad CRCs, malformed structures
//!    and sync losses are logged, counted and skipped; they are never surfaced as errors
//!    from the parsing surface.

pub mod bbf;
pub mod charset;
mod crc16;
pub mod discover;
pub mod edi;
pub mod ensemble;
pub mod etina;
pub mod fic;
pub mod gse;
pub mod manager;
pub mod mpe;
pub mod packet;
pub mod scanner;
pub mod sources;
pub mod udp;
pub mod unpacketise;
