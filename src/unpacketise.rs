//! Recovery of 188-byte transport stream packet boundaries from arbitrary runs of bytes.

use crate::packet::{self, Packet};
use log::debug;

/// Splits a byte stream into transport stream packets, passing each complete packet to the
/// given [`PacketConsumer`](../packet/trait.PacketConsumer.html).
///
/// Any partial packet left at the end of one `push()` call is buffered and completed by the
/// start of the next, so the stream may be fed in chunks of any size.  On loss of
/// synchronisation the stream is scanned forward for a `0x47` byte that is followed by
/// another `0x47` at offset +188 (when the following position is beyond the data in hand,
/// a single `0x47` is accepted as a best-effort match).
///
/// Packets with the `transport_error_indicator` set, and null packets (PID `0x1fff`), are
/// dropped without being passed to the consumer.
pub struct Unpacketise<C>
where
    C: packet::PacketConsumer,
{
    consumer: C,
    partial: Vec<u8>,
    synced: bool,
    dropped_bytes: u64,
}

impl<C> Unpacketise<C>
where
    C: packet::PacketConsumer,
{
    pub fn new(consumer: C) -> Unpacketise<C> {
        Unpacketise {
            consumer,
            partial: Vec::with_capacity(Packet::SIZE),
            synced: true,
            dropped_bytes: 0,
        }
    }

    /// Number of bytes skipped while searching for packet synchronisation.
    pub fn dropped_byte_count(&self) -> u64 {
        self.dropped_bytes
    }

    /// Gives access to the consumer instance, for retrieval of accumulated results.
    pub fn consumer(&mut self) -> &mut C {
        &mut self.consumer
    }

    pub fn push(&mut self, buf: &[u8]) {
        let mut pos = 0;

        // complete any partial packet held over from the last call,
        if !self.partial.is_empty() {
            let needed = Packet::SIZE - self.partial.len();
            if buf.len() < needed {
                self.partial.extend_from_slice(buf);
                return;
            }
            self.partial.extend_from_slice(&buf[..needed]);
            pos = needed;
            // the partial buffer always starts with a sync byte; that was checked when it
            // was stashed
            let partial = std::mem::replace(&mut self.partial, Vec::with_capacity(Packet::SIZE));
            self.emit(&partial);
        }

        loop {
            if !self.synced {
                match self.find_sync(&buf[pos..]) {
                    Some(skip) => {
                        self.dropped_bytes += skip as u64;
                        pos += skip;
                        self.synced = true;
                    }
                    None => {
                        self.dropped_bytes += (buf.len() - pos) as u64;
                        return;
                    }
                }
            }
            if pos >= buf.len() {
                return;
            }
            if pos + Packet::SIZE > buf.len() {
                if Packet::is_sync_byte(buf[pos]) {
                    self.partial.extend_from_slice(&buf[pos..]);
                } else {
                    self.synced = false;
                    continue;
                }
                return;
            }
            if Packet::is_sync_byte(buf[pos]) {
                self.emit(&buf[pos..pos + Packet::SIZE]);
                pos += Packet::SIZE;
            } else {
                debug!("sync lost at stream offset +{}", pos);
                self.synced = false;
            }
        }
    }

    // Scan for a 0x47 confirmed by a second 0x47 one packet later.  When the confirming
    // position lies beyond the available data, accept the candidate - the next push() will
    // drop sync again if it was a false match.
    fn find_sync(&self, buf: &[u8]) -> Option<usize> {
        for (i, &b) in buf.iter().enumerate() {
            if Packet::is_sync_byte(b) {
                let confirm = i + Packet::SIZE;
                if confirm >= buf.len() || Packet::is_sync_byte(buf[confirm]) {
                    return Some(i);
                }
            }
        }
        None
    }

    fn emit(&mut self, buf: &[u8]) {
        let pk = Packet::new(buf);
        if pk.transport_error_indicator() || pk.pid() == packet::Pid::NULL {
            return;
        }
        self.consumer.consume(&pk);
    }
}
