//! PSI section reassembly across TS packets, keyed by PID.

use std::collections::HashMap;

use super::packet::TsPacket;

const MAX_SECTION_LEN: usize = 4096;

#[derive(Debug, Default)]
pub struct SectionBuffer {
    buf: Vec<u8>,
    expected_len: usize,
    active: bool,
}

impl SectionBuffer {
    fn start(&mut self, data: &[u8], expected_len: usize) {
        self.buf.clear();
        self.buf.extend_from_slice(data);
        self.expected_len = expected_len;
        self.active = true;
    }

    fn append(&mut self, data: &[u8]) {
        if self.buf.len() + data.len() <= MAX_SECTION_LEN {
            self.buf.extend_from_slice(data);
        } else {
            self.active = false;
        }
    }
}

/// Reassembles complete PSI sections out of a stream of TS packets, for the
/// set of PIDs the caller cares about (everything else is discarded early).
pub struct Demuxer {
    watched_pids: Vec<u16>,
    buffers: HashMap<u16, SectionBuffer>,
}

impl Demuxer {
    pub fn new(watched_pids: Vec<u16>) -> Self {
        Self {
            watched_pids,
            buffers: HashMap::new(),
        }
    }

    /// Feed a raw byte chunk (not necessarily packet-aligned to a clean
    /// boundary at the end; trailing partial packets are ignored). Calls
    /// `on_section(pid, bytes)` for every section completed during this
    /// chunk.
    pub fn process_chunk(&mut self, chunk: &[u8], mut on_section: impl FnMut(u16, &[u8])) {
        let mut i = 0;
        while i + super::packet::PACKET_SIZE <= chunk.len() {
            let raw = &chunk[i..i + super::packet::PACKET_SIZE];
            i += super::packet::PACKET_SIZE;

            if raw[0] != super::packet::SYNC_BYTE {
                continue;
            }
            let Some(pkt) = TsPacket::parse(raw) else {
                continue;
            };
            if pkt.transport_error || !self.watched_pids.contains(&pkt.pid) {
                continue;
            }

            self.feed_packet(pkt, &mut on_section);
        }
    }

    fn feed_packet(&mut self, pkt: TsPacket<'_>, on_section: &mut impl FnMut(u16, &[u8])) {
        let entry = self.buffers.entry(pkt.pid).or_default();

        if pkt.payload_unit_start {
            let payload = pkt.payload;
            if payload.is_empty() {
                return;
            }
            let pointer = payload[0] as usize;
            let rest = &payload[1..];
            if pointer > rest.len() {
                return;
            }

            if entry.active {
                let (tail, _) = rest.split_at(pointer.min(rest.len()));
                entry.append(tail);
                if entry.buf.len() >= entry.expected_len && entry.expected_len > 0 {
                    on_section(pkt.pid, &entry.buf[..entry.expected_len]);
                }
                entry.active = false;
            }

            let new_section = &rest[pointer..];
            if new_section.len() >= 3 {
                let section_len = (((new_section[1] & 0x0F) as usize) << 8) | new_section[2] as usize;
                let total_len = section_len + 3;

                if new_section.len() >= total_len {
                    on_section(pkt.pid, &new_section[..total_len]);
                } else {
                    entry.start(new_section, total_len);
                }
            }
        } else if entry.active {
            let needed = entry.expected_len.saturating_sub(entry.buf.len());
            let to_copy = needed.min(pkt.payload.len());
            entry.append(&pkt.payload[..to_copy]);
            if entry.buf.len() >= entry.expected_len {
                on_section(pkt.pid, &entry.buf[..entry.expected_len]);
                entry.active = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(pid: u16, pusi: bool, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0xFFu8; 188];
        buf[0] = 0x47;
        buf[1] = if pusi { 0x40 } else { 0 } | ((pid >> 8) as u8 & 0x1F);
        buf[2] = (pid & 0xFF) as u8;
        buf[3] = 0x10;
        let n = payload.len().min(184);
        buf[4..4 + n].copy_from_slice(&payload[..n]);
        buf
    }

    #[test]
    fn single_packet_section_completes_immediately() {
        // table_id=0xC8, section_length=5 -> total_len=8
        let mut section = vec![0xC8, 0xF0, 0x05, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE];
        let mut payload = vec![0u8]; // pointer field = 0
        payload.append(&mut section);
        let pkt = packet(0x1FFB, true, &payload);

        let mut demux = Demuxer::new(vec![0x1FFB]);
        let mut got = None;
        demux.process_chunk(&pkt, |pid, data| got = Some((pid, data.to_vec())));

        let (pid, data) = got.expect("section should complete");
        assert_eq!(pid, 0x1FFB);
        assert_eq!(data[0], 0xC8);
        assert_eq!(data.len(), 8);
    }

    #[test]
    fn section_spanning_two_packets_reassembles() {
        let mut full = vec![0xC9u8, 0xF0, 200]; // section_length=200 -> total 203
        full.extend(std::iter::repeat(0x55).take(200));

        let first_chunk_len = 100;
        let mut first_payload = vec![0u8]; // pointer = 0
        first_payload.extend_from_slice(&full[..first_chunk_len]);
        let first_pkt = packet(0x1FFB, true, &first_payload);

        let second_payload = &full[first_chunk_len..];
        let second_pkt = packet(0x1FFB, false, second_payload);

        let mut demux = Demuxer::new(vec![0x1FFB]);
        let mut got = None;
        let mut chunk = first_pkt;
        chunk.extend(second_pkt);
        demux.process_chunk(&chunk, |pid, data| got = Some((pid, data.to_vec())));

        let (_, data) = got.expect("reassembled section");
        assert_eq!(data.len(), 203);
        assert_eq!(data[0], 0xC9);
    }

    #[test]
    fn unwatched_pid_is_ignored() {
        let payload = [0u8, 0xC8, 0xF0, 0x00];
        let pkt = packet(0x0010, true, &payload);
        let mut demux = Demuxer::new(vec![0x1FFB]);
        let mut called = false;
        demux.process_chunk(&pkt, |_, _| called = true);
        assert!(!called);
    }
}
