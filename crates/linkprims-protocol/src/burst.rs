use bytes::BytesMut;
use linkprims_accessor::{BinaryAccessor, DataType, Endianness, OverflowPolicy, Value};
use linkprims_packet::Packet;
use tracing::error;

use crate::args::Args;
use crate::error::Result;
use crate::protocol::{pass_empty, LinkInfo, Outcome, Protocol};

/// What a framing protocol's reducer made of the buffered bytes.
#[derive(Debug)]
pub(crate) enum Reduced {
    Frame(BytesMut),
    /// Need more bytes.
    Stop,
    /// Framing lost; search for the sync pattern again.
    Resync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Searching,
    Found,
}

/// Buffering, sync-pattern search and leading-byte handling shared by every
/// framing protocol. Each protocol supplies only the step that cuts one
/// frame from the front of the buffer.
#[derive(Debug)]
pub(crate) struct BurstCore {
    pub(crate) discard_leading_bytes: usize,
    pub(crate) sync_pattern: Option<Vec<u8>>,
    pub(crate) fill_fields: bool,
    pub(crate) allow_empty_data: Option<bool>,
    pub(crate) link_name: String,
    data: BytesMut,
    sync_state: SyncState,
}

impl BurstCore {
    pub(crate) fn new(
        discard_leading_bytes: usize,
        sync_pattern: Option<Vec<u8>>,
        fill_fields: bool,
        allow_empty_data: Option<bool>,
    ) -> Self {
        Self {
            discard_leading_bytes,
            sync_pattern: sync_pattern.filter(|pattern| !pattern.is_empty()),
            fill_fields,
            allow_empty_data,
            link_name: String::new(),
            data: BytesMut::new(),
            sync_state: SyncState::Searching,
        }
    }

    pub(crate) fn attach(&mut self, link: &LinkInfo) {
        self.link_name = link.name.clone();
    }

    pub(crate) fn reset(&mut self) {
        self.data.clear();
        self.sync_state = SyncState::Searching;
    }

    /// Bytes buffered but not yet framed.
    #[cfg(test)]
    pub(crate) fn buffered(&self) -> &[u8] {
        &self.data
    }

    /// Append `data` and try to cut one frame with `reduce`.
    ///
    /// An empty `data` (the drain pass) never resyncs immediately; if no
    /// frame is ready it defers to the empty-data rule.
    pub(crate) fn read<F>(&mut self, data: BytesMut, at_tail: bool, mut reduce: F) -> Result<Outcome<BytesMut>>
    where
        F: FnMut(&mut BytesMut, usize) -> Result<Reduced>,
    {
        let drain_pass = data.is_empty();
        self.data.extend_from_slice(&data);

        loop {
            if !self.handle_sync_pattern() {
                if drain_pass {
                    return Ok(pass_empty(self.allow_empty_data, data, at_tail));
                }
                return Ok(Outcome::Stop);
            }

            let mut frame = match reduce(&mut self.data, self.discard_leading_bytes)? {
                Reduced::Frame(frame) => frame,
                Reduced::Resync => {
                    self.sync_state = SyncState::Searching;
                    if !drain_pass {
                        continue;
                    }
                    return Ok(pass_empty(self.allow_empty_data, data, at_tail));
                }
                Reduced::Stop if drain_pass => {
                    return Ok(pass_empty(self.allow_empty_data, data, at_tail));
                }
                Reduced::Stop => return Ok(Outcome::Stop),
            };

            self.sync_state = SyncState::Searching;
            if self.discard_leading_bytes > 0 {
                let _ = frame.split_to(self.discard_leading_bytes.min(frame.len()));
            }
            return Ok(Outcome::Ready(frame));
        }
    }

    /// Discard bytes until the buffer starts with the sync pattern. Returns
    /// false when more data is needed.
    fn handle_sync_pattern(&mut self) -> bool {
        let Some(pattern) = self.sync_pattern.as_deref() else {
            return true;
        };
        if self.sync_state == SyncState::Found {
            return true;
        }
        loop {
            if self.data.len() < pattern.len() {
                return false;
            }
            let Some(start) = self.data.iter().position(|b| *b == pattern[0]) else {
                log_discard(&self.link_name, &self.data, self.data.len(), false);
                self.data.clear();
                return false;
            };
            if self.data.len() < start + pattern.len() {
                return false;
            }
            if &self.data[start..start + pattern.len()] == pattern {
                if start != 0 {
                    log_discard(&self.link_name, &self.data, start, true);
                    let _ = self.data.split_to(start);
                }
                self.sync_state = SyncState::Found;
                return true;
            }
            log_discard(&self.link_name, &self.data, start, false);
            let _ = self.data.split_to(start + 1);
        }
    }

    /// Fill the sync pattern into an outgoing packet that carries it.
    pub(crate) fn write_packet(&self, packet: &mut Packet) -> Result<()> {
        if let (true, Some(pattern), 0) = (
            self.fill_fields,
            self.sync_pattern.as_ref(),
            self.discard_leading_bytes,
        ) {
            write_block(pattern, &mut packet.buffer)?;
        }
        Ok(())
    }

    /// Put back the leading bytes that reads discard, sync pattern included.
    pub(crate) fn write_data(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        if !self.fill_fields || self.discard_leading_bytes == 0 {
            return Ok(data);
        }
        let mut framed = vec![0u8; self.discard_leading_bytes];
        if let Some(pattern) = &self.sync_pattern {
            write_block(pattern, &mut framed)?;
        }
        framed.extend_from_slice(&data);
        Ok(framed)
    }
}

fn write_block(pattern: &[u8], buffer: &mut Vec<u8>) -> Result<()> {
    BinaryAccessor::write(
        &Value::Block(pattern.to_vec()),
        0,
        pattern.len() as i64 * 8,
        DataType::Block,
        buffer,
        Endianness::Big,
        OverflowPolicy::Error,
    )?;
    Ok(())
}

fn log_discard(link: &str, data: &[u8], length: usize, found: bool) {
    let mut preview = [0u8; 6];
    let n = data.len().min(preview.len());
    preview[..n].copy_from_slice(&data[..n]);
    error!(
        interface = %link,
        starting = ?preview,
        "Sync {}found. Discarding {length} bytes of data.",
        if found { "" } else { "not " }
    );
}

/// Emits everything buffered as one frame, after optional sync-pattern
/// alignment.
#[derive(Debug)]
pub struct BurstProtocol {
    core: BurstCore,
}

impl BurstProtocol {
    pub fn new(
        discard_leading_bytes: usize,
        sync_pattern: Option<Vec<u8>>,
        fill_fields: bool,
        allow_empty_data: Option<bool>,
    ) -> Self {
        Self {
            core: BurstCore::new(discard_leading_bytes, sync_pattern, fill_fields, allow_empty_data),
        }
    }

    /// `discard_leading_bytes sync_pattern fill_fields allow_empty_data`
    pub fn from_args(values: &[String]) -> Result<Self> {
        let args = Args::new("BURST", values, 4)?;
        Ok(Self::new(
            args.size(0, "discard_leading_bytes", 0)?,
            args.hex(1, "sync_pattern")?,
            args.flag(2, "fill_fields", false)?,
            args.opt_flag(3, "allow_empty_data")?,
        ))
    }
}

pub(crate) fn reduce_all(data: &mut BytesMut, _discard: usize) -> Result<Reduced> {
    if data.is_empty() {
        return Ok(Reduced::Stop);
    }
    Ok(Reduced::Frame(data.split()))
}

impl Protocol for BurstProtocol {
    fn name(&self) -> &'static str {
        "BURST"
    }

    fn attach(&mut self, link: &LinkInfo) {
        self.core.attach(link);
    }

    fn allow_empty_data(&self) -> Option<bool> {
        self.core.allow_empty_data
    }

    fn read_data(&mut self, data: BytesMut, at_tail: bool) -> Result<Outcome<BytesMut>> {
        self.core.read(data, at_tail, reduce_all)
    }

    fn write_packet(&mut self, mut packet: Packet) -> Result<Outcome<Packet>> {
        self.core.write_packet(&mut packet)?;
        Ok(Outcome::Ready(packet))
    }

    fn write_data(&mut self, data: Vec<u8>) -> Result<Outcome<Vec<u8>>> {
        Ok(Outcome::Ready(self.core.write_data(data)?))
    }

    fn reset(&mut self) {
        self.core.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYNC: [u8; 4] = [0x1A, 0xCF, 0xFC, 0x1D];

    fn bytes(data: &[u8]) -> BytesMut {
        BytesMut::from(data)
    }

    #[test]
    fn test_emits_everything_buffered() {
        let mut burst = BurstProtocol::new(0, None, false, None);
        assert_eq!(
            burst.read_data(bytes(b"\x01\x02\x03"), true).unwrap(),
            Outcome::Ready(bytes(b"\x01\x02\x03"))
        );
        assert_eq!(burst.read_data(BytesMut::new(), true).unwrap(), Outcome::Stop);
    }

    #[test]
    fn test_discards_garbage_before_sync() {
        let mut burst = BurstProtocol::new(0, Some(SYNC.to_vec()), false, None);

        let mut input = vec![0x00, 0x1A, 0x55, 0xFF];
        input.extend_from_slice(&SYNC);
        input.extend_from_slice(&[0xAA, 0xBB]);
        let Outcome::Ready(frame) = burst.read_data(bytes(&input), true).unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(&frame[..4], &SYNC);
        assert_eq!(&frame[4..], &[0xAA, 0xBB]);

        // The next block must be realigned on its own sync pattern.
        let mut input = vec![0x99];
        input.extend_from_slice(&SYNC);
        input.push(0xCC);
        let Outcome::Ready(frame) = burst.read_data(bytes(&input), true).unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(frame.as_ref(), &[0x1A, 0xCF, 0xFC, 0x1D, 0xCC]);
    }

    #[test]
    fn test_partial_sync_waits() {
        let mut burst = BurstProtocol::new(0, Some(SYNC.to_vec()), false, None);
        assert_eq!(burst.read_data(bytes(&[0x1A, 0xCF]), true).unwrap(), Outcome::Stop);
        assert_eq!(
            burst.read_data(bytes(&[0xFC, 0x1D, 0x01]), true).unwrap(),
            Outcome::Ready(bytes(&[0x1A, 0xCF, 0xFC, 0x1D, 0x01]))
        );
    }

    #[test]
    fn test_garbage_without_sync_is_dropped() {
        let mut burst = BurstProtocol::new(0, Some(SYNC.to_vec()), false, None);
        assert_eq!(burst.read_data(bytes(&[1, 2, 3, 4, 5]), true).unwrap(), Outcome::Stop);
        assert!(burst.core.buffered().is_empty());
    }

    #[test]
    fn test_discard_leading_bytes() {
        let mut burst = BurstProtocol::new(2, Some(vec![0xAB, 0xCD]), false, None);
        assert_eq!(
            burst.read_data(bytes(&[0xAB, 0xCD, 7, 8]), true).unwrap(),
            Outcome::Ready(bytes(&[7, 8]))
        );
    }

    #[test]
    fn test_fill_fields_on_write() {
        let mut burst = BurstProtocol::new(0, Some(vec![0xAB, 0xCD]), true, None);
        let Outcome::Ready(packet) = burst.write_packet(Packet::raw(vec![0, 0, 5])).unwrap() else {
            panic!("expected a packet");
        };
        assert_eq!(packet.buffer, vec![0xAB, 0xCD, 5]);

        let mut burst = BurstProtocol::new(3, Some(vec![0xAB, 0xCD]), true, None);
        assert_eq!(
            burst.write_data(vec![9]).unwrap(),
            Outcome::Ready(vec![0xAB, 0xCD, 0, 9])
        );
    }

    #[test]
    fn test_from_args() {
        let args: Vec<String> = ["2", "0x1ACFFC1D", "TRUE", "nil"].iter().map(|s| s.to_string()).collect();
        let burst = BurstProtocol::from_args(&args).unwrap();
        assert_eq!(burst.core.discard_leading_bytes, 2);
        assert_eq!(burst.core.sync_pattern.as_deref(), Some(&SYNC[..]));
        assert!(burst.core.fill_fields);
        assert_eq!(burst.allow_empty_data(), None);

        let too_many: Vec<String> = vec!["0".into(); 5];
        assert!(BurstProtocol::from_args(&too_many).is_err());
    }
}
