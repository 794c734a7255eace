//! Transport-layer fragmentation for byte-oriented transports.
//!
//! Logical frames can exceed what a transport comfortably carries in one
//! message, so every frame gets a one-byte kind prefix:
//!
//! ```text
//! 0x00 | payload                                  complete frame
//! 0x01 | batch_id u64 | index u32 | total u32     fragment header
//! 0x02 | batch_id u64 | index u32 | payload       fragment data
//! ```
//!
//! Integers are big-endian. `total` counts data fragments; the header's
//! own index is always zero. A [`Reassembler`] accepts fragments in any
//! order and emits the original frame exactly once when the header and
//! all data fragments have been seen.
//!
//! Reassembler state is per-channel. Fragments from different channels
//! must never share a reassembler.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

const KIND_COMPLETE: u8 = 0x00;
const KIND_HEADER: u8 = 0x01;
const KIND_DATA: u8 = 0x02;

/// Default fragment threshold for HTTP POST bodies.
pub const HTTP_FRAGMENT_THRESHOLD: usize = 80 * 1024;
/// Default fragment threshold for WebSocket binary frames.
pub const WS_FRAGMENT_THRESHOLD: usize = 100 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("empty fragment frame")]
    Empty,
    #[error("unknown fragment kind {0:#04x}")]
    UnknownKind(u8),
    #[error("truncated fragment frame")]
    Truncated,
    #[error("fragment header for batch {batch_id} declares zero fragments")]
    EmptyBatch { batch_id: u64 },
    #[error("fragment index {index} out of range for batch {batch_id} (total {total})")]
    IndexOutOfRange { batch_id: u64, index: u32, total: u32 },
    #[error("conflicting header for batch {batch_id}")]
    ConflictingHeader { batch_id: u64 },
}

/// Split one logical frame into transport messages.
///
/// Frames at or under `threshold` become a single complete message;
/// larger frames become a header plus `ceil(len / threshold)` data
/// fragments under a random batch id.
pub fn split(frame: &[u8], threshold: usize) -> Vec<Vec<u8>> {
    if frame.len() <= threshold {
        let mut out = Vec::with_capacity(frame.len() + 1);
        out.push(KIND_COMPLETE);
        out.extend_from_slice(frame);
        return vec![out];
    }

    let batch_id: u64 = rand::random();
    let chunks: Vec<&[u8]> = frame.chunks(threshold).collect();
    let total = chunks.len() as u32;

    let mut messages = Vec::with_capacity(chunks.len() + 1);

    let mut header = Vec::with_capacity(1 + 8 + 4 + 4);
    header.push(KIND_HEADER);
    header.extend_from_slice(&batch_id.to_be_bytes());
    header.extend_from_slice(&0u32.to_be_bytes());
    header.extend_from_slice(&total.to_be_bytes());
    messages.push(header);

    for (index, chunk) in chunks.iter().enumerate() {
        let mut data = Vec::with_capacity(1 + 8 + 4 + chunk.len());
        data.push(KIND_DATA);
        data.extend_from_slice(&batch_id.to_be_bytes());
        data.extend_from_slice(&(index as u32).to_be_bytes());
        data.extend_from_slice(chunk);
        messages.push(data);
    }

    messages
}

#[derive(Debug, Default)]
struct PendingBatch {
    total: Option<u32>,
    parts: BTreeMap<u32, Vec<u8>>,
}

impl PendingBatch {
    fn complete(&self) -> bool {
        match self.total {
            Some(total) => self.parts.len() as u32 == total,
            None => false,
        }
    }

    fn assemble(self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.parts.values().map(Vec::len).sum());
        for part in self.parts.into_values() {
            frame.extend_from_slice(&part);
        }
        frame
    }
}

/// Per-channel reassembly state.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: HashMap<u64, PendingBatch>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport message. Returns the reconstructed logical frame
    /// when it completes one, `None` while a batch is still partial.
    pub fn accept(&mut self, message: &[u8]) -> Result<Option<Vec<u8>>, FragmentError> {
        let (&kind, rest) = message.split_first().ok_or(FragmentError::Empty)?;
        match kind {
            KIND_COMPLETE => Ok(Some(rest.to_vec())),
            KIND_HEADER => {
                let (batch_id, _index, rest) = parse_ids(rest)?;
                let total = parse_u32(rest)?;
                if total == 0 {
                    return Err(FragmentError::EmptyBatch { batch_id });
                }
                let batch = self.pending.entry(batch_id).or_default();
                match batch.total {
                    Some(existing) if existing != total => {
                        self.pending.remove(&batch_id);
                        return Err(FragmentError::ConflictingHeader { batch_id });
                    }
                    _ => batch.total = Some(total),
                }
                Ok(self.take_if_complete(batch_id))
            }
            KIND_DATA => {
                let (batch_id, index, payload) = parse_ids(rest)?;
                let batch = self.pending.entry(batch_id).or_default();
                if let Some(total) = batch.total {
                    if index >= total {
                        self.pending.remove(&batch_id);
                        return Err(FragmentError::IndexOutOfRange { batch_id, index, total });
                    }
                }
                batch.parts.insert(index, payload.to_vec());
                Ok(self.take_if_complete(batch_id))
            }
            other => Err(FragmentError::UnknownKind(other)),
        }
    }

    fn take_if_complete(&mut self, batch_id: u64) -> Option<Vec<u8>> {
        let done = self.pending.get(&batch_id).is_some_and(PendingBatch::complete);
        if done {
            // Late index validation: a data fragment may have arrived with an
            // index the header now rules out.
            let batch = self.pending.remove(&batch_id)?;
            let total = batch.total?;
            if batch.parts.keys().any(|&i| i >= total) {
                return None;
            }
            Some(batch.assemble())
        } else {
            None
        }
    }

    /// Number of batches awaiting completion.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

fn parse_ids(rest: &[u8]) -> Result<(u64, u32, &[u8]), FragmentError> {
    if rest.len() < 12 {
        return Err(FragmentError::Truncated);
    }
    let (id_bytes, rest) = rest.split_at(8);
    let (index_bytes, rest) = rest.split_at(4);
    let batch_id = u64::from_be_bytes(id_bytes.try_into().expect("split_at(8)"));
    let index = u32::from_be_bytes(index_bytes.try_into().expect("split_at(4)"));
    Ok((batch_id, index, rest))
}

fn parse_u32(rest: &[u8]) -> Result<u32, FragmentError> {
    if rest.len() < 4 {
        return Err(FragmentError::Truncated);
    }
    Ok(u32::from_be_bytes(rest[..4].try_into().expect("checked len")))
}

#[cfg(test)]
mod tests {
    use rand::seq::SliceRandom;

    use super::*;

    #[test]
    fn small_frame_passes_through() {
        let frame = b"hello".to_vec();
        let messages = split(&frame, 1024);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0][0], KIND_COMPLETE);

        let mut r = Reassembler::new();
        assert_eq!(r.accept(&messages[0]).unwrap(), Some(frame));
    }

    #[test]
    fn large_frame_fragments_and_reassembles_in_order() {
        let frame: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let messages = split(&frame, 1024);
        // header + ceil(10_000 / 1024)
        assert_eq!(messages.len(), 1 + 10);

        let mut r = Reassembler::new();
        let mut out = None;
        for m in &messages {
            if let Some(done) = r.accept(m).unwrap() {
                assert!(out.is_none(), "frame must be emitted exactly once");
                out = Some(done);
            }
        }
        assert_eq!(out.unwrap(), frame);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn any_permutation_reassembles_exactly_once() {
        let frame: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        let mut messages = split(&frame, 1024);

        let mut rng = rand::thread_rng();
        for _ in 0..8 {
            messages.shuffle(&mut rng);
            let mut r = Reassembler::new();
            let mut emitted = 0;
            for m in &messages {
                if let Some(done) = r.accept(m).unwrap() {
                    assert_eq!(done, frame);
                    emitted += 1;
                }
            }
            assert_eq!(emitted, 1);
            assert_eq!(r.pending(), 0);
        }
    }

    #[test]
    fn duplicate_data_fragment_is_harmless() {
        let frame: Vec<u8> = vec![7u8; 3000];
        let messages = split(&frame, 1024);

        let mut r = Reassembler::new();
        // Feed one data fragment twice before the rest.
        assert_eq!(r.accept(&messages[1]).unwrap(), None);
        assert_eq!(r.accept(&messages[1]).unwrap(), None);
        let mut out = None;
        for m in &messages {
            if let Some(done) = r.accept(m).unwrap() {
                out = Some(done);
            }
        }
        assert_eq!(out.unwrap(), frame);
    }

    #[test]
    fn interleaved_batches_do_not_mingle() {
        let a: Vec<u8> = vec![1u8; 2500];
        let b: Vec<u8> = vec![2u8; 2500];
        let ma = split(&a, 1024);
        let mb = split(&b, 1024);

        let mut r = Reassembler::new();
        let mut got = Vec::new();
        for (x, y) in ma.iter().zip(mb.iter()) {
            if let Some(done) = r.accept(x).unwrap() {
                got.push(done);
            }
            if let Some(done) = r.accept(y).unwrap() {
                got.push(done);
            }
        }
        assert_eq!(got.len(), 2);
        assert!(got.contains(&a));
        assert!(got.contains(&b));
    }

    #[test]
    fn garbage_kinds_are_rejected() {
        let mut r = Reassembler::new();
        assert_eq!(r.accept(&[]).unwrap_err(), FragmentError::Empty);
        assert_eq!(r.accept(&[0x7f, 0, 0]).unwrap_err(), FragmentError::UnknownKind(0x7f));
        assert_eq!(r.accept(&[KIND_DATA, 1, 2]).unwrap_err(), FragmentError::Truncated);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let frame = vec![0u8; 3000];
        let messages = split(&frame, 1024);
        let mut r = Reassembler::new();
        r.accept(&messages[0]).unwrap();

        // Forge a data fragment with an index beyond the declared total.
        let mut forged = messages[1].clone();
        let bad_index = 99u32.to_be_bytes();
        forged[9..13].copy_from_slice(&bad_index);
        assert!(matches!(
            r.accept(&forged).unwrap_err(),
            FragmentError::IndexOutOfRange { index: 99, .. }
        ));
    }
}
