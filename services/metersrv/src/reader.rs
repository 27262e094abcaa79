//! Chunked register reads over a sparse address space
//!
//! Devices cap how many registers one request may return, so each declared
//! block is fetched as a series of consecutive sub-reads no larger than
//! `max_chunk` and stitched back together. A block is all-or-nothing: the
//! first failed or short sub-read discards everything read so far.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{MeterSrvError, Result};
use crate::layout::RegisterBlock;
use crate::protocol::RegisterSource;

/// Raw words for every block of one cycle, keyed by block start address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBlockSet {
    blocks: HashMap<u16, Vec<u16>>,
}

impl RawBlockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, start: u16, words: Vec<u16>) {
        self.blocks.insert(start, words);
    }

    pub fn get(&self, start: u16) -> Option<&[u16]> {
        self.blocks.get(&start).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Split `[0, count)` into `(offset, size)` sub-ranges of at most `max_chunk`
pub fn chunk_ranges(count: u16, max_chunk: u16) -> Vec<(u16, u16)> {
    let max_chunk = max_chunk.max(1);
    let mut ranges = Vec::with_capacity(usize::from(count.div_ceil(max_chunk)));
    let mut offset = 0u16;
    while offset < count {
        let size = max_chunk.min(count - offset);
        ranges.push((offset, size));
        offset += size;
    }
    ranges
}

/// Read one block in order, failing atomically on any bad sub-read
pub async fn read_block<S>(source: &mut S, block: RegisterBlock, max_chunk: u16) -> Result<Vec<u16>>
where
    S: RegisterSource + ?Sized,
{
    if block.end() > 0x1_0000 {
        return Err(MeterSrvError::read(
            block.start,
            block.count,
            "block runs past address 65535",
        ));
    }

    let mut words = Vec::with_capacity(usize::from(block.count));

    for (offset, size) in chunk_ranges(block.count, max_chunk) {
        let address = block.start + offset;
        debug!(
            "Reading registers {}..={} (offset={}/{})",
            address,
            address + (size - 1),
            offset,
            block.count
        );

        let chunk = source
            .read_holding_registers(address, size)
            .await
            .map_err(|e| match e {
                MeterSrvError::ReadError { .. } => e,
                other => MeterSrvError::read(address, size, other.to_string()),
            })?;

        if chunk.len() != usize::from(size) {
            return Err(MeterSrvError::read(
                address,
                size,
                format!("short response: got {} of {} registers", chunk.len(), size),
            ));
        }
        words.extend_from_slice(&chunk);
    }

    Ok(words)
}

/// Read every block in list order; any failing block fails the whole set
pub async fn read_all_blocks<S>(
    source: &mut S,
    blocks: &[RegisterBlock],
    max_chunk: u16,
) -> Result<RawBlockSet>
where
    S: RegisterSource + ?Sized,
{
    let mut raw = RawBlockSet::new();
    for block in blocks {
        let words = read_block(source, *block, max_chunk).await?;
        raw.insert(block.start, words);
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedSource;
    use tracing_test::traced_test;

    #[test]
    fn test_chunk_ranges_partition() {
        assert_eq!(
            chunk_ranges(65, 20),
            vec![(0, 20), (20, 20), (40, 20), (60, 5)]
        );
        assert_eq!(chunk_ranges(40, 20), vec![(0, 20), (20, 20)]);
        assert_eq!(chunk_ranges(9, 20), vec![(0, 9)]);
        assert!(chunk_ranges(0, 20).is_empty());
    }

    #[test]
    fn test_chunk_ranges_cover_without_gap_or_overlap() {
        for count in [1u16, 19, 20, 21, 65, 125, 300] {
            let ranges = chunk_ranges(count, 20);
            let mut expected_offset = 0;
            for (offset, size) in &ranges {
                assert_eq!(*offset, expected_offset);
                assert!(*size >= 1 && *size <= 20);
                expected_offset += size;
            }
            assert_eq!(expected_offset, count);
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_read_block_issues_ordered_sub_reads() {
        let mut source = ScriptedSource::counting();
        let words = read_block(&mut source, RegisterBlock::new(4095, 65), 20)
            .await
            .expect("read succeeds");

        assert_eq!(
            source.requests(),
            vec![(4095, 20), (4115, 20), (4135, 20), (4155, 5)]
        );
        assert_eq!(words.len(), 65);
        // Counting source returns each register's own address
        let expected: Vec<u16> = (4095..4160).collect();
        assert_eq!(words, expected);
        assert!(logs_contain("Reading registers 4155..=4159"));
    }

    #[tokio::test]
    async fn test_read_block_short_response_fails() {
        let mut source = ScriptedSource::counting().short_at(4115, 12);
        let err = read_block(&mut source, RegisterBlock::new(4095, 65), 20)
            .await
            .unwrap_err();

        match err {
            MeterSrvError::ReadError { address, count, reason } => {
                assert_eq!(address, 4115);
                assert_eq!(count, 20);
                assert!(reason.contains("12 of 20"));
            },
            other => panic!("expected ReadError, got {other:?}"),
        }
        // Reading stops at the failed chunk
        assert_eq!(source.requests(), vec![(4095, 20), (4115, 20)]);
    }

    #[tokio::test]
    async fn test_read_block_empty_response_fails() {
        let mut source = ScriptedSource::counting().short_at(4191, 0);
        let result = read_block(&mut source, RegisterBlock::new(4191, 9), 20).await;
        assert!(matches!(result, Err(MeterSrvError::ReadError { .. })));
    }

    #[tokio::test]
    async fn test_read_block_transport_error_becomes_read_error() {
        let mut source = ScriptedSource::counting().fail_at(4135);
        let err = read_block(&mut source, RegisterBlock::new(4095, 65), 20)
            .await
            .unwrap_err();
        assert!(matches!(err, MeterSrvError::ReadError { address: 4135, count: 20, .. }));
    }

    #[tokio::test]
    async fn test_read_all_blocks_skips_gaps() {
        let mut source = ScriptedSource::counting();
        let blocks = [
            RegisterBlock::new(4095, 65),
            RegisterBlock::new(4165, 25),
            RegisterBlock::new(4191, 9),
        ];
        let raw = read_all_blocks(&mut source, &blocks, 20)
            .await
            .expect("all blocks read");

        assert_eq!(raw.len(), 3);
        assert_eq!(raw.get(4095).map(<[u16]>::len), Some(65));
        assert_eq!(raw.get(4165).map(<[u16]>::len), Some(25));
        assert_eq!(raw.get(4191), Some(&(4191..4200).collect::<Vec<u16>>()[..]));

        // Addresses 4160..4165 and 4190 fall in gaps and are never requested
        for (address, size) in source.requests() {
            let end = address + size;
            assert!(!(address < 4165 && end > 4160), "read into gap: {address}+{size}");
            assert!(!(address <= 4190 && end > 4190), "read into gap: {address}+{size}");
        }
    }

    #[tokio::test]
    async fn test_read_all_blocks_fails_whole_set() {
        let mut source = ScriptedSource::counting().short_at(4191, 3);
        let blocks = [RegisterBlock::new(4095, 65), RegisterBlock::new(4191, 9)];
        let result = read_all_blocks(&mut source, &blocks, 20).await;
        assert!(result.is_err());
    }
}
