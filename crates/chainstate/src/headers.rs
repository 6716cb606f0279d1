//! Header validation and batch acceptance into the segment tree.

use std::collections::VecDeque;

use bitnode_consensus::constants::{MAX_FUTURE_BLOCK_TIME, MAX_HEADERS_RESULTS, MEDIAN_TIME_SPAN};
use bitnode_consensus::{hash256_to_hex, ConsensusParams, Forks, Hash256};
use bitnode_log::{log_debug, log_info, log_warn};
use bitnode_pow::difficulty::{get_work_required, is_retarget_height, DifficultyError};
use bitnode_pow::check_proof_of_work;
use bitnode_primitives::block::BlockHeader;
use bitnode_storage::KeyValueStore;

use crate::container::ChainContainer;
use crate::db::{ChainDb, SegmentRecord};
use crate::error::ChainError;
use crate::index::BlockIndex;
use crate::segment::SegmentId;
use crate::validation::ValidationError;

impl From<DifficultyError> for ValidationError {
    fn from(err: DifficultyError) -> Self {
        match err {
            DifficultyError::MissingPeriodStart { .. } => {
                ValidationError::InvalidHeader("retarget period start unavailable")
            }
            DifficultyError::Compact(err) => ValidationError::Compact(err),
        }
    }
}

/// Timestamps of the most recent ancestors, oldest first.
#[derive(Clone, Debug, Default)]
pub struct TimeWindow {
    times: VecDeque<u32>,
}

impl TimeWindow {
    pub fn push(&mut self, time: u32) {
        self.times.push_back(time);
        while self.times.len() > MEDIAN_TIME_SPAN {
            self.times.pop_front();
        }
    }

    /// Median of the window; zero when empty.
    pub fn median_time_past(&self) -> u32 {
        let mut sorted: Vec<u32> = self.times.iter().copied().collect();
        sorted.sort_unstable();
        sorted.get(sorted.len() / 2).copied().unwrap_or(0)
    }
}

/// Ancestor data a header's contextual checks read.
#[derive(Clone, Copy, Debug)]
pub struct HeaderContext {
    pub median_time_past: u32,
    /// Time of the first block of the retarget period, when `prev + 1`
    /// starts a new period.
    pub period_start_time: Option<u32>,
    /// Adjusted network time in unix seconds.
    pub now: i64,
}

pub struct HeaderCheck<'a> {
    params: &'a ConsensusParams,
}

impl<'a> HeaderCheck<'a> {
    pub fn new(params: &'a ConsensusParams) -> Self {
        Self { params }
    }

    pub fn check(
        &self,
        hash: &Hash256,
        header: &BlockHeader,
        check_pow: bool,
    ) -> Result<(), ValidationError> {
        if check_pow {
            check_proof_of_work(hash, header.bits, self.params)?;
        }
        Ok(())
    }

    pub fn check_contextual(
        &self,
        hash: &Hash256,
        header: &BlockHeader,
        prev: &BlockIndex,
        context: &HeaderContext,
        forks: &Forks,
    ) -> Result<(), ValidationError> {
        let expected =
            get_work_required(&prev.header_info(), context.period_start_time, self.params)?;
        if header.bits != expected {
            return Err(ValidationError::BadDifficulty {
                expected,
                found: header.bits,
            });
        }
        let required = forks.majority_version();
        if header.version < required {
            return Err(ValidationError::VersionTooLow {
                required,
                found: header.version,
            });
        }
        if header.time <= context.median_time_past {
            return Err(ValidationError::TimeTooOld);
        }
        if i64::from(header.time) > context.now + MAX_FUTURE_BLOCK_TIME {
            return Err(ValidationError::TimeTooNew);
        }
        let height = prev.height + 1;
        if let Some(checkpoint) = self.params.checkpoint_at(height) {
            if &checkpoint.hash != hash {
                return Err(ValidationError::CheckpointMismatch(height));
            }
        }
        Ok(())
    }

    pub fn make_index(
        &self,
        prev: &BlockIndex,
        hash: Hash256,
        header: BlockHeader,
    ) -> Result<BlockIndex, ValidationError> {
        Ok(prev.child(hash, header)?)
    }
}

/// Result of folding one header batch into the tree.
#[derive(Clone, Debug)]
pub struct BatchOutcome {
    pub segment: SegmentId,
    /// Headers that were new to the index.
    pub accepted: usize,
    /// Index of the last header of the batch.
    pub tip: BlockIndex,
    pub new_segment: bool,
    /// The best-work segment differs from before the batch.
    pub best_changed: bool,
}

/// Validate `headers` as one run and fold it into `container`.
///
/// The run must start on a known header. It either extends the segment whose
/// tip is that header, or opens a new segment forking from it. Any invalid
/// header rejects the whole batch and leaves both the store and the
/// container untouched.
pub fn accept_batch<S: KeyValueStore>(
    db: &ChainDb<S>,
    container: &mut ChainContainer,
    check: &HeaderCheck<'_>,
    headers: &[BlockHeader],
    now: i64,
) -> Result<BatchOutcome, ChainError> {
    if headers.is_empty() {
        return Err(ValidationError::InvalidHeader("empty headers batch").into());
    }
    if headers.len() > MAX_HEADERS_RESULTS {
        return Err(ValidationError::InvalidHeader("headers batch too large").into());
    }
    let hashes: Vec<Hash256> = headers.iter().map(BlockHeader::hash).collect();
    for (pair, hash) in headers.windows(2).zip(&hashes) {
        if pair[1].prev_block != *hash {
            return Err(ValidationError::InvalidHeader("headers batch is not a chain").into());
        }
    }

    let mut skip = 0;
    while skip < headers.len() && db.contains_index(&hashes[skip])? {
        skip += 1;
    }
    if skip == headers.len() {
        let last = hashes[skip - 1];
        let (tip, segment) = db.lookup_index(&last)?.ok_or(ChainError::UnknownHash(last))?;
        return Ok(BatchOutcome {
            segment,
            accepted: 0,
            tip,
            new_segment: false,
            best_changed: false,
        });
    }
    let headers = &headers[skip..];
    let hashes = &hashes[skip..];

    let start = headers[0].prev_block;
    let (start_index, start_segment) = db
        .lookup_index(&start)?
        .ok_or(ChainError::UnknownStartHeader(start))?;
    let extends = container.segment_with_tip(&start);
    let chain = container.view(extends.unwrap_or(start_segment))?;
    if chain.hash_at(start_index.height) != Some(start) {
        return Err(ChainError::CorruptIndex("start header missing from its segment view"));
    }

    let params = check.params;
    let mut forks = Forks::new(params);
    forks.load(db.find_super_majority_info_by_hash(&start, params.majority_window)?);
    let mut times = TimeWindow::default();
    let mut cursor = start_index;
    let mut recent = Vec::with_capacity(MEDIAN_TIME_SPAN);
    loop {
        recent.push(cursor.header.time);
        if recent.len() == MEDIAN_TIME_SPAN || cursor.height == 0 {
            break;
        }
        cursor = db.fetch_index(&cursor.header.prev_block)?;
    }
    for time in recent.into_iter().rev() {
        times.push(time);
    }

    let first_height = start_index.height + 1;
    let mut pending: Vec<BlockIndex> = Vec::with_capacity(headers.len());
    let mut prev = start_index;
    for (header, hash) in headers.iter().zip(hashes) {
        let period_start_time = if !params.pow_no_retargeting
            && is_retarget_height(prev.height + 1, params)
        {
            let height = prev
                .height
                .checked_sub(params.retarget_interval().saturating_sub(1))
                .ok_or(ChainError::CorruptIndex("retarget period starts below genesis"))?;
            let time = if height >= first_height {
                pending[(height - first_height) as usize].header.time
            } else {
                let ancestor = chain
                    .hash_at(height)
                    .ok_or(ChainError::CorruptIndex("retarget ancestor missing"))?;
                db.fetch_index(&ancestor)?.header.time
            };
            Some(time)
        } else {
            None
        };
        let context = HeaderContext {
            median_time_past: times.median_time_past(),
            period_start_time,
            now,
        };

        let index = check
            .check(hash, header, true)
            .and_then(|_| check.check_contextual(hash, header, &prev, &context, &forks))
            .and_then(|_| check.make_index(&prev, *hash, *header));
        let index = match index {
            Ok(index) => index,
            Err(err) => {
                log_warn!(
                    "rejecting header {} at height {}: {err}",
                    hash256_to_hex(hash),
                    prev.height + 1
                );
                return Err(err.into());
            }
        };
        forks.next(header.version);
        times.push(header.time);
        pending.push(index);
        prev = index;
    }

    let best_before = container.best();
    let segment = match extends {
        Some(id) => id,
        None => container.next_segment_id(),
    };
    let block_tip = if extends.is_none() {
        let parent_tip = *container.block_tip(start_segment)?;
        let inherited = if parent_tip.height <= start_index.height
            && chain.hash_at(parent_tip.height) == Some(parent_tip.hash)
        {
            parent_tip
        } else {
            start_index
        };
        Some(inherited)
    } else {
        None
    };

    db.transaction(|batch| {
        if let Some(block_tip) = block_tip {
            db.insert_segment(
                batch,
                &SegmentRecord {
                    id: segment,
                    parent: Some(start_segment),
                    start_height: first_height,
                    block_tip: block_tip.hash,
                },
            );
        }
        db.insert_header_batch(batch, segment, &pending);
        Ok(())
    })?;

    let mut indices = pending.iter();
    if let Some(block_tip) = block_tip {
        let first = indices
            .next()
            .ok_or(ChainError::CorruptIndex("new segment without headers"))?;
        let assigned = container.add_segment(start_segment, *first, block_tip)?;
        if assigned != segment {
            return Err(ChainError::CorruptIndex("segment id changed during batch"));
        }
    }
    for index in indices {
        container.update_segment(segment, *index)?;
    }

    let best_changed = container.best() != best_before;
    let tip = *container.segment(segment)?.tip();
    if best_changed {
        log_info!(
            "best header chain is now segment {segment} at height {} ({})",
            tip.height,
            hash256_to_hex(&tip.hash)
        );
    } else {
        log_debug!(
            "accepted {} headers on segment {segment}, tip height {}",
            pending.len(),
            tip.height
        );
    }
    Ok(BatchOutcome {
        segment,
        accepted: pending.len(),
        tip,
        new_segment: block_tip.is_some(),
        best_changed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_of_partial_window() {
        let mut window = TimeWindow::default();
        assert_eq!(window.median_time_past(), 0);
        for time in [5, 1, 9] {
            window.push(time);
        }
        assert_eq!(window.median_time_past(), 5);
        for time in 10..30 {
            window.push(time);
        }
        // Only the newest eleven remain: 19..=29.
        assert_eq!(window.median_time_past(), 24);
    }
}
