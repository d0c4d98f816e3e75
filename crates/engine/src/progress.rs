//! Aggregate progress computation, shared by workers (periodic reporting)
//! and the Coordinator (pause/resume snapshots, `GetProgress`).

use crate::chunk::Chunk;

/// Sum of completed-chunk lengths plus progress of active chunks, with
/// the near-complete tie-break: an active chunk within
/// [`crate::chunk::COMPLETE_EPSILON`] of its full length counts as fully
/// contributed rather than its raw partial progress.
pub fn aggregate_downloaded(chunks: &[Chunk]) -> u64 {
    chunks
        .iter()
        .map(|c| if c.is_complete() || c.is_within_epsilon() { c.len() } else { c.progress() })
        .sum()
}

/// [`aggregate_downloaded`], capped at `total_size - 1` so the client never
/// observes 100% before finalization's explicit completed-state event
/// (spec §4.4 tie-break rule). Callers inside finalization steps 2 onward
/// bypass this cap and emit the exact values the sequence calls for.
pub fn capped_aggregate(chunks: &[Chunk], total_size: u64) -> u64 {
    aggregate_downloaded(chunks).min(total_size.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkPlan;

    #[test]
    fn sums_completed_and_partial_chunks() {
        let chunks = ChunkPlan::build(1000, 250);
        chunks[0].mark_completed();
        chunks[1].set_progress(100);
        assert_eq!(aggregate_downloaded(&chunks), 250 + 100);
    }

    #[test]
    fn near_complete_chunk_counts_as_full() {
        let chunks = ChunkPlan::build(1000, 250);
        chunks[0].set_progress(250 - 10); // within epsilon (32)
        assert_eq!(aggregate_downloaded(&chunks[..1]), 250);
    }

    #[test]
    fn capped_aggregate_never_reaches_total_before_finalization() {
        let chunks = ChunkPlan::build(1000, 1000);
        chunks[0].mark_completed();
        assert_eq!(aggregate_downloaded(&chunks), 1000);
        assert_eq!(capped_aggregate(&chunks, 1000), 999);
    }
}
