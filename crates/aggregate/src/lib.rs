pub mod cross_record;
pub mod per_chunk;
pub mod synthesis;

pub use cross_record::{
    AggregateError, CrossRecordConfig, TieBreak, aggregate_records, collapse_passes, group_by_pair, majority,
};
pub use per_chunk::{RecordContext, aggregate_attempts};

use extract::{AggregatedJudgment, RelationshipRecord};

/// Judge every (source, target) pair present in `records`.
pub fn aggregate_by_pair(
    records: &[RelationshipRecord],
    config: &CrossRecordConfig,
) -> Result<Vec<AggregatedJudgment>, AggregateError> {
    group_by_pair(records)
        .into_iter()
        .map(|((source, target), group)| aggregate_records(&source, &target, &group, config))
        .collect()
}
