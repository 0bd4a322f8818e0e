use crate::feed::types::{CanonicalBlock, FeedSource, Quantity, SynthesisMode, UNKNOWN_HASH};
use crate::feed::wire::BlockFields;

/// Builds the canonical record for a parsed block.
///
/// `floor_ms` is the previous `received_at` of the same feed; the stamp never
/// goes below it even if the wall clock steps backwards.
pub fn normalize(
    source: FeedSource,
    fields: BlockFields,
    now_ms: i64,
    floor_ms: Option<i64>,
) -> CanonicalBlock {
    let received_at = monotonic_stamp(now_ms, floor_ms);
    let child_index = match source {
        FeedSource::Fast => fields.child_index,
        FeedSource::Reference => None,
    };

    CanonicalBlock {
        number: fields.number,
        hash: fields
            .hash
            .filter(|hash| !hash.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_HASH.to_string()),
        timestamp: fields
            .timestamp
            .unwrap_or_else(|| unix_seconds(received_at)),
        transaction_count: fields.transaction_count.unwrap_or(0),
        gas_used: Quantity::from(fields.gas_used),
        base_fee_per_gas: Quantity::from(fields.base_fee_per_gas),
        source,
        received_at,
        child_index,
        placeholder_tx: None,
        synthesized: false,
    }
}

/// Follow-up record for a fast-feed frame that carried no block number.
pub fn synthesize(
    previous: &CanonicalBlock,
    mode: SynthesisMode,
    now_ms: i64,
    sequence: u64,
) -> Option<CanonicalBlock> {
    let received_at = monotonic_stamp(now_ms, Some(previous.received_at));
    match mode {
        SynthesisMode::Off => None,
        SynthesisMode::SubBlock => {
            let child_index = previous.child_index.unwrap_or(0).checked_add(1)?;
            Some(CanonicalBlock {
                number: previous.number,
                hash: previous.hash.clone(),
                timestamp: previous.timestamp,
                transaction_count: 1,
                gas_used: Quantity::Unknown,
                base_fee_per_gas: Quantity::Unknown,
                source: previous.source,
                received_at,
                child_index: Some(child_index),
                placeholder_tx: Some(placeholder_tx_id(previous.number, child_index, sequence)),
                synthesized: true,
            })
        }
        SynthesisMode::NextBlock => Some(CanonicalBlock {
            number: previous.number.checked_add(1)?,
            hash: UNKNOWN_HASH.to_string(),
            timestamp: unix_seconds(received_at),
            transaction_count: 0,
            gas_used: Quantity::Unknown,
            base_fee_per_gas: Quantity::Unknown,
            source: previous.source,
            received_at,
            child_index: None,
            placeholder_tx: None,
            synthesized: true,
        }),
    }
}

pub fn monotonic_stamp(now_ms: i64, floor_ms: Option<i64>) -> i64 {
    floor_ms.map_or(now_ms, |floor| now_ms.max(floor))
}

fn unix_seconds(unix_ms: i64) -> u64 {
    (unix_ms.max(0) / 1_000) as u64
}

// splitmix64 over (number, child, sequence); unique per session, not a real hash.
fn placeholder_tx_id(number: u64, child_index: u32, sequence: u64) -> String {
    let mut words = [0_u64; 4];
    let mut state = number
        .rotate_left(17)
        ^ u64::from(child_index).rotate_left(41)
        ^ sequence;
    for word in &mut words {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut mixed = state;
        mixed = (mixed ^ (mixed >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        mixed = (mixed ^ (mixed >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        *word = mixed ^ (mixed >> 31);
    }
    format!(
        "0x{:016x}{:016x}{:016x}{:016x}",
        words[0], words[1], words[2], words[3]
    )
}
