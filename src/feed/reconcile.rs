use crate::feed::history::BlockHistory;
use crate::feed::types::{
    BlockTimingEntry, CanonicalBlock, FeedSource, MergedBlockView, RaceStatus, RaceWinner,
    TimingStats, TimingVerdict,
};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Per-block arrival stamps from both feeds. Each side is written once.
#[derive(Debug, Clone, Default)]
pub struct BlockTimings {
    entries: BTreeMap<u64, BlockTimingEntry>,
}

impl BlockTimings {
    /// Returns `true` when this call set the feed's stamp for `number`.
    pub fn record(&mut self, number: u64, source: FeedSource, received_at: i64) -> bool {
        let entry = self.entries.entry(number).or_default();
        let slot = match source {
            FeedSource::Fast => &mut entry.fast,
            FeedSource::Reference => &mut entry.reference,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(received_at);
        true
    }

    pub fn get(&self, number: u64) -> Option<&BlockTimingEntry> {
        self.entries.get(&number)
    }

    pub fn entries(&self) -> &BTreeMap<u64, BlockTimingEntry> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn classify(delta_ms: i64, threshold_ms: i64) -> TimingVerdict {
    if delta_ms < -threshold_ms {
        TimingVerdict::FastFaster
    } else if delta_ms > threshold_ms {
        TimingVerdict::ReferenceFaster
    } else {
        TimingVerdict::Simultaneous
    }
}

pub fn timing_stats(timings: &BlockTimings, threshold_ms: i64) -> TimingStats {
    let mut total = 0_u64;
    let mut fast_faster = 0_u64;
    let mut reference_faster = 0_u64;
    let mut simultaneous = 0_u64;
    let mut delta_sum = 0_i128;

    for delta in timings.entries.values().filter_map(BlockTimingEntry::delta_ms) {
        total += 1;
        delta_sum += i128::from(delta);
        match classify(delta, threshold_ms) {
            TimingVerdict::FastFaster => fast_faster += 1,
            TimingVerdict::ReferenceFaster => reference_faster += 1,
            TimingVerdict::Simultaneous => simultaneous += 1,
        }
    }

    TimingStats {
        total,
        fast_faster,
        reference_faster,
        simultaneous,
        fast_faster_pct: percent(fast_faster, total),
        reference_faster_pct: percent(reference_faster, total),
        simultaneous_pct: percent(simultaneous, total),
        average_delta_ms: (total > 0).then(|| delta_sum as f64 / total as f64),
    }
}

/// Share of `count` in `total` as 0..=100; zero when nothing was compared.
pub fn percent(count: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    count as f64 * 100.0 / total as f64
}

pub fn format_percent(value: f64) -> String {
    if !value.is_finite() {
        return "0%".to_string();
    }
    format!("{value:.0}%")
}

pub fn throughput_ratio(fast_total: u64, reference_total: u64) -> Option<f64> {
    if fast_total == 0 || reference_total == 0 {
        return None;
    }
    Some(fast_total as f64 / reference_total as f64)
}

pub fn format_ratio(ratio: Option<f64>) -> String {
    match ratio {
        Some(value) => format!("{value:.2}x"),
        None => "calculating".to_string(),
    }
}

/// Most recent distinct block numbers across both feeds, newest first.
///
/// A number reported by one feed only is kept as a partial row.
pub fn merged_view(
    fast: &BlockHistory,
    reference: &BlockHistory,
    timings: &BlockTimings,
    limit: usize,
    threshold_ms: i64,
) -> Vec<MergedBlockView> {
    let mut rows: BTreeMap<u64, MergedBlockView> = BTreeMap::new();
    for block in fast.blocks().chain(reference.blocks()) {
        let row = match rows.entry(block.number) {
            Entry::Vacant(vacant) => vacant.insert(MergedBlockView {
                number: block.number,
                fast: None,
                reference: None,
                delta_ms: None,
                verdict: None,
            }),
            Entry::Occupied(occupied) => occupied.into_mut(),
        };
        let slot = match block.source {
            FeedSource::Fast => &mut row.fast,
            FeedSource::Reference => &mut row.reference,
        };
        if slot.as_ref().map_or(true, |current| newer(block, current)) {
            *slot = Some(block.clone());
        }
    }

    rows.into_values()
        .rev()
        .take(limit)
        .map(|mut row| {
            row.delta_ms = timings
                .get(row.number)
                .and_then(BlockTimingEntry::delta_ms);
            row.verdict = row.delta_ms.map(|delta| classify(delta, threshold_ms));
            row
        })
        .collect()
}

fn newer(candidate: &CanonicalBlock, current: &CanonicalBlock) -> bool {
    (candidate.child_index.unwrap_or(0), candidate.received_at)
        > (current.child_index.unwrap_or(0), current.received_at)
}

/// First feed to reach `target` raw messages. Decided once per session.
#[derive(Debug, Clone, Copy)]
pub struct RaceTracker {
    target: u64,
    winner: Option<RaceWinner>,
    decided_at: Option<i64>,
}

impl RaceTracker {
    pub fn new(target: u64) -> Self {
        Self {
            target,
            winner: None,
            decided_at: None,
        }
    }

    /// Returns the winner only on the pass that decided it.
    pub fn evaluate(
        &mut self,
        fast_count: u64,
        reference_count: u64,
        now_ms: i64,
    ) -> Option<RaceWinner> {
        if self.winner.is_some() {
            return None;
        }

        let winner = match (fast_count >= self.target, reference_count >= self.target) {
            (true, true) => RaceWinner::Tie,
            (true, false) => RaceWinner::Fast,
            (false, true) => RaceWinner::Reference,
            (false, false) => return None,
        };
        self.winner = Some(winner);
        self.decided_at = Some(now_ms);
        Some(winner)
    }

    pub fn winner(&self) -> Option<RaceWinner> {
        self.winner
    }

    pub fn status(&self) -> RaceStatus {
        RaceStatus {
            target: self.target,
            winner: self.winner,
            decided_at: self.decided_at,
        }
    }
}
