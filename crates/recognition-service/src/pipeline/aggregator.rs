use common::recognition::{
    AnalysisReport, AppearanceEntry, AppearanceEvent, IdentityVisits, ReportStats,
};
use std::collections::HashMap;

/// Frame counters reported alongside the appearances
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounts {
    pub processed: u64,
    pub skipped: u64,
}

/// Compile closed events into the final report
///
/// Rows are ordered by `(start_time, identity_id)`. Identities are listed in
/// order of first appearance.
pub fn aggregate(
    events: Vec<AppearanceEvent>,
    processing_time: f64,
    frames: FrameCounts,
) -> AnalysisReport {
    let mut appearances: Vec<AppearanceEntry> = events
        .into_iter()
        .map(|event| {
            let end_time = event.end_time.unwrap_or(event.last_seen_time);
            AppearanceEntry {
                duration: (end_time - event.start_time).max(0.0),
                identity_id: event.identity_id,
                display_name: event.display_name,
                group_label: event.group_label,
                start_time: event.start_time,
                end_time,
                peak_similarity: event.peak_similarity,
                sample_crop_reference: event.sample_crop_reference,
            }
        })
        .collect();

    appearances.sort_by(|a, b| {
        a.start_time
            .total_cmp(&b.start_time)
            .then_with(|| a.identity_id.cmp(&b.identity_id))
    });

    let mut identities: Vec<IdentityVisits> = Vec::new();
    let mut positions: HashMap<&str, usize> = HashMap::new();
    for entry in &appearances {
        match positions.get(entry.identity_id.as_str()) {
            Some(&i) => {
                let visits = &mut identities[i];
                visits.visits += 1;
                visits.total_duration += entry.duration;
                visits.peak_similarity = visits.peak_similarity.max(entry.peak_similarity);
            }
            None => {
                positions.insert(entry.identity_id.as_str(), identities.len());
                identities.push(IdentityVisits {
                    identity_id: entry.identity_id.clone(),
                    display_name: entry.display_name.clone(),
                    group_label: entry.group_label.clone(),
                    visits: 1,
                    total_duration: entry.duration,
                    peak_similarity: entry.peak_similarity,
                });
            }
        }
    }

    let stats = ReportStats {
        distinct_identities: identities.len(),
        total_events: appearances.len(),
        processing_time,
        frames_processed: frames.processed,
        frames_skipped: frames.skipped,
    };

    AnalysisReport {
        appearances,
        identities,
        stats,
    }
}
