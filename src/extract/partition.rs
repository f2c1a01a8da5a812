use chrono::{Duration, NaiveDate};

use super::ExtractFilter;

/// Split a filter into disjoint chunks.
///
/// Id lists are cut into runs of `batch_size` ids. Date ranges are cut into
/// inclusive windows of `batch_size` days; an open end is closed at `today`.
/// A filter with neither ids nor a start date cannot be split and is returned
/// as a single chunk.
pub fn partition(filter: &ExtractFilter, batch_size: usize, today: NaiveDate) -> Vec<ExtractFilter> {
    let batch_size = batch_size.max(1);

    if !filter.ids.is_empty() {
        return filter
            .ids
            .chunks(batch_size)
            .map(|ids| ExtractFilter {
                ids: ids.to_vec(),
                start_date: filter.start_date,
                end_date: filter.end_date,
            })
            .collect();
    }

    let Some(start) = filter.start_date else {
        return vec![filter.clone()];
    };
    let end = filter.end_date.unwrap_or(today);
    if end < start {
        return vec![filter.clone()];
    }

    let mut chunks = Vec::new();
    let mut window_start = start;
    while window_start <= end {
        let window_end = (window_start + Duration::days(batch_size as i64 - 1)).min(end);
        chunks.push(ExtractFilter::date_range(Some(window_start), Some(window_end)));
        window_start = window_end + Duration::days(1);
    }
    chunks
}
