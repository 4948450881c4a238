//! Trend merging.
//!
//! Range queries are answered segment by segment (one segment per calendar
//! date or per partition). Segments cover disjoint, increasing time ranges,
//! so merging them is plain concatenation in segment order. Overlapping
//! segments produce non-monotonic output; they are not re-sorted.
//!
//! Per-channel trends of a multi-channel query are aligned on the union of
//! their timestamps by [`bundle_trends`].

use crate::data::{ChannelNumber, ChannelValue, Timestamp, Trend, TrendBundle};
use std::collections::BTreeMap;

/// Concatenates segments in order.
///
/// No segment yields an empty result, a single segment is returned as is.
pub fn merge_segments<T>(segments: Vec<Vec<T>>) -> Vec<T> {
    match segments.len() {
        0 => Vec::new(),
        1 => segments.into_iter().next().unwrap_or_default(),
        _ => {
            let total = segments.iter().map(Vec::len).sum();
            let mut merged = Vec::with_capacity(total);
            for segment in segments {
                merged.extend(segment);
            }
            merged
        }
    }
}

/// Concatenates per-segment trends of one channel.
pub fn merge_trends(channel_number: ChannelNumber, trends: Vec<Trend>) -> Trend {
    Trend {
        channel_number,
        points: merge_segments(trends.into_iter().map(|t| t.points).collect()),
    }
}

/// Concatenates per-segment bundles that share the same channel list.
pub fn merge_bundles(channel_numbers: &[ChannelNumber], bundles: Vec<TrendBundle>) -> TrendBundle {
    if bundles.len() == 1 {
        return bundles.into_iter().next().unwrap_or_default();
    }

    let mut merged = TrendBundle::new(channel_numbers.to_vec());
    for bundle in bundles {
        merged.timestamps.extend(bundle.timestamps);
        for (column, part) in merged.trends.iter_mut().zip(bundle.trends) {
            column.extend(part);
        }
    }
    merged
}

/// Aligns trends of different channels on the union of their timestamps.
///
/// Cells a channel has no value for are [`ChannelValue::EMPTY`].
pub fn bundle_trends(trends: Vec<Trend>) -> TrendBundle {
    let channel_numbers: Vec<ChannelNumber> = trends.iter().map(|t| t.channel_number).collect();
    let width = trends.len();

    if width == 1 {
        let mut bundle = TrendBundle::new(channel_numbers);
        for point in trends.into_iter().flat_map(|t| t.points) {
            bundle.push_row(point.timestamp, &[point.value]);
        }
        return bundle;
    }

    let mut rows: BTreeMap<Timestamp, Vec<ChannelValue>> = BTreeMap::new();
    for (column, trend) in trends.into_iter().enumerate() {
        for point in trend.points {
            rows.entry(point.timestamp)
                .or_insert_with(|| vec![ChannelValue::EMPTY; width])[column] = point.value;
        }
    }

    let mut bundle = TrendBundle::new(channel_numbers);
    for (timestamp, values) in rows {
        bundle.push_row(timestamp, &values);
    }
    bundle
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn ts(day: u32, h: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 10, day, h, 0, 0).unwrap()
    }

    fn trend(cnl: ChannelNumber, points: &[(Timestamp, f64)]) -> Trend {
        let mut trend = Trend::new(cnl);
        for &(t, v) in points {
            trend.push(t, ChannelValue::new(v, 1));
        }
        trend
    }

    #[test]
    fn test_merge_trends_concatenates_in_segment_order() {
        let d1 = trend(7, &[(ts(1, 1), 1.0), (ts(1, 2), 2.0)]);
        let d2 = trend(7, &[(ts(2, 1), 3.0), (ts(2, 2), 4.0)]);
        let merged = merge_trends(7, vec![d1, d2]);
        assert_eq!(
            merged.timestamps(),
            vec![ts(1, 1), ts(1, 2), ts(2, 1), ts(2, 2)]
        );
    }

    #[test]
    fn test_merge_trends_does_not_sort_overlaps() {
        let late = trend(7, &[(ts(2, 1), 3.0)]);
        let early = trend(7, &[(ts(1, 1), 1.0)]);
        let merged = merge_trends(7, vec![late, early]);
        assert_eq!(merged.timestamps(), vec![ts(2, 1), ts(1, 1)]);
    }

    #[test]
    fn test_merge_empty() {
        assert!(merge_trends(1, Vec::new()).is_empty());
        assert!(merge_segments::<u8>(Vec::new()).is_empty());
    }

    #[test]
    fn test_merge_bundles() {
        let mut a = TrendBundle::new(vec![1, 2]);
        a.push_row(ts(1, 1), &[ChannelValue::new(1.0, 1), ChannelValue::EMPTY]);
        let mut b = TrendBundle::new(vec![1, 2]);
        b.push_row(ts(2, 1), &[ChannelValue::new(2.0, 1), ChannelValue::new(3.0, 1)]);

        let merged = merge_bundles(&[1, 2], vec![a, b]);
        assert_eq!(merged.timestamps, vec![ts(1, 1), ts(2, 1)]);
        assert_eq!(merged.trends[1], vec![ChannelValue::EMPTY, ChannelValue::new(3.0, 1)]);
    }

    #[test]
    fn test_bundle_trends_aligns_on_timestamp_union() {
        let a = trend(1, &[(ts(1, 1), 1.0), (ts(1, 3), 3.0)]);
        let b = trend(2, &[(ts(1, 2), 20.0), (ts(1, 3), 30.0)]);
        let bundle = bundle_trends(vec![a, b]);

        assert_eq!(bundle.timestamps, vec![ts(1, 1), ts(1, 2), ts(1, 3)]);
        assert_eq!(
            bundle.column(1).unwrap(),
            &[
                ChannelValue::new(1.0, 1),
                ChannelValue::EMPTY,
                ChannelValue::new(3.0, 1)
            ]
        );
        assert_eq!(bundle.column(2).unwrap()[0], ChannelValue::EMPTY);
        assert_eq!(bundle.column(2).unwrap()[2], ChannelValue::new(30.0, 1));
    }

    proptest! {
        #[test]
        fn prop_merge_segments_preserves_order_and_length(
            segments in proptest::collection::vec(proptest::collection::vec(any::<u32>(), 0..20), 0..6)
        ) {
            let expected: Vec<u32> = segments.iter().flatten().copied().collect();
            let merged = merge_segments(segments);
            prop_assert_eq!(merged, expected);
        }
    }
}
