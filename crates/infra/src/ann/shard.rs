//! Day-sharded index naming and multi-shard result merging.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use super::service::{AnnError, Hit};

const DAY_FORMAT: &str = "%Y-%m-%d";

/// Widest span, in days, one search may fan out over.
pub const MAX_SEARCH_DAYS: i64 = 366;

/// `prefix` followed by the UTC calendar day of `at`.
pub fn index_name<Tz: TimeZone>(prefix: &str, at: &DateTime<Tz>) -> String {
    format!("{prefix}{}", day_of(at).format(DAY_FORMAT))
}

/// UTC calendar day of `at`.
pub fn day_of<Tz: TimeZone>(at: &DateTime<Tz>) -> NaiveDate {
    at.with_timezone(&Utc).date_naive()
}

/// Day encoded in a shard name, `None` for names not produced by [`index_name`].
pub fn index_day(name: &str, prefix: &str) -> Option<NaiveDate> {
    let day = name.strip_prefix(prefix)?;
    NaiveDate::parse_from_str(day, DAY_FORMAT).ok()
}

/// Every UTC day from `from` to `to`, both inclusive. Empty when `from > to`.
///
/// Spans wider than [`MAX_SEARCH_DAYS`] are rejected before anything is allocated.
pub fn days_in_range(from: NaiveDate, to: NaiveDate) -> Result<Vec<NaiveDate>, AnnError> {
    let days = to.signed_duration_since(from).num_days() + 1;
    if days > MAX_SEARCH_DAYS {
        return Err(AnnError::RangeTooWide {
            days,
            max: MAX_SEARCH_DAYS,
        });
    }
    Ok(from.iter_days().take_while(|day| *day <= to).collect())
}

/// Flatten per-shard results, keep hits within `threshold` and sort by
/// distance, then id. NaN distances never pass the threshold.
pub fn merge_hits<I>(per_shard: I, threshold: f32) -> Vec<Hit>
where
    I: IntoIterator<Item = Vec<Hit>>,
{
    let mut hits: Vec<Hit> = per_shard
        .into_iter()
        .flatten()
        .filter(|hit| hit.distance <= threshold)
        .collect();
    hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use proptest::prelude::*;

    #[test]
    fn name_uses_the_utc_day() {
        let at = Utc.with_ymd_and_hms(2023, 7, 4, 23, 59, 59).unwrap();
        assert_eq!(index_name("news-", &at), "news-2023-07-04");
    }

    #[test]
    fn name_is_stable_across_offsets_on_the_same_utc_day() {
        // 00:30 in Berlin (CET, UTC+1) is 23:30 UTC on the previous day.
        let berlin = FixedOffset::east_opt(3600).unwrap();
        let local = berlin.with_ymd_and_hms(2024, 1, 15, 0, 30, 0).unwrap();
        let utc = Utc.with_ymd_and_hms(2024, 1, 14, 23, 30, 0).unwrap();

        assert_eq!(index_name("idx_", &local), "idx_2024-01-14");
        assert_eq!(index_name("idx_", &local), index_name("idx_", &utc));
    }

    #[test]
    fn parses_day_back_from_name() {
        assert_eq!(
            index_day("idx_2024-02-29", "idx_"),
            NaiveDate::from_ymd_opt(2024, 2, 29)
        );
        assert_eq!(index_day("other_2024-02-29", "idx_"), None);
        assert_eq!(index_day("idx_latest", "idx_"), None);
    }

    #[test]
    fn day_range_is_inclusive() {
        let d = |day| NaiveDate::from_ymd_opt(2024, 2, day).unwrap();
        assert_eq!(days_in_range(d(28), d(29)).unwrap(), vec![d(28), d(29)]);
        assert_eq!(days_in_range(d(3), d(3)).unwrap(), vec![d(3)]);
        assert!(days_in_range(d(4), d(3)).unwrap().is_empty());
        assert!(days_in_range(NaiveDate::MAX, NaiveDate::MIN).unwrap().is_empty());
    }

    #[test]
    fn day_range_is_capped() {
        let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let leap_year_end = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
        assert_eq!(days_in_range(from, leap_year_end).unwrap().len(), 366);

        let next = leap_year_end.succ_opt().unwrap();
        assert!(matches!(
            days_in_range(from, next),
            Err(AnnError::RangeTooWide { days: 367, max: MAX_SEARCH_DAYS })
        ));
        assert!(matches!(
            days_in_range(NaiveDate::MIN, NaiveDate::MAX),
            Err(AnnError::RangeTooWide { .. })
        ));
    }

    #[test]
    fn merge_filters_and_sorts() {
        let hit = |id, distance| Hit { id, distance };
        let merged = merge_hits(
            vec![
                vec![hit(3, 0.6), hit(1, 0.1), hit(2, 0.3)],
                vec![hit(7, 0.3), hit(4, 0.2), hit(9, f32::NAN)],
            ],
            0.5,
        );
        let ids: Vec<_> = merged.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![1, 4, 2, 7]);
    }

    proptest! {
        #[test]
        fn merged_hits_are_sorted_and_bounded(
            shards in prop::collection::vec(
                prop::collection::vec((0i64..1000, 0.0f32..2.0), 0..20),
                0..5,
            ),
            threshold in 0.0f32..2.0,
        ) {
            let per_shard: Vec<Vec<Hit>> = shards
                .iter()
                .map(|s| s.iter().map(|&(id, distance)| Hit { id, distance }).collect())
                .collect();
            let expected = per_shard
                .iter()
                .flatten()
                .filter(|h| h.distance <= threshold)
                .count();

            let merged = merge_hits(per_shard, threshold);

            prop_assert_eq!(merged.len(), expected);
            prop_assert!(merged.iter().all(|h| h.distance <= threshold));
            for pair in merged.windows(2) {
                prop_assert!((pair[0].distance, pair[0].id) <= (pair[1].distance, pair[1].id));
            }
        }
    }
}
