//! Per-day metric aggregation and time-series resampling.
//!
//! Three aggregators derive daily [`MetricPayload`] slices from the raw
//! tables: cumulative complexity + change frequency from code changes,
//! open/closed counts + mean age from issues, and merge counts + cumulative
//! age from pull requests. Each writes only its own payload fields, so they
//! can run in any order after ingestion completes.
//!
//! Aggregation reads committed rows in timestamp order, which makes the
//! cumulative sums deterministic regardless of how ingestion tasks were
//! parallelized.

use anyhow::Result;
use chrono::{Datelike, Duration, NaiveDate, Utc};
use sqlx::SqlitePool;
use std::collections::BTreeMap;

use crate::models::{CodeChange, Issue, MetricPayload, MetricPoint, Project, PullRequest};
use crate::store;

// ---------------- complexity ----------------

/// Per-day cumulative complexity and commit count derived from a
/// timestamp-ordered change stream, seeded with the running total from
/// before the window.
pub fn complexity_by_day(seed: i64, changes: &[CodeChange]) -> BTreeMap<NaiveDate, (i64, i64)> {
    let mut days: BTreeMap<NaiveDate, (i64, i64)> = BTreeMap::new();
    let mut total = seed;
    let mut last_commit: Option<(NaiveDate, String)> = None;

    for change in changes {
        let day = change.timestamp.with_timezone(&Utc).date_naive();

        total += change.complexity_added;
        total -= change.complexity_removed;

        let entry = days.entry(day).or_insert((0, 0));
        entry.0 = total;

        // one count per distinct commit, not per touched file
        let commit_key = (day, change.commit_hash.clone());
        if last_commit.as_ref() != Some(&commit_key) {
            entry.1 += 1;
            last_commit = Some(commit_key);
        }
    }

    days
}

/// Compute and persist daily complexity / change-frequency metrics from
/// `start_date` (or the first recorded change). Days without changes carry
/// the previous day's complexity with a change frequency of 0.
pub async fn aggregate_complexity(
    pool: &SqlitePool,
    project: &Project,
    start_date: Option<NaiveDate>,
) -> Result<()> {
    log::info!(
        "Project({}): Starting aggregate_complexity ({:?}).",
        project.slug,
        start_date
    );

    let since = start_date.and_then(|d| d.and_hms_opt(0, 0, 0)).map(|d| d.and_utc());
    let changes = store::code_changes_since(pool, &project.id, since).await?;

    let fill_start = match start_date.or_else(|| {
        changes
            .first()
            .map(|c| c.timestamp.with_timezone(&Utc).date_naive())
    }) {
        Some(d) => d,
        None => {
            log::info!("Project({}): no code changes to aggregate.", project.slug);
            return Ok(());
        }
    };

    // Seed with the last known complexity strictly before the window.
    let seed = store::last_metric_before(pool, &project.id, fill_start)
        .await?
        .and_then(|m| m.payload.complexity)
        .unwrap_or(0);

    let days = complexity_by_day(seed, &changes);

    let today = Utc::now().date_naive();
    let mut carry = seed;
    let mut day = fill_start;
    while day <= today {
        let (complexity, frequency) = match days.get(&day) {
            Some(&(c, f)) => {
                carry = c;
                (c, f)
            }
            None => (carry, 0),
        };

        store::upsert_metric_fields(
            pool,
            &project.id,
            day,
            &MetricPayload {
                complexity: Some(complexity),
                change_frequency: Some(frequency),
                ..Default::default()
            },
        )
        .await?;

        day += Duration::days(1);
    }

    log::info!("Project({}): Finished aggregate_complexity.", project.slug);
    Ok(())
}

// ---------------- issues ----------------

/// Daily issue aggregates for one calendar day, inclusive.
pub fn issue_stats_for_day(issues: &[Issue], day: NaiveDate) -> (i64, i64, f64) {
    let mut open_count = 0i64;
    let mut age_open = 0i64;
    let mut closed_count = 0i64;
    let mut age_closed = 0i64;
    let mut closed_today = 0i64;

    for issue in issues {
        let opened_day = issue.opened_at.date_naive();
        let closed_day = issue.closed_at.map(|c| c.date_naive());

        let is_open = opened_day <= day && closed_day.map(|c| c > day).unwrap_or(true);
        if is_open {
            open_count += 1;
            age_open += issue.age_at(day);
        }

        if let Some(closed) = closed_day {
            if closed <= day {
                closed_count += 1;
                age_closed += issue.age_at(day);
            }
            if closed == day {
                closed_today += 1;
            }
        }
    }

    let denominator = open_count + closed_count;
    let age = if denominator > 0 {
        (age_open + age_closed) as f64 / denominator as f64
    } else {
        0.0
    };

    (open_count, closed_today, age)
}

/// Compute and persist daily issue metrics over the project's whole issue
/// history.
pub async fn aggregate_issues(pool: &SqlitePool, project: &Project) -> Result<()> {
    log::info!("Project({}): Starting aggregate_issues.", project.slug);

    let issues = store::issues_for_project(pool, &project.id).await?;
    if issues.is_empty() {
        log::info!("Project({}): No issues found. Aborting.", project.slug);
        return Ok(());
    }

    let start = issues[0].opened_at.date_naive();
    let today = Utc::now().date_naive();

    let mut day = start;
    while day <= today {
        let (open, closed_today, age) = issue_stats_for_day(&issues, day);
        store::upsert_metric_fields(
            pool,
            &project.id,
            day,
            &MetricPayload {
                issues_open: Some(open),
                issues_closed: Some(closed_today),
                issue_age: Some(age),
                ..Default::default()
            },
        )
        .await?;
        day += Duration::days(1);
    }

    log::info!("Project({}): Finished aggregate_issues.", project.slug);
    Ok(())
}

// ---------------- pull requests ----------------

/// (merged count, cumulative open-time in seconds) for PRs merged on `day`.
pub fn pull_stats_for_day(pulls: &[PullRequest], day: NaiveDate) -> (i64, i64) {
    let mut merged = 0i64;
    let mut cumulative_secs = 0i64;

    for pull in pulls {
        if let Some(merged_at) = pull.merged_at {
            if merged_at.date_naive() == day {
                merged += 1;
                cumulative_secs += (merged_at - pull.opened_at).num_seconds().max(0);
            }
        }
    }

    (merged, cumulative_secs)
}

/// Compute and persist daily pull-request metrics over the project's whole
/// pull-request history.
pub async fn aggregate_pulls(pool: &SqlitePool, project: &Project) -> Result<()> {
    log::info!("Project({}): Starting aggregate_pulls.", project.slug);

    let pulls: Vec<PullRequest> = store::pull_requests_for_project(pool, &project.id)
        .await?
        .into_iter()
        .filter(|p| p.merged_at.is_some())
        .collect();
    if pulls.is_empty() {
        log::info!("Project({}): No pull requests found. Aborting.", project.slug);
        return Ok(());
    }

    let start = pulls[0].opened_at.date_naive();
    let today = Utc::now().date_naive();

    let mut day = start;
    while day <= today {
        let (merged, cumulative_secs) = pull_stats_for_day(&pulls, day);
        store::upsert_metric_fields(
            pool,
            &project.id,
            day,
            &MetricPayload {
                pulls_merged: Some(merged),
                pulls_cumulative_age: Some(cumulative_secs),
                ..Default::default()
            },
        )
        .await?;
        day += Duration::days(1);
    }

    log::info!("Project({}): Finished aggregate_pulls.", project.slug);
    Ok(())
}

// ---------------- resampling ----------------

/// Bucket width for a series, chosen from its date span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
}

impl Frequency {
    /// ≤ 90 days → daily, ≤ 1 year → weekly, ≤ 3 years → monthly,
    /// beyond → quarterly.
    pub fn for_span(days: i64) -> Frequency {
        if days <= 90 {
            Frequency::Daily
        } else if days <= 365 {
            Frequency::Weekly
        } else if days <= 1095 {
            Frequency::Monthly
        } else {
            Frequency::Quarterly
        }
    }

    fn bucket_key(&self, date: NaiveDate) -> (i32, u32) {
        match self {
            Frequency::Daily => (date.year(), date.ordinal()),
            Frequency::Weekly => {
                let week = date.iso_week();
                (week.year(), week.week())
            }
            Frequency::Monthly => (date.year(), date.month()),
            Frequency::Quarterly => (date.year(), (date.month() - 1) / 3),
        }
    }
}

/// Make a series contiguous and gap-free: one point per day between the
/// first and last date, forward-filling missing values and filling the
/// leading edge with zeros.
pub fn fill_daily(series: &[MetricPoint]) -> Vec<MetricPoint> {
    let (first, last) = match (series.first(), series.last()) {
        (Some(f), Some(l)) => (f.date, l.date),
        _ => return Vec::new(),
    };

    let by_date: BTreeMap<NaiveDate, &MetricPoint> =
        series.iter().map(|p| (p.date, p)).collect();

    let zero = MetricPayload {
        complexity: Some(0),
        change_frequency: Some(0),
        issues_open: Some(0),
        issues_closed: Some(0),
        issue_age: Some(0.0),
        pulls_merged: Some(0),
        pulls_cumulative_age: Some(0),
        ..Default::default()
    };

    let mut filled = Vec::new();
    let mut carry = zero;
    let mut day = first;
    while day <= last {
        let mut payload = carry.clone();
        // per-day quantities do not carry across days
        payload.change_frequency = Some(0);
        payload.issues_closed = Some(0);
        payload.pulls_merged = Some(0);
        payload.pulls_cumulative_age = Some(0);

        if let Some(point) = by_date.get(&day) {
            payload.merge(&point.payload);
        }

        carry = payload.clone();
        filled.push(MetricPoint {
            project_id: series[0].project_id.clone(),
            date: day,
            payload,
        });
        day += Duration::days(1);
    }

    filled
}

/// Resample a daily series to `frequency`. Point-in-time fields
/// (complexity, issue age, open issues) take the last value in each
/// bucket; event counts (closed issues, merged pulls) sum.
pub fn resample(series: &[MetricPoint], frequency: Frequency) -> Vec<MetricPoint> {
    let filled = fill_daily(series);
    if filled.is_empty() {
        return Vec::new();
    }

    let mut buckets: Vec<MetricPoint> = Vec::new();
    let mut current_key: Option<(i32, u32)> = None;

    for point in filled {
        let key = frequency.bucket_key(point.date);
        let is_new_bucket = current_key != Some(key);

        if is_new_bucket {
            buckets.push(point);
            current_key = Some(key);
            continue;
        }

        let bucket = buckets.last_mut().unwrap();
        bucket.date = point.date;
        bucket.payload.complexity = point.payload.complexity;
        bucket.payload.change_frequency = Some(
            bucket.payload.change_frequency.unwrap_or(0)
                + point.payload.change_frequency.unwrap_or(0),
        );
        bucket.payload.issues_open = point.payload.issues_open;
        bucket.payload.issue_age = point.payload.issue_age;
        bucket.payload.issues_closed = Some(
            bucket.payload.issues_closed.unwrap_or(0)
                + point.payload.issues_closed.unwrap_or(0),
        );
        bucket.payload.pulls_merged = Some(
            bucket.payload.pulls_merged.unwrap_or(0) + point.payload.pulls_merged.unwrap_or(0),
        );
        bucket.payload.pulls_cumulative_age = Some(
            bucket.payload.pulls_cumulative_age.unwrap_or(0)
                + point.payload.pulls_cumulative_age.unwrap_or(0),
        );
    }

    buckets
}

/// Read path: the project's metric series over a date range, resampled to
/// the frequency its span calls for.
pub async fn metrics_series(
    pool: &SqlitePool,
    project_id: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<MetricPoint>> {
    let points = store::metrics_in_range(pool, project_id, from, to).await?;
    let span = (to - from).num_days();
    Ok(resample(&points, Frequency::for_span(span)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, FixedOffset, TimeZone};
    use crate::models::IssueCategory;

    fn ts(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    fn change(hash: &str, when: &str, added: i64, removed: i64) -> CodeChange {
        CodeChange {
            project_id: "p1".to_string(),
            commit_hash: hash.to_string(),
            timestamp: ts(when),
            file_path: "src/main.rs".to_string(),
            author: "Dev <dev@example.com>".to_string(),
            complexity_added: added,
            complexity_removed: removed,
            description: String::new(),
        }
    }

    fn point(project: &str, date: &str, payload: MetricPayload) -> MetricPoint {
        MetricPoint {
            project_id: project.to_string(),
            date: date.parse().unwrap(),
            payload,
        }
    }

    #[test]
    fn single_root_commit_day() {
        let changes = vec![change("c1", "2024-05-01T12:00:00+00:00", 6, 0)];
        let days = complexity_by_day(0, &changes);
        let day: NaiveDate = "2024-05-01".parse().unwrap();
        assert_eq!(days.get(&day), Some(&(6, 1)));
    }

    #[test]
    fn reformat_leaves_complexity_unchanged() {
        let changes = vec![
            change("c1", "2024-05-01T12:00:00+00:00", 6, 0),
            change("c2", "2024-05-02T12:00:00+00:00", 10, 10),
        ];
        let days = complexity_by_day(0, &changes);
        let day1: NaiveDate = "2024-05-01".parse().unwrap();
        let day2: NaiveDate = "2024-05-02".parse().unwrap();
        assert_eq!(days.get(&day1).unwrap().0, 6);
        assert_eq!(days.get(&day2).unwrap().0, 6);
    }

    #[test]
    fn commit_counted_once_across_files() {
        let mut a = change("c1", "2024-05-01T12:00:00+00:00", 3, 0);
        a.file_path = "a.rs".to_string();
        let mut b = change("c1", "2024-05-01T12:00:00+00:00", 4, 0);
        b.file_path = "b.rs".to_string();
        let c = change("c2", "2024-05-01T13:00:00+00:00", 1, 0);

        let days = complexity_by_day(0, &[a, b, c]);
        let day: NaiveDate = "2024-05-01".parse().unwrap();
        assert_eq!(days.get(&day), Some(&(8, 2)));
    }

    #[test]
    fn seed_carries_prior_total() {
        let changes = vec![change("c1", "2024-05-01T12:00:00+00:00", 5, 2)];
        let days = complexity_by_day(100, &changes);
        let day: NaiveDate = "2024-05-01".parse().unwrap();
        assert_eq!(days.get(&day).unwrap().0, 103);
    }

    #[test]
    fn complexity_may_go_negative() {
        let changes = vec![change("c1", "2024-05-01T12:00:00+00:00", 0, 4)];
        let days = complexity_by_day(0, &changes);
        let day: NaiveDate = "2024-05-01".parse().unwrap();
        assert_eq!(days.get(&day).unwrap().0, -4);
    }

    fn issue(refid: i64, opened: &str, closed: Option<&str>) -> Issue {
        Issue {
            project_id: "p1".to_string(),
            issue_refid: refid,
            opened_at: Utc.from_utc_datetime(
                &format!("{}T00:00:00", opened)
                    .parse::<chrono::NaiveDateTime>()
                    .unwrap(),
            ),
            closed_at: closed.map(|c| {
                Utc.from_utc_datetime(
                    &format!("{}T00:00:00", c)
                        .parse::<chrono::NaiveDateTime>()
                        .unwrap(),
                )
            }),
            labels: vec![],
            category: IssueCategory::Change,
        }
    }

    #[test]
    fn issue_stats_count_open_and_closed() {
        let issues = vec![
            issue(1, "2024-01-01", Some("2024-01-11")),
            issue(2, "2024-01-03", None),
        ];

        // Jan 5: both open, ages 4 and 2
        let day: NaiveDate = "2024-01-05".parse().unwrap();
        let (open, closed_today, age) = issue_stats_for_day(&issues, day);
        assert_eq!(open, 2);
        assert_eq!(closed_today, 0);
        assert!((age - 3.0).abs() < f64::EPSILON);

        // Jan 11: issue 1 closes (age 10), issue 2 open (age 8)
        let day: NaiveDate = "2024-01-11".parse().unwrap();
        let (open, closed_today, age) = issue_stats_for_day(&issues, day);
        assert_eq!(open, 1);
        assert_eq!(closed_today, 1);
        assert!((age - 9.0).abs() < f64::EPSILON);

        // Jan 20: closed issue age frozen at 10, open issue age 17
        let day: NaiveDate = "2024-01-20".parse().unwrap();
        let (_, _, age) = issue_stats_for_day(&issues, day);
        assert!((age - 13.5).abs() < f64::EPSILON);
    }

    #[test]
    fn issue_stats_empty_day_is_zero() {
        let issues = vec![issue(1, "2024-06-01", None)];
        let day: NaiveDate = "2024-01-01".parse().unwrap();
        let (open, closed_today, age) = issue_stats_for_day(&issues, day);
        assert_eq!((open, closed_today), (0, 0));
        assert_eq!(age, 0.0);
    }

    fn pull(refid: i64, opened: &str, merged: Option<&str>) -> PullRequest {
        let parse = |s: &str| s.parse::<chrono::DateTime<Utc>>().unwrap();
        PullRequest {
            project_id: "p1".to_string(),
            pull_refid: refid,
            opened_at: parse(opened),
            merged_at: merged.map(parse),
            age_days: 0,
        }
    }

    #[test]
    fn pull_stats_sum_seconds_for_merge_day() {
        let pulls = vec![
            pull(1, "2024-02-01T00:00:00Z", Some("2024-02-03T00:00:00Z")),
            pull(2, "2024-02-02T00:00:00Z", Some("2024-02-03T12:00:00Z")),
            pull(3, "2024-02-01T00:00:00Z", None),
        ];
        let day: NaiveDate = "2024-02-03".parse().unwrap();
        let (merged, secs) = pull_stats_for_day(&pulls, day);
        assert_eq!(merged, 2);
        // 2 days + 1.5 days
        assert_eq!(secs, 2 * 86400 + 86400 + 43200);
    }

    #[test]
    fn frequency_chosen_by_span() {
        assert_eq!(Frequency::for_span(30), Frequency::Daily);
        assert_eq!(Frequency::for_span(90), Frequency::Daily);
        assert_eq!(Frequency::for_span(91), Frequency::Weekly);
        assert_eq!(Frequency::for_span(365), Frequency::Weekly);
        assert_eq!(Frequency::for_span(366), Frequency::Monthly);
        assert_eq!(Frequency::for_span(1095), Frequency::Monthly);
        assert_eq!(Frequency::for_span(1096), Frequency::Quarterly);
    }

    #[test]
    fn fill_daily_forward_fills_gaps() {
        let series = vec![
            point(
                "p1",
                "2024-03-01",
                MetricPayload {
                    complexity: Some(10),
                    change_frequency: Some(2),
                    ..Default::default()
                },
            ),
            point(
                "p1",
                "2024-03-04",
                MetricPayload {
                    complexity: Some(12),
                    change_frequency: Some(1),
                    ..Default::default()
                },
            ),
        ];

        let filled = fill_daily(&series);
        assert_eq!(filled.len(), 4);
        assert_eq!(filled[1].payload.complexity, Some(10));
        assert_eq!(filled[1].payload.change_frequency, Some(0));
        assert_eq!(filled[2].payload.complexity, Some(10));
        assert_eq!(filled[3].payload.complexity, Some(12));
    }

    #[test]
    fn daily_resample_is_identity_on_present_days() {
        let series = vec![
            point(
                "p1",
                "2024-03-01",
                MetricPayload {
                    complexity: Some(10),
                    issues_open: Some(1),
                    ..Default::default()
                },
            ),
            point(
                "p1",
                "2024-03-02",
                MetricPayload {
                    complexity: Some(11),
                    issues_open: Some(2),
                    ..Default::default()
                },
            ),
        ];

        let resampled = resample(&series, Frequency::Daily);
        assert_eq!(resampled.len(), 2);
        assert_eq!(resampled[0].date, series[0].date);
        assert_eq!(resampled[0].payload.complexity, Some(10));
        assert_eq!(resampled[1].payload.complexity, Some(11));
        assert_eq!(resampled[1].payload.issues_open, Some(2));
    }

    #[test]
    fn weekly_resample_takes_last_and_sums() {
        // Mon 2024-03-04 .. Sun 2024-03-10 is one ISO week
        let series = vec![
            point(
                "p1",
                "2024-03-04",
                MetricPayload {
                    complexity: Some(10),
                    issues_closed: Some(1),
                    pulls_merged: Some(1),
                    ..Default::default()
                },
            ),
            point(
                "p1",
                "2024-03-06",
                MetricPayload {
                    complexity: Some(20),
                    issues_closed: Some(2),
                    pulls_merged: Some(1),
                    ..Default::default()
                },
            ),
            point(
                "p1",
                "2024-03-11",
                MetricPayload {
                    complexity: Some(30),
                    issues_closed: Some(1),
                    ..Default::default()
                },
            ),
        ];

        let resampled = resample(&series, Frequency::Weekly);
        assert_eq!(resampled.len(), 2);
        // first bucket: complexity last (carried 20 through Sunday), sums over the week
        assert_eq!(resampled[0].payload.complexity, Some(20));
        assert_eq!(resampled[0].payload.issues_closed, Some(3));
        assert_eq!(resampled[0].payload.pulls_merged, Some(2));
        assert_eq!(resampled[1].payload.complexity, Some(30));
    }
}
