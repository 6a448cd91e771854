// The Result Ingestor. Parses the textual Go-benchmark output from one or
// more jobs into an in-memory tabular model keyed by (benchmark name, job),
// ready for statistical analysis by the reporting layer (out of scope here).

use std::collections::{HashMap, HashSet};

use regex::Regex;
use std::sync::LazyLock;

use crate::error::QueueError;
use crate::record::{JobId, JobStatus};

/// One replicate row as parsed straight off a `go test -bench` line, before
/// any per-job aggregation.
#[derive(Debug, Clone, PartialEq)]
struct ParsedRow {
    benchmark: String,
    value: f64,
    unit: String,
}

static BENCH_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(Benchmark\S+)(?:-\d+)?\s+(\d+)\s+(.*)$").unwrap()
});

static METRIC_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9]+(?:\.[0-9]+)?)\s+(\S+)").unwrap()
});

/// Parses one `go test -bench` textual report. Lines that don't look like a
/// benchmark result line are ignored (headers, `PASS`, `ok  pkg  1.2s`, ...).
fn parse_report(text: &str) -> Vec<ParsedRow> {
    let mut rows = Vec::new();
    for line in text.lines() {
        let Some(caps) = BENCH_LINE.captures(line) else {
            continue;
        };
        let benchmark = caps[1].to_string();
        let rest = &caps[3];
        for metric in METRIC_PAIR.captures_iter(rest) {
            let value: f64 = match metric[1].parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            let unit = metric[2].to_string();
            rows.push(ParsedRow {
                benchmark: benchmark.clone(),
                value,
                unit,
            });
        }
    }
    rows
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
    pub benchmark: String,
    pub job: JobId,
    pub replicates: Vec<f64>,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl MetricRow {
    fn from_replicates(benchmark: String, job: JobId, replicates: Vec<f64>) -> Self {
        let mean = replicates.iter().sum::<f64>() / replicates.len() as f64;
        let min = replicates.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = replicates.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        Self { benchmark, job, replicates, mean, min, max }
    }

    /// Derives the reciprocal-domain row (e.g. ns/op -> ops/sec). Per the
    /// spec this is the mean of the per-replicate reciprocals, not the
    /// reciprocal of the mean — and min/max swap because a smaller time is a
    /// larger rate.
    fn derive_rate(&self, scale: f64) -> Self {
        let inverted: Vec<f64> = self.replicates.iter().map(|v| scale / v).collect();
        let mean = inverted.iter().sum::<f64>() / inverted.len() as f64;
        let min = inverted.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = inverted.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        Self {
            benchmark: self.benchmark.clone(),
            job: self.job,
            replicates: inverted,
            mean,
            min,
            max,
        }
    }
}

/// A table keyed by benchmark name, each entry holding one row per job, in
/// caller-supplied job order.
#[derive(Debug, Default, Clone)]
pub struct MetricTable {
    pub rows: HashMap<String, Vec<MetricRow>>,
}

impl MetricTable {
    fn push(&mut self, row: MetricRow) {
        self.rows.entry(row.benchmark.clone()).or_default().push(row);
    }
}

pub struct DataTable {
    pub time_per_op: Option<MetricTable>,
    pub speed: Option<MetricTable>,
}

pub struct JobResults {
    pub job: JobId,
    pub status: JobStatus,
    pub results_text: String,
}

/// Builds the time-per-op and speed tables from a list of jobs' results.
/// Jobs must be in the terminal statuses `Succeeded` or `Failed` (a job
/// still `Submitted`/`Running` makes the whole call reject with
/// `ErrNotFinal`). Duplicate job ids are rejected outright.
pub fn ingest(jobs: &[JobResults]) -> Result<DataTable, QueueError> {
    if jobs.is_empty() {
        return Err(QueueError::NotFound("no job ids supplied".to_owned()));
    }

    let mut seen = HashSet::new();
    for j in jobs {
        if !seen.insert(j.job) {
            return Err(QueueError::DuplicateJobs);
        }
        if !matches!(j.status, JobStatus::Succeeded | JobStatus::Failed) {
            return Err(QueueError::NotFinal(j.job.to_string()));
        }
    }

    let mut time_per_op = MetricTable::default();
    let mut speed = MetricTable::default();
    let mut have_time = false;
    let mut have_speed = false;

    for j in jobs {
        let parsed = parse_report(&j.results_text);

        let mut by_benchmark: HashMap<String, (Vec<f64>, Vec<f64>)> = HashMap::new();
        for row in parsed {
            let entry = by_benchmark.entry(row.benchmark.clone()).or_default();
            match row.unit.as_str() {
                "ns/op" => entry.0.push(row.value),
                "MB/s" => entry.1.push(row.value),
                other => {
                    log::warn!("ignoring unrecognized benchmark unit {other:?} for {}", row.benchmark);
                }
            }
        }

        for (benchmark, (ns_values, mb_values)) in by_benchmark {
            if !ns_values.is_empty() {
                have_time = true;
                time_per_op.push(MetricRow::from_replicates(benchmark.clone(), j.job, ns_values));
            }
            if !mb_values.is_empty() {
                have_speed = true;
                speed.push(MetricRow::from_replicates(benchmark, j.job, mb_values));
            }
        }
    }

    Ok(DataTable {
        time_per_op: have_time.then_some(time_per_op),
        speed: have_speed.then_some(speed),
    })
}

/// Derives an ops/sec (or msg/sec — identical derivation) table from a
/// time-per-op table. `1e9` converts nanoseconds to seconds.
pub fn derive_rate_table(time_per_op: &MetricTable) -> MetricTable {
    let mut out = MetricTable::default();
    for (benchmark, rows) in &time_per_op.rows {
        for row in rows {
            out.rows.entry(benchmark.clone()).or_default().push(row.derive_rate(1e9));
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Significance {
    Significant,
    Inconclusive,
}

pub struct ComparisonRow {
    pub benchmark: String,
    pub delta_pct: f64,
    pub significance: Significance,
}

/// Alpha threshold for the Mann-Whitney U significance test, matched to the
/// original benchstat-derived confidence level.
const DELTA_TEST_ALPHA: f64 = 0.05;

/// Compares two tables (e.g. baseline vs candidate), one row per benchmark
/// present in both. `invert_sign` is used for rate-derived tables, whose
/// delta sign is the inverse of the underlying time-per-op table's.
pub fn compare(baseline: &MetricTable, candidate: &MetricTable, invert_sign: bool) -> Vec<ComparisonRow> {
    let mut out = Vec::new();
    for (benchmark, base_rows) in &baseline.rows {
        let Some(cand_rows) = candidate.rows.get(benchmark) else {
            continue;
        };
        let Some(base) = base_rows.first() else { continue };
        let Some(cand) = cand_rows.first() else { continue };

        let mut delta_pct = (cand.mean - base.mean) / base.mean * 100.0;
        if invert_sign {
            delta_pct = -delta_pct;
        }

        let significance = if mann_whitney_significant(&base.replicates, &cand.replicates, DELTA_TEST_ALPHA) {
            Significance::Significant
        } else {
            Significance::Inconclusive
        };

        out.push(ComparisonRow {
            benchmark: benchmark.clone(),
            delta_pct,
            significance,
        });
    }
    out
}

/// A small self-contained Mann-Whitney U test. Returns true when the rank-sum
/// difference between the two samples is large enough, at the given alpha,
/// to reject the null hypothesis that they come from the same distribution.
/// This mirrors the "~" (inconclusive) vs significant delta classification
/// reports display; it is not a general-purpose statistics library.
fn mann_whitney_significant(a: &[f64], b: &[f64], alpha: f64) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let n1 = a.len() as f64;
    let n2 = b.len() as f64;

    let mut combined: Vec<(f64, usize)> = a.iter().map(|&v| (v, 0)).chain(b.iter().map(|&v| (v, 1))).collect();
    combined.sort_by(|x, y| x.0.partial_cmp(&y.0).unwrap());

    let mut ranks = vec![0.0; combined.len()];
    let mut i = 0;
    while i < combined.len() {
        let mut j = i;
        while j + 1 < combined.len() && combined[j + 1].0 == combined[i].0 {
            j += 1;
        }
        let avg_rank = ((i + 1) + (j + 1)) as f64 / 2.0;
        for r in ranks.iter_mut().take(j + 1).skip(i) {
            *r = avg_rank;
        }
        i = j + 1;
    }

    let rank_sum_a: f64 = combined
        .iter()
        .zip(ranks.iter())
        .filter(|((_, group), _)| *group == 0)
        .map(|(_, r)| r)
        .sum();

    let u1 = rank_sum_a - n1 * (n1 + 1.0) / 2.0;
    let u2 = n1 * n2 - u1;
    let u = u1.min(u2);

    // Normal approximation to the U distribution; fine for the replicate
    // counts this system deals with (tens, not twos).
    let mean_u = n1 * n2 / 2.0;
    let std_u = (n1 * n2 * (n1 + n2 + 1.0) / 12.0).sqrt();
    if std_u == 0.0 {
        return false;
    }
    let z = (u - mean_u).abs() / std_u;
    let critical_z = normal_critical_value(alpha);
    z > critical_z
}

/// Two-tailed critical z value for the given alpha. Only the common
/// confidence levels are supported; anything else falls back to 0.05's.
fn normal_critical_value(alpha: f64) -> f64 {
    if (alpha - 0.01).abs() < f64::EPSILON {
        2.576
    } else if (alpha - 0.10).abs() < f64::EPSILON {
        1.645
    } else {
        1.96
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn parses_standard_bench_line() {
        let rows = parse_report("BenchmarkFoo-8   1000000   1234 ns/op   512 MB/s\n");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].benchmark, "BenchmarkFoo");
        assert_eq!(rows[0].value, 1234.0);
        assert_eq!(rows[0].unit, "ns/op");
        assert_eq!(rows[1].unit, "MB/s");
    }

    #[test]
    fn ignores_non_benchmark_lines() {
        let rows = parse_report("goos: linux\nPASS\nok  \tpkg\t1.234s\n");
        assert!(rows.is_empty());
    }

    #[test]
    fn derived_rate_table_uses_mean_of_reciprocals() {
        // Scenario 5 from the spec: replicate times [2_000_000, 4_000_000] ns/op.
        let job = Uuid::new_v4();
        let results = "BenchmarkFoo-8  1  2000000 ns/op\nBenchmarkFoo-8  1  4000000 ns/op\n";
        let jobs = [JobResults { job, status: JobStatus::Succeeded, results_text: results.to_owned() }];
        let table = ingest(&jobs).unwrap();
        let time = table.time_per_op.expect("time table present");
        let row = &time.rows["BenchmarkFoo"][0];
        assert_eq!(row.mean, 3_000_000.0);

        let rate = derive_rate_table(&time);
        let rate_row = &rate.rows["BenchmarkFoo"][0];
        assert_eq!(rate_row.replicates, vec![500.0, 250.0]);
        assert_eq!(rate_row.min, 250.0);
        assert_eq!(rate_row.max, 500.0);
        assert_eq!(rate_row.mean, 375.0);
    }

    #[test]
    fn rejects_duplicate_job_ids() {
        let job = Uuid::new_v4();
        let jobs = [
            JobResults { job, status: JobStatus::Succeeded, results_text: String::new() },
            JobResults { job, status: JobStatus::Succeeded, results_text: String::new() },
        ];
        assert!(matches!(ingest(&jobs), Err(QueueError::DuplicateJobs)));
    }

    #[test]
    fn rejects_non_terminal_jobs() {
        let job = Uuid::new_v4();
        let jobs = [JobResults { job, status: JobStatus::Running, results_text: String::new() }];
        assert!(matches!(ingest(&jobs), Err(QueueError::NotFinal(_))));
    }

    #[test]
    fn requires_at_least_one_job() {
        assert!(ingest(&[]).is_err());
    }
}
