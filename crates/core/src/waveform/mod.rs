use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{error::DataError, Result};

/// How the loader treats a line it cannot use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParsePolicy {
    /// Any malformed line aborts the load.
    #[default]
    Strict,
    /// Malformed lines are skipped and recorded, as long as one valid line remains.
    Lenient,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: f64,
    pub value: f64,
}

/// A line dropped under [`ParsePolicy::Lenient`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedLine {
    pub line: usize,
    pub content: String,
    pub reason: String,
}

/// Time-ordered samples read from one waveform file.
///
/// Times are finite and strictly increasing, and the series is never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSeries {
    samples: Vec<Sample>,
    source: Option<PathBuf>,
    skipped: Vec<SkippedLine>,
}

impl SampleSeries {
    /// Builds a series from in-memory samples, checking the ordering invariant.
    pub fn from_samples(samples: Vec<Sample>) -> Result<Self> {
        let origin = "in-memory series".to_string();
        if samples.is_empty() {
            return Err(DataError::Empty { origin }.into());
        }
        if let Some(line) = samples
            .iter()
            .position(|sample| !sample.time.is_finite() || !sample.value.is_finite())
        {
            return Err(DataError::Malformed {
                origin,
                line: line + 1,
                content: format!("{:?}", samples[line]),
            }
            .into());
        }
        for (index, pair) in samples.windows(2).enumerate() {
            if pair[1].time <= pair[0].time {
                return Err(DataError::NonIncreasing {
                    origin,
                    line: index + 2,
                    time: pair[1].time,
                    previous: pair[0].time,
                }
                .into());
            }
        }
        Ok(Self {
            samples,
            source: None,
            skipped: Vec::new(),
        })
    }

    /// Samples in time order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Always false for a constructed series.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Earliest sample. Never absent, a series holds at least one sample.
    pub fn first(&self) -> Sample {
        self.samples[0]
    }

    /// Latest sample.
    pub fn last(&self) -> Sample {
        self.samples[self.samples.len() - 1]
    }

    /// File the series was loaded from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Printable name of where the samples came from.
    pub fn origin(&self) -> String {
        match &self.source {
            Some(path) => path.display().to_string(),
            None => "in-memory series".to_string(),
        }
    }

    /// Lines that were dropped while loading.
    pub fn skipped(&self) -> &[SkippedLine] {
        &self.skipped
    }

    /// Mean of the consecutive time differences.
    pub fn mean_interval(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let sum: f64 = self
            .samples
            .windows(2)
            .map(|pair| pair[1].time - pair[0].time)
            .sum();
        sum / (self.samples.len() - 1) as f64
    }

    /// Linear interpolation at `time`, holding the boundary values outside the
    /// series' domain.
    pub fn interpolate(&self, time: f64) -> f64 {
        let first = self.first();
        let last = self.last();
        if time <= first.time {
            return first.value;
        }
        if time >= last.time {
            return last.value;
        }
        // First sample strictly after `time`; guaranteed to be in 1..len.
        let upper = self.samples.partition_point(|sample| sample.time <= time);
        let right = self.samples[upper];
        let left = self.samples[upper - 1];
        let span = right.time - left.time;
        left.value + (right.value - left.value) * (time - left.time) / span
    }
}

/// Reads two-column `<time> <value>` waveform files.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaveformLoader {
    policy: ParsePolicy,
}

impl WaveformLoader {
    pub fn new(policy: ParsePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ParsePolicy {
        self.policy
    }

    /// Loads a waveform file from disk.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<SampleSeries> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| DataError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let mut series = self.parse(BufReader::new(file), &path.display().to_string())?;
        series.source = Some(path.to_path_buf());
        tracing::debug!(
            path = %path.display(),
            points = series.len(),
            start = series.first().time,
            end = series.last().time,
            skipped = series.skipped.len(),
            "loaded waveform"
        );
        Ok(series)
    }

    /// Parses waveform text from any buffered reader. `origin` names the data
    /// in error messages.
    pub fn parse<R: BufRead>(&self, reader: R, origin: &str) -> Result<SampleSeries> {
        let mut samples: Vec<Sample> = Vec::new();
        let mut skipped = Vec::new();

        for (index, line) in reader.lines().enumerate() {
            let line_number = index + 1;
            let line = line.map_err(|source| DataError::Unreadable {
                path: PathBuf::from(origin),
                source,
            })?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let previous = samples.last().map(|sample| sample.time);
            let rejection = match parse_line(trimmed) {
                Some(sample) => match previous {
                    Some(previous) if sample.time <= previous => {
                        if self.policy == ParsePolicy::Strict {
                            return Err(DataError::NonIncreasing {
                                origin: origin.to_string(),
                                line: line_number,
                                time: sample.time,
                                previous,
                            }
                            .into());
                        }
                        format!("time {} does not increase past {previous}", sample.time)
                    }
                    _ => {
                        samples.push(sample);
                        continue;
                    }
                },
                None => {
                    if self.policy == ParsePolicy::Strict {
                        return Err(DataError::Malformed {
                            origin: origin.to_string(),
                            line: line_number,
                            content: trimmed.to_string(),
                        }
                        .into());
                    }
                    "expected two finite numbers".to_string()
                }
            };

            tracing::warn!(
                origin,
                line = line_number,
                content = trimmed,
                %rejection,
                "skipping waveform line"
            );
            skipped.push(SkippedLine {
                line: line_number,
                content: trimmed.to_string(),
                reason: rejection,
            });
        }

        if samples.is_empty() {
            return Err(DataError::Empty {
                origin: origin.to_string(),
            }
            .into());
        }

        Ok(SampleSeries {
            samples,
            source: None,
            skipped,
        })
    }
}

fn parse_line(line: &str) -> Option<Sample> {
    let mut fields = line.split_whitespace();
    let time = fields.next()?.parse::<f64>().ok()?;
    let value = fields.next()?.parse::<f64>().ok()?;
    if fields.next().is_some() || !time.is_finite() || !value.is_finite() {
        return None;
    }
    Some(Sample { time, value })
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use super::*;
    use crate::ModalError;

    fn parse(policy: ParsePolicy, text: &str) -> Result<SampleSeries> {
        WaveformLoader::new(policy).parse(Cursor::new(text), "test")
    }

    #[test]
    fn parses_pairs_and_skips_blank_lines() {
        let series = parse(ParsePolicy::Strict, "0.0 1.5\n\n  \n1e-3 -2\n0.002\t0.25\n").unwrap();

        assert_eq!(series.len(), 3);
        assert_eq!(series.first(), Sample { time: 0.0, value: 1.5 });
        assert_eq!(series.last(), Sample { time: 0.002, value: 0.25 });
        assert!(series.skipped().is_empty());
    }

    #[test]
    fn strict_policy_rejects_malformed_line() {
        let err = parse(ParsePolicy::Strict, "0 1\nabc 2\n2 3\n").unwrap_err();
        match err {
            ModalError::Data(DataError::Malformed { line, content, .. }) => {
                assert_eq!(line, 2);
                assert_eq!(content, "abc 2");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn strict_policy_rejects_single_column_and_non_finite() {
        assert!(parse(ParsePolicy::Strict, "0 1\n1\n").is_err());
        assert!(parse(ParsePolicy::Strict, "0 1\n1 nan\n").is_err());
        assert!(parse(ParsePolicy::Strict, "0 1\n1 2 3\n").is_err());
    }

    #[test]
    fn lenient_policy_records_skipped_lines() {
        let series = parse(ParsePolicy::Lenient, "0 1\nbad line\n1 2\n0.5 9\n2 3\n").unwrap();

        assert_eq!(series.len(), 3);
        let skipped: Vec<usize> = series.skipped().iter().map(|s| s.line).collect();
        assert_eq!(skipped, vec![2, 4]);
        assert_eq!(series.skipped()[0].content, "bad line");
    }

    #[test]
    fn lenient_policy_still_requires_one_valid_line() {
        let err = parse(ParsePolicy::Lenient, "x y\nz\n").unwrap_err();
        assert!(matches!(err, ModalError::Data(DataError::Empty { .. })));
    }

    #[test]
    fn strict_policy_rejects_repeated_time() {
        let err = parse(ParsePolicy::Strict, "0 1\n0 2\n").unwrap_err();
        assert!(matches!(err, ModalError::Data(DataError::NonIncreasing { line: 2, .. })));
    }

    #[test]
    fn empty_input_is_an_error() {
        let err = parse(ParsePolicy::Strict, "\n\n").unwrap_err();
        assert!(matches!(err, ModalError::Data(DataError::Empty { .. })));
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.dat");
        let err = WaveformLoader::default().load(&path).unwrap_err();

        assert!(matches!(err, ModalError::Data(DataError::Unreadable { .. })));
        assert!(err.to_string().contains("missing.dat"));
    }

    #[test]
    fn loads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0 0").unwrap();
        writeln!(file, "0.5 1").unwrap();
        writeln!(file, "1.0 0").unwrap();

        let series = WaveformLoader::default().load(file.path()).unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series.source(), Some(file.path()));
        assert!((series.mean_interval() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn interpolates_and_clamps() {
        let series = parse(ParsePolicy::Strict, "0 0\n1 2\n2 4\n").unwrap();

        assert_eq!(series.interpolate(-1.0), 0.0);
        assert_eq!(series.interpolate(0.5), 1.0);
        assert_eq!(series.interpolate(1.0), 2.0);
        assert_eq!(series.interpolate(1.5), 3.0);
        assert_eq!(series.interpolate(9.0), 4.0);
    }

    #[test]
    fn from_samples_checks_ordering() {
        let samples = vec![
            Sample { time: 1.0, value: 0.0 },
            Sample { time: 0.5, value: 0.0 },
        ];
        assert!(SampleSeries::from_samples(samples).is_err());
        assert!(SampleSeries::from_samples(Vec::new()).is_err());
    }
}
