use serde::{Deserialize, Serialize};

use crate::{error::DataError, Result, SampleSeries};

/// Outcome of peak normalization for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Normalization {
    /// Divided by the given peak absolute value.
    Scaled { peak: f64 },
    /// The channel was identically zero and left untouched.
    Skipped,
}

impl Normalization {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// Two channels resampled onto one time base, ready for upload.
///
/// Both channels hold exactly `point_count` values. Each channel either peaks
/// at 1.0 in absolute value or is flagged as [`Normalization::Skipped`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedPair {
    pub channel1: Vec<f32>,
    pub channel2: Vec<f32>,
    pub sample_rate: f64,
    pub point_count: usize,
    /// Unified time axis in seconds. Diagnostic only; never sent to the device.
    pub time_axis: Vec<f64>,
    pub normalization: [Normalization; 2],
}

impl AlignedPair {
    /// Repetition frequency of the whole waveform when played at `sample_rate`.
    pub fn fundamental_frequency(&self) -> f64 {
        self.sample_rate / self.point_count as f64
    }

    /// Spacing of the unified time axis.
    pub fn interval(&self) -> f64 {
        1.0 / self.sample_rate
    }
}

/// Builds a common time base for two series and resamples both onto it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Aligner;

impl Aligner {
    pub fn new() -> Self {
        Self
    }

    /// Aligns `first` and `second`, optionally negating the second channel.
    pub fn align(
        &self,
        first: &SampleSeries,
        second: &SampleSeries,
        invert_second: bool,
    ) -> Result<AlignedPair> {
        let start = first.first().time.max(second.first().time);
        let end = first.last().time.min(second.last().time);
        tracing::debug!(
            first_points = first.len(),
            second_points = second.len(),
            start,
            end,
            "common time range"
        );
        if start >= end {
            return Err(DataError::NoCommonRange {
                first: first.origin(),
                second: second.origin(),
                start,
                end,
            }
            .into());
        }

        let first_interval = first.mean_interval();
        let second_interval = second.mean_interval();
        let interval = first_interval.min(second_interval);
        tracing::debug!(first_interval, second_interval, interval, "sampling intervals");
        if !interval.is_finite() || interval <= 0.0 {
            return Err(DataError::DegenerateInterval {
                first: first.origin(),
                second: second.origin(),
                interval,
            }
            .into());
        }

        let time_axis = unified_axis(start, end, interval);
        let mut resampled1: Vec<f64> = time_axis.iter().map(|&t| first.interpolate(t)).collect();
        let mut resampled2: Vec<f64> = time_axis.iter().map(|&t| second.interpolate(t)).collect();

        let normalization = [
            normalize(&mut resampled1, "channel 1"),
            normalize(&mut resampled2, "channel 2"),
        ];

        if invert_second {
            resampled2.iter_mut().for_each(|value| *value = -*value);
        }

        let sample_rate = 1.0 / interval;
        let point_count = time_axis.len();
        tracing::debug!(point_count, sample_rate, invert_second, "waveforms aligned");

        Ok(AlignedPair {
            channel1: resampled1.into_iter().map(|v| v as f32).collect(),
            channel2: resampled2.into_iter().map(|v| v as f32).collect(),
            sample_rate,
            point_count,
            time_axis,
            normalization,
        })
    }
}

/// Arithmetic sequence `start + i * step` bounded by the half-open limit
/// `end + step`, so the last point may overshoot `end` by less than one step.
fn unified_axis(start: f64, end: f64, step: f64) -> Vec<f64> {
    let len = ((end + step - start) / step).ceil().max(0.0) as usize;
    (0..len).map(|i| start + i as f64 * step).collect()
}

fn normalize(values: &mut [f64], label: &str) -> Normalization {
    let peak = values.iter().fold(0.0_f64, |max, v| max.max(v.abs()));
    if peak == 0.0 {
        tracing::warn!(channel = label, "signal is identically zero, normalization skipped");
        return Normalization::Skipped;
    }
    values.iter_mut().for_each(|value| *value /= peak);
    Normalization::Scaled { peak }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{waveform::Sample, ModalError};

    fn series(points: &[(f64, f64)]) -> SampleSeries {
        SampleSeries::from_samples(
            points
                .iter()
                .map(|&(time, value)| Sample { time, value })
                .collect(),
        )
        .unwrap()
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-6, "{actual:?} vs {expected:?}");
        }
    }

    fn sine(samples: usize, dt: f64, offset: f64) -> SampleSeries {
        series(
            &(0..samples)
                .map(|i| {
                    let t = offset + i as f64 * dt;
                    (t, 3.0 * (t * 40.0).sin())
                })
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn aligns_reference_example() {
        let a = series(&[(0.0, 0.0), (1.0, 2.0), (2.0, 4.0)]);
        let b = series(&[(0.5, 1.0), (1.5, -1.0), (2.5, 0.5)]);

        let pair = Aligner::new().align(&a, &b, false).unwrap();

        assert_eq!(pair.time_axis, vec![0.5, 1.5, 2.5]);
        assert_eq!(pair.point_count, 3);
        assert_eq!(pair.sample_rate, 1.0);
        assert_close(&pair.channel1, &[0.25, 0.75, 1.0]);
        assert_close(&pair.channel2, &[1.0, -1.0, 0.5]);
        assert_eq!(pair.normalization[0], Normalization::Scaled { peak: 4.0 });
        assert!((pair.fundamental_frequency() - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn channels_share_the_axis_length_and_constant_step() {
        let a = sine(200, 1e-3, 0.0);
        let b = sine(120, 1.5e-3, 0.01);

        let pair = Aligner::new().align(&a, &b, true).unwrap();

        assert_eq!(pair.channel1.len(), pair.time_axis.len());
        assert_eq!(pair.channel2.len(), pair.time_axis.len());
        assert_eq!(pair.point_count, pair.time_axis.len());
        let step = pair.interval();
        assert!((step - 1e-3).abs() < 1e-9);
        for window in pair.time_axis.windows(2) {
            assert!(window[1] > window[0]);
            assert!((window[1] - window[0] - step).abs() < 1e-9);
        }
        assert!(pair.time_axis[0] >= 0.01 - 1e-12);
    }

    #[test]
    fn normalized_channels_peak_at_one() {
        let pair = Aligner::new()
            .align(&sine(300, 1e-3, 0.0), &sine(300, 1e-3, 0.0), false)
            .unwrap();

        for channel in [&pair.channel1, &pair.channel2] {
            let peak = channel.iter().fold(0.0_f32, |m, v| m.max(v.abs()));
            assert!((peak - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn zero_channel_is_left_unscaled() {
        let a = series(&[(0.0, 0.0), (1.0, 0.0), (2.0, 0.0)]);
        let b = series(&[(0.0, 1.0), (1.0, -2.0), (2.0, 1.0)]);

        let pair = Aligner::new().align(&a, &b, false).unwrap();

        assert!(pair.channel1.iter().all(|v| *v == 0.0));
        assert!(pair.normalization[0].is_skipped());
        assert!(!pair.normalization[1].is_skipped());
    }

    #[test]
    fn inversion_negates_second_channel_only() {
        let a = sine(100, 1e-3, 0.0);
        let b = sine(80, 1.2e-3, 0.005);
        let aligner = Aligner::new();

        let plain = aligner.align(&a, &b, false).unwrap();
        let inverted = aligner.align(&a, &b, true).unwrap();

        assert_eq!(plain.channel1, inverted.channel1);
        let negated: Vec<f32> = plain.channel2.iter().map(|v| -v).collect();
        assert_eq!(inverted.channel2, negated);
    }

    #[test]
    fn disjoint_series_have_no_common_range() {
        let a = series(&[(0.0, 1.0), (1.0, 2.0)]);
        let b = series(&[(2.0, 1.0), (3.0, 2.0)]);

        let err = Aligner::new().align(&a, &b, true).unwrap_err();
        assert!(matches!(err, ModalError::Data(DataError::NoCommonRange { .. })));
    }

    #[test]
    fn touching_series_have_no_common_range() {
        let a = series(&[(0.0, 1.0), (1.0, 2.0)]);
        let b = series(&[(1.0, 1.0), (2.0, 2.0)]);

        assert!(Aligner::new().align(&a, &b, false).is_err());
    }

    #[test]
    fn axis_overshoots_by_less_than_one_step() {
        let axis = unified_axis(0.0, 1.0, 0.3);
        assert_eq!(axis.len(), 5);
        assert!(axis[4] > 1.0 && axis[4] < 1.3);

        let exact = unified_axis(0.0, 1.0, 0.5);
        assert_eq!(exact, vec![0.0, 0.5, 1.0]);
    }
}
