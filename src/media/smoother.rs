// src/media/smoother.rs - DTS/PTS repair for the output muxer
//
// Pure integer state machine, no FFmpeg types: the pusher maps
// AV_NOPTS_VALUE to None on the way in and writes the result back as
// both pts and dts. Guarantees to the muxer: strictly monotonically
// increasing output, every increment >= min_increment.

use std::collections::VecDeque;

const MAX_HISTORY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmootherParams {
    /// Exponential-smoothing weight of the raw increment, clamped to
    /// [0.01, 1.0].
    pub smoothing_factor: f64,
    /// Increments above this are smoothed; backward jumps below the
    /// negated value (or forward beyond twice it) count as a wrap.
    pub max_jump: i64,
    pub min_increment: i64,
}

impl SmootherParams {
    pub fn conservative() -> Self {
        Self {
            smoothing_factor: 0.05,
            max_jump: 180_000,
            min_increment: 1_000,
        }
    }

    pub fn looping() -> Self {
        Self {
            smoothing_factor: 0.10,
            max_jump: 45_000,
            min_increment: 2_000,
        }
    }

    pub fn aggressive() -> Self {
        Self {
            smoothing_factor: 0.30,
            max_jump: 30_000,
            min_increment: 3_000,
        }
    }

    fn clamped(mut self) -> Self {
        self.smoothing_factor = self.smoothing_factor.clamp(0.01, 1.0);
        self
    }
}

impl Default for SmootherParams {
    fn default() -> Self {
        Self {
            smoothing_factor: 0.10,
            max_jump: 90_000,
            min_increment: 3_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SmootherStats {
    pub total_packets: u64,
    pub corrected_packets: u64,
    pub correction_rate: f64,
}

#[derive(Default)]
pub struct TimestampSmoother {
    params: SmootherParams,
    history: VecDeque<i64>,
    last_output: Option<i64>,
    base: Option<i64>,
    offset: i64,
    total: u64,
    corrected: u64,
}

impl TimestampSmoother {
    pub fn new(params: SmootherParams) -> Self {
        Self {
            params: params.clamped(),
            ..Self::default()
        }
    }

    pub fn set_params(&mut self, params: SmootherParams) {
        self.params = params.clamped();
    }

    pub fn params(&self) -> SmootherParams {
        self.params
    }

    /// Forget all stream state; counters restart too.
    pub fn reset(&mut self) {
        self.history.clear();
        self.last_output = None;
        self.base = None;
        self.offset = 0;
        self.total = 0;
        self.corrected = 0;
    }

    pub fn stats(&self) -> SmootherStats {
        SmootherStats {
            total_packets: self.total,
            corrected_packets: self.corrected,
            correction_rate: if self.total > 0 {
                self.corrected as f64 / self.total as f64
            } else {
                0.0
            },
        }
    }

    fn push_output(&mut self, out: i64) -> i64 {
        self.history.push_back(out);
        if self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
        self.last_output = Some(out);
        out
    }

    /// Mean of consecutive diffs over the output history, blended with
    /// the raw increment by the smoothing factor; never below
    /// min_increment.
    fn smooth_increment(&self, raw: i64) -> i64 {
        let avg = if self.history.len() >= 2 {
            let mut sum = 0i64;
            let mut prev = None;
            for &v in &self.history {
                if let Some(p) = prev {
                    sum += v - p;
                }
                prev = Some(v);
            }
            sum / (self.history.len() as i64 - 1)
        } else {
            self.params.min_increment
        };

        let a = self.params.smoothing_factor;
        let smoothed = (a * raw as f64 + (1.0 - a) * avg as f64).round() as i64;
        smoothed.max(self.params.min_increment)
    }

    /// Map one input pts (None for AV_NOPTS_VALUE) to the output
    /// timestamp. The result is also the dts.
    pub fn process(&mut self, input: Option<i64>) -> i64 {
        self.total += 1;
        let min_inc = self.params.min_increment;

        let Some(pts) = input else {
            // The base stays unset until a known pts arrives, so a
            // stream opening with unknowns re-anchors below.
            let out = match self.last_output {
                None => 0,
                Some(last) => last + min_inc,
            };
            self.corrected += 1;
            return self.push_output(out);
        };

        let Some(base) = self.base else {
            return match self.last_output {
                None => {
                    self.base = Some(pts);
                    self.offset = 0;
                    self.push_output(0)
                }
                Some(last) => {
                    // Known timestamps begin after a run of unknowns:
                    // re-anchor like a wrap so continuity holds.
                    self.base = Some(pts);
                    self.offset = last + min_inc;
                    self.corrected += 1;
                    self.push_output(self.offset)
                }
            };
        };

        // Wrap detection against the most recent output (initially the
        // base itself): a hard backward jump or a jump past twice the
        // threshold re-anchors the base.
        let last_seen = self.history.back().copied().unwrap_or(base);
        let last = self.last_output.unwrap_or(0);
        let mut base = base;
        let diff = pts - last_seen;
        if diff < -self.params.max_jump || diff > 2 * self.params.max_jump {
            self.offset += last + min_inc;
            base = pts;
            self.base = Some(pts);
            self.corrected += 1;
        }

        let mut relative = pts - base + self.offset;
        if relative <= last {
            relative = last + min_inc;
            self.corrected += 1;
        } else if relative - last > self.params.max_jump {
            relative = last + self.smooth_increment(relative - last);
            self.corrected += 1;
        }

        self.push_output(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(smoother: &mut TimestampSmoother, inputs: &[Option<i64>]) -> Vec<i64> {
        inputs.iter().map(|&pts| smoother.process(pts)).collect()
    }

    #[test]
    fn test_normal_sequence_is_translated() {
        let mut s = TimestampSmoother::new(SmootherParams::default());
        let outputs = run(
            &mut s,
            &[Some(0), Some(3000), Some(6000), Some(9000), Some(12000)],
        );
        assert_eq!(outputs, vec![0, 3000, 6000, 9000, 12000]);
        assert_eq!(s.stats().corrected_packets, 0);
    }

    #[test]
    fn test_good_stream_with_nonzero_origin_is_pure_translation() {
        // Strictly increasing input with all increments inside
        // [min_increment, max_jump] maps to input minus origin.
        let mut s = TimestampSmoother::new(SmootherParams::default());
        let inputs = [50_000i64, 53_000, 59_000, 62_500, 70_000];
        let outputs = run(&mut s, &inputs.map(Some));
        let expected: Vec<i64> = inputs.iter().map(|v| v - inputs[0]).collect();
        assert_eq!(outputs, expected);
        assert_eq!(s.stats().corrected_packets, 0);
    }

    #[test]
    fn test_looping_file_scenario() {
        let mut s = TimestampSmoother::new(SmootherParams::default());
        let inputs = [
            100_000i64, 103_000, 106_000, 109_000, 112_000, 0, 3_000, 6_000, 9_000, 115_000,
        ];
        let outputs = run(&mut s, &inputs.map(Some));
        assert_eq!(
            outputs,
            vec![0, 3_000, 6_000, 9_000, 12_000, 15_000, 18_000, 21_000, 24_000, 27_000]
        );
        assert!(s.stats().corrected_packets >= 1);
    }

    #[test]
    fn test_unknown_timestamps_scenario() {
        let mut s = TimestampSmoother::new(SmootherParams::default());
        let outputs = run(&mut s, &[None, Some(3000), None, Some(9000)]);
        assert_eq!(outputs, vec![0, 3000, 6000, 9000]);
        assert_eq!(s.stats().corrected_packets, 3);
    }

    #[test]
    fn test_monotonic_invariant_under_hostile_input() {
        let mut s = TimestampSmoother::new(SmootherParams::default());
        let inputs = [
            Some(0),
            Some(3000),
            Some(6000),
            Some(150_000),
            Some(153_000),
            Some(9000),
            None,
            Some(12_000),
            Some(-50_000),
            None,
        ];
        let outputs = run(&mut s, &inputs);
        for pair in outputs.windows(2) {
            assert!(
                pair[1] - pair[0] >= s.params().min_increment,
                "increment violated: {outputs:?}"
            );
        }
        assert!(s.stats().corrected_packets > 0);
    }

    #[test]
    fn test_large_jump_is_smoothed() {
        let mut s = TimestampSmoother::new(SmootherParams::default());
        // 150_000 is past max_jump but short of the wrap threshold, so
        // the increment is blended: round(0.1 * 144000 + 0.9 * 3000).
        let outputs = run(&mut s, &[Some(0), Some(3000), Some(6000), Some(150_000)]);
        assert_eq!(outputs[3], 6000 + 17_100);
        assert_eq!(s.stats().corrected_packets, 1);
    }

    #[test]
    fn test_jump_past_wrap_threshold_reanchors() {
        let mut s = TimestampSmoother::new(SmootherParams::default());
        // 500_000 exceeds twice max_jump relative to the last output:
        // treated as a wrap, output advances by min_increment.
        let outputs = run(&mut s, &[Some(0), Some(3000), Some(6000), Some(500_000)]);
        assert_eq!(outputs[3], 9000);
        assert_eq!(s.stats().corrected_packets, 1);
    }

    #[test]
    fn test_backward_wrap_reanchors_base() {
        let mut s = TimestampSmoother::new(SmootherParams::looping());
        // -50_000 against the last output 3_000 is a backward jump past
        // -max_jump: the base re-anchors and output continues at
        // last + min_increment.
        let outputs = run(&mut s, &[Some(0), Some(3_000), Some(-50_000)]);
        assert_eq!(outputs, vec![0, 3_000, 5_000]);
        assert_eq!(s.stats().corrected_packets, 1);
    }

    #[test]
    fn test_reset_clears_counters_and_state() {
        let mut s = TimestampSmoother::new(SmootherParams::default());
        run(&mut s, &[Some(1000), None, Some(9000)]);
        s.reset();
        assert_eq!(s.stats(), SmootherStats::default());
        let outputs = run(&mut s, &[Some(777), Some(3777)]);
        assert_eq!(outputs, vec![0, 3000]);
    }

    #[test]
    fn test_factor_clamping() {
        let s = TimestampSmoother::new(SmootherParams {
            smoothing_factor: 7.0,
            ..SmootherParams::default()
        });
        assert_eq!(s.params().smoothing_factor, 1.0);
        let s = TimestampSmoother::new(SmootherParams {
            smoothing_factor: 0.0,
            ..SmootherParams::default()
        });
        assert_eq!(s.params().smoothing_factor, 0.01);
    }

    #[test]
    fn test_presets() {
        assert_eq!(SmootherParams::conservative().min_increment, 1_000);
        assert_eq!(SmootherParams::default().max_jump, 90_000);
        assert_eq!(SmootherParams::looping().max_jump, 45_000);
        assert_eq!(SmootherParams::aggressive().smoothing_factor, 0.30);
    }

    #[test]
    fn test_stats_rate() {
        let mut s = TimestampSmoother::new(SmootherParams::default());
        run(&mut s, &[None, None, Some(5000), Some(8000)]);
        let stats = s.stats();
        assert_eq!(stats.total_packets, 4);
        assert_eq!(stats.corrected_packets, 3);
        assert!((stats.correction_rate - 0.75).abs() < 1e-9);
    }
}
