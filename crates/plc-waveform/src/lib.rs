//! Pure waveform evaluators.
//!
//! Every function here maps `(spec, elapsed_seconds[, prior_value])` to a
//! value with no side effects and no hidden clock — the caller owns time
//! and, for stateful families, the prior sample. This is what lets the
//! simulation engine drive many devices from one process-wide PRNG without
//! any waveform evaluator needing to know about devices, profiles, or I/O.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// A single waveform family and its parameters, as declared in a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaveformSpec {
    /// Constant value.
    Fixed {
        /// The constant value returned on every tick.
        value: f64,
    },
    /// Written once at init; never overwritten by the simulator afterwards.
    Static {
        /// Initial value to seed the memory cell with.
        initial: f64,
    },
    /// `min + (sin(2*pi*t/period)+1)/2 * (max-min)`.
    Sine {
        /// Lower bound of the oscillation.
        min: f64,
        /// Upper bound of the oscillation.
        max: f64,
        /// Period of one full cycle, in seconds.
        period_s: f64,
    },
    /// `min + ((t mod period)/period) * (max-min)`.
    Sawtooth {
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
        /// Period, in seconds.
        period_s: f64,
    },
    /// Rises for the first half period, falls for the second.
    Triangle {
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
        /// Period, in seconds.
        period_s: f64,
    },
    /// Boolean; true for the first `on_s` of every `on_s + off_s` cycle.
    Square {
        /// Seconds the signal is true within each cycle.
        on_s: f64,
        /// Seconds the signal is false within each cycle.
        off_s: f64,
    },
    /// `current <- clamp(current + U[-step, step], min, max)`; stateful.
    RandomWalk {
        /// Lower clamp bound.
        min: f64,
        /// Upper clamp bound.
        max: f64,
        /// Maximum step size per tick.
        step: f64,
        /// Seed value used when there is no prior sample.
        initial: f64,
    },
    /// `base + U[-amplitude, amplitude]`.
    Noise {
        /// Center value.
        base: f64,
        /// Half-width of the uniform noise band.
        amplitude: f64,
    },
    /// `floor(t) mod max`.
    Counter {
        /// Modulus; must be non-zero to avoid a divide-by-zero.
        max: u64,
    },
    /// `target + (initial-target) * exp(-(t-offset)/tau)`.
    ExpDecay {
        /// Starting value before decay begins.
        initial: f64,
        /// Asymptotic value the curve decays towards.
        target: f64,
        /// Time constant tau, in seconds.
        time_constant: f64,
        /// Seconds after simulation start before decay begins.
        start_offset: f64,
    },
    /// Cycles through `values` holding each for its matching `durations` entry.
    StepSequence {
        /// Values to cycle through.
        values: Vec<f64>,
        /// Hold time for each value, in seconds, same length as `values`.
        durations: Vec<f64>,
    },
    /// Bernoulli draw per tick.
    Random {
        /// Probability of `true` on any given tick.
        probability: f64,
    },
}

/// The outcome of evaluating a [`WaveformSpec`] at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaveformValue {
    /// A numeric sample.
    Number(f64),
    /// A boolean sample.
    Bool(bool),
    /// Sentinel for `static` entries: leave the current memory cell alone.
    DoNotOverwrite,
}

impl WaveformValue {
    /// Unwrap a numeric sample, panicking on a non-numeric variant.
    ///
    /// Intended for call sites that have already matched on the spec's tag
    /// and know the result must be numeric (e.g. all families except
    /// `square` and `random`).
    #[must_use]
    pub fn as_number(self) -> f64 {
        match self {
            WaveformValue::Number(n) => n,
            other => panic!("expected numeric waveform value, got {other:?}"),
        }
    }

    /// Unwrap a boolean sample, panicking on a non-boolean variant.
    #[must_use]
    pub fn as_bool(self) -> bool {
        match self {
            WaveformValue::Bool(b) => b,
            other => panic!("expected boolean waveform value, got {other:?}"),
        }
    }
}

/// Evaluate a waveform at `elapsed_s` seconds since simulation start.
///
/// `prior` is only consulted for [`WaveformSpec::RandomWalk`]; it should be
/// the value most recently written to the memory cell this spec targets.
/// `rng` is the agent's single shared PRNG, threaded through rather than
/// re-seeded per call.
pub fn evaluate(
    spec: &WaveformSpec,
    elapsed_s: f64,
    prior: Option<f64>,
    rng: &mut impl Rng,
) -> WaveformValue {
    match spec {
        WaveformSpec::Fixed { value } => WaveformValue::Number(*value),
        WaveformSpec::Static { initial } => match prior {
            Some(_) => WaveformValue::DoNotOverwrite,
            None => WaveformValue::Number(*initial),
        },
        WaveformSpec::Sine {
            min,
            max,
            period_s,
        } => {
            let phase = if *period_s > 0.0 {
                2.0 * std::f64::consts::PI * elapsed_s / period_s
            } else {
                0.0
            };
            WaveformValue::Number(min + (phase.sin() + 1.0) / 2.0 * (max - min))
        }
        WaveformSpec::Sawtooth {
            min,
            max,
            period_s,
        } => {
            let frac = if *period_s > 0.0 {
                (elapsed_s.rem_euclid(*period_s)) / period_s
            } else {
                0.0
            };
            WaveformValue::Number(min + frac * (max - min))
        }
        WaveformSpec::Triangle {
            min,
            max,
            period_s,
        } => {
            if *period_s <= 0.0 {
                return WaveformValue::Number(*min);
            }
            let half = period_s / 2.0;
            let phase = elapsed_s.rem_euclid(*period_s);
            let value = if phase < half {
                min + (phase / half) * (max - min)
            } else {
                max - ((phase - half) / half) * (max - min)
            };
            WaveformValue::Number(value)
        }
        WaveformSpec::Square { on_s, off_s } => {
            let cycle = on_s + off_s;
            let on = if cycle > 0.0 {
                elapsed_s.rem_euclid(cycle) < *on_s
            } else {
                false
            };
            WaveformValue::Bool(on)
        }
        WaveformSpec::RandomWalk {
            min,
            max,
            step,
            initial,
        } => {
            let current = prior.unwrap_or(*initial);
            let delta = if *step > 0.0 {
                rng.gen_range(-step..=*step)
            } else {
                0.0
            };
            WaveformValue::Number((current + delta).clamp(*min, *max))
        }
        WaveformSpec::Noise { base, amplitude } => {
            let delta = if *amplitude > 0.0 {
                rng.gen_range(-amplitude..=*amplitude)
            } else {
                0.0
            };
            WaveformValue::Number(base + delta)
        }
        WaveformSpec::Counter { max } => {
            if *max == 0 {
                WaveformValue::Number(0.0)
            } else {
                WaveformValue::Number((elapsed_s.floor() as u64 % max) as f64)
            }
        }
        WaveformSpec::ExpDecay {
            initial,
            target,
            time_constant,
            start_offset,
        } => {
            let elapsed = elapsed_s - start_offset;
            if elapsed < 0.0 {
                WaveformValue::Number(*initial)
            } else if *time_constant <= 0.0 {
                WaveformValue::Number(*target)
            } else {
                WaveformValue::Number(
                    target + (initial - target) * (-elapsed / time_constant).exp(),
                )
            }
        }
        WaveformSpec::StepSequence { values, durations } => {
            if values.is_empty() || values.len() != durations.len() {
                return WaveformValue::Number(0.0);
            }
            let total: f64 = durations.iter().sum();
            if total <= 0.0 {
                return WaveformValue::Number(values[0]);
            }
            let mut phase = elapsed_s.rem_euclid(total);
            for (value, duration) in values.iter().zip(durations.iter()) {
                if phase < *duration {
                    return WaveformValue::Number(*value);
                }
                phase -= duration;
            }
            WaveformValue::Number(*values.last().unwrap())
        }
        WaveformSpec::Random { probability } => {
            WaveformValue::Bool(rng.gen::<f64>() < *probability)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn sine_stays_in_range() {
        let spec = WaveformSpec::Sine {
            min: 20.0,
            max: 80.0,
            period_s: 300.0,
        };
        let mut rng = rng();
        for i in 0..1000 {
            let t = i as f64 * 0.37;
            let v = evaluate(&spec, t, None, &mut rng).as_number();
            assert!((20.0..=80.0).contains(&v), "t={t} v={v}");
        }
    }

    #[test]
    fn sawtooth_resets_at_period_boundary() {
        let spec = WaveformSpec::Sawtooth {
            min: 0.0,
            max: 10.0,
            period_s: 5.0,
        };
        let mut rng = rng();
        for k in 0..5 {
            let t = k as f64 * 5.0;
            let v = evaluate(&spec, t, None, &mut rng).as_number();
            assert!((v - 0.0).abs() < 1e-9, "t={t} v={v}");
        }
    }

    #[test]
    fn square_duty_cycle_matches_on_fraction() {
        let spec = WaveformSpec::Square {
            on_s: 3.0,
            off_s: 7.0,
        };
        let mut rng = rng();
        let samples = 10_000;
        let period = 10.0;
        let total_periods = 50.0;
        let mut on_count = 0;
        for i in 0..samples {
            let t = total_periods * period * (i as f64 / samples as f64);
            if evaluate(&spec, t, None, &mut rng).as_bool() {
                on_count += 1;
            }
        }
        let observed_duty = on_count as f64 / samples as f64;
        assert!((observed_duty - 0.3).abs() < 0.02, "duty={observed_duty}");
    }

    #[test]
    fn random_walk_never_leaves_bounds() {
        let spec = WaveformSpec::RandomWalk {
            min: -5.0,
            max: 5.0,
            step: 1.5,
            initial: 0.0,
        };
        let mut rng = rng();
        let mut prior = None;
        for _ in 0..10_000 {
            let v = evaluate(&spec, 0.0, prior, &mut rng).as_number();
            assert!((-5.0..=5.0).contains(&v));
            prior = Some(v);
        }
    }

    #[test]
    fn static_leaves_existing_value_untouched() {
        let spec = WaveformSpec::Static { initial: 42.0 };
        let mut rng = rng();
        assert_eq!(
            evaluate(&spec, 10.0, None, &mut rng),
            WaveformValue::Number(42.0)
        );
        assert_eq!(
            evaluate(&spec, 10.0, Some(99.0), &mut rng),
            WaveformValue::DoNotOverwrite
        );
    }

    #[test]
    fn exp_decay_holds_initial_before_offset() {
        let spec = WaveformSpec::ExpDecay {
            initial: 100.0,
            target: 0.0,
            time_constant: 10.0,
            start_offset: 30.0,
        };
        let mut rng = rng();
        assert_eq!(
            evaluate(&spec, 5.0, None, &mut rng).as_number(),
            100.0
        );
        let decayed = evaluate(&spec, 30.0, None, &mut rng).as_number();
        assert!((decayed - 100.0).abs() < 1e-9);
        let later = evaluate(&spec, 40.0, None, &mut rng).as_number();
        assert!(later < 100.0 && later > 0.0);
    }

    #[test]
    fn step_sequence_cycles_through_values() {
        let spec = WaveformSpec::StepSequence {
            values: vec![1.0, 2.0, 3.0],
            durations: vec![2.0, 2.0, 2.0],
        };
        let mut rng = rng();
        assert_eq!(evaluate(&spec, 0.5, None, &mut rng).as_number(), 1.0);
        assert_eq!(evaluate(&spec, 2.5, None, &mut rng).as_number(), 2.0);
        assert_eq!(evaluate(&spec, 4.5, None, &mut rng).as_number(), 3.0);
        assert_eq!(evaluate(&spec, 6.5, None, &mut rng).as_number(), 1.0);
    }

    #[test]
    fn counter_wraps_at_max() {
        let spec = WaveformSpec::Counter { max: 10 };
        let mut rng = rng();
        assert_eq!(evaluate(&spec, 7.9, None, &mut rng).as_number(), 7.0);
        assert_eq!(evaluate(&spec, 13.0, None, &mut rng).as_number(), 3.0);
    }

    #[test]
    fn json_tagged_roundtrip() {
        let spec = WaveformSpec::Sine {
            min: 1.0,
            max: 2.0,
            period_s: 3.0,
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"type\":\"sine\""));
        let back: WaveformSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, back);
    }
}
