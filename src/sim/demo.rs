use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};

use crate::protocol::{ArrayPayload, ScalarMap, ScalarValue, StepReturn};
use crate::sim::simulation::{Action, Simulation};

const DEFAULT_MAX_STEPS: u64 = 200;
const DEFAULT_BOUND: f64 = 10.0;

/// Deterministic one-dimensional walk.
///
/// The agent starts near the origin and moves left or right by one unit per
/// step; a little seeded jitter is added to every observation. An episode
/// terminates when `|position|` reaches `bound` and is truncated after
/// `max_steps`. Both are read from the reset options.
///
/// Observation: `float64[2]` = `[position, jitter]`.
#[derive(Debug, Default)]
pub struct LineWalk {
    rng: u64,
    position: f64,
    steps: u64,
    max_steps: u64,
    bound: f64,
    episodes: u64,
    closed: bool,
}

impl LineWalk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn episodes(&self) -> u64 {
        self.episodes
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn observation(&mut self) -> ArrayPayload {
        let jitter = unit_f64(splitmix64(&mut self.rng)) - 0.5;
        ArrayPayload::from_f64s(&[self.position, jitter], &[2])
    }
}

impl Simulation for LineWalk {
    fn reset(&mut self, seed: Option<i64>, options: ScalarMap) -> anyhow::Result<(ArrayPayload, ScalarMap)> {
        if self.closed {
            bail!("reset after close");
        }
        self.rng = match seed {
            Some(seed) => seed as u64,
            None => entropy(),
        };
        self.max_steps = option_f64(&options, "max_steps")?
            .map(|v| v as u64)
            .unwrap_or(DEFAULT_MAX_STEPS);
        self.bound = option_f64(&options, "bound")?.unwrap_or(DEFAULT_BOUND);
        if self.bound <= 0.0 {
            bail!("bound must be positive, got {}", self.bound);
        }
        self.position = (splitmix64(&mut self.rng) % 5) as f64 - 2.0;
        self.steps = 0;
        self.episodes += 1;

        let mut info = ScalarMap::new();
        info.insert("seeded".to_string(), seed.is_some().into());
        info.insert("episode".to_string(), (self.episodes as f64).into());
        Ok((self.observation(), info))
    }

    fn step(&mut self, action: Action) -> anyhow::Result<StepReturn> {
        if self.closed {
            bail!("step after close");
        }
        if self.episodes == 0 {
            bail!("step before reset");
        }
        let push = match action {
            Action::Scalar(scalar) => scalar.as_f64(),
            Action::Array(payload) => payload
                .to_f64_vec()
                .context("decoding action")?
                .into_iter()
                .sum(),
        };
        // 0 moves left, anything positive moves right.
        self.position += if push > 0.0 { 1.0 } else { -1.0 };
        self.steps += 1;

        let terminated = self.position.abs() >= self.bound;
        let truncated = !terminated && self.steps >= self.max_steps;
        let reward = if terminated { -1.0 } else { 1.0 - self.position.abs() / self.bound };

        let mut info = ScalarMap::new();
        info.insert("steps".to_string(), (self.steps as f64).into());
        Ok(StepReturn {
            observation: self.observation(),
            reward,
            terminated,
            truncated,
            info,
        })
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.closed = true;
        Ok(())
    }
}

fn option_f64(options: &ScalarMap, key: &str) -> anyhow::Result<Option<f64>> {
    match options.get(key) {
        None => Ok(None),
        Some(ScalarValue::Number(v)) => Ok(Some(*v)),
        Some(other) => bail!("option {key:?} must be a number, got {other:?}"),
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn unit_f64(bits: u64) -> f64 {
    (bits >> 11) as f64 / (1u64 << 53) as f64
}

fn entropy() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    nanos ^ (u64::from(std::process::id()) << 32)
}
