use crate::protocol::{ArrayPayload, Scalar, ScalarMap, StepReturn};

/// What the worker hands to [`Simulation::step`].
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// A single-element payload reduced to its value (discrete actions).
    Scalar(Scalar),
    Array(ArrayPayload),
}

impl Action {
    /// Reduces single-element payloads of a known dtype to a bare scalar;
    /// everything else is passed through untouched.
    pub fn from_payload(payload: ArrayPayload) -> Self {
        match payload.as_scalar() {
            Some(scalar) => Action::Scalar(scalar),
            None => Action::Array(payload),
        }
    }
}

/// The stateful environment a worker drives on behalf of the controller.
pub trait Simulation {
    fn reset(&mut self, seed: Option<i64>, options: ScalarMap) -> anyhow::Result<(ArrayPayload, ScalarMap)>;

    fn step(&mut self, action: Action) -> anyhow::Result<StepReturn>;

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<S: Simulation + ?Sized> Simulation for Box<S> {
    fn reset(&mut self, seed: Option<i64>, options: ScalarMap) -> anyhow::Result<(ArrayPayload, ScalarMap)> {
        (**self).reset(seed, options)
    }

    fn step(&mut self, action: Action) -> anyhow::Result<StepReturn> {
        (**self).step(action)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        (**self).close()
    }
}
