//! Progress reporting and cooperative stepping for long-running jobs.
//!
//! Decompression, model decoding and exports are split into steps so a host loop can
//! stay responsive between them. Progress is a best-effort fraction in `[0.0, 1.0]`;
//! callers should treat it as advisory and not assume monotonicity across phases.
//! Dropping a task between steps cancels it; nothing is published until `Done`.

pub trait ProgressCallback {
    fn on_progress(&self, phase: &str, percent: f32);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_progress(&self, _phase: &str, _percent: f32) {}
}

impl<F: Fn(&str, f32)> ProgressCallback for F {
    fn on_progress(&self, phase: &str, percent: f32) {
        self(phase, percent)
    }
}

/// Outcome of one step of a [`Task`].
#[derive(Debug, Clone, PartialEq)]
pub enum Step<T> {
    Yield { phase: &'static str, progress: f32 },
    Done(T),
}

impl<T> Step<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, Step::Done(_))
    }
}

pub trait Task {
    type Output;
    type Error;

    fn step(&mut self) -> Result<Step<Self::Output>, Self::Error>;

    fn run_to_completion(self) -> Result<Self::Output, Self::Error>
    where
        Self: Sized,
    {
        self.run_with_progress(&NoProgress)
    }

    fn run_with_progress(mut self, progress: &dyn ProgressCallback) -> Result<Self::Output, Self::Error>
    where
        Self: Sized,
    {
        loop {
            match self.step()? {
                Step::Yield {
                    phase,
                    progress: fraction,
                } => progress.on_progress(phase, fraction.clamp(0.0, 1.0)),
                Step::Done(output) => {
                    progress.on_progress("done", 1.0);
                    return Ok(output);
                }
            }
        }
    }
}
