//! Doubling controller: drives a pile backend through magnitude epochs.
//!
//! Each epoch topples the pile in fixed-size batches until it is stable,
//! emitting one snapshot per batch. A stable pile at the final epoch ends
//! the run; otherwise every cell doubles and the next epoch begins. The
//! stability check runs once per batch, not per step: toppling a stable
//! grid is the identity, so batching only changes snapshot cadence, never
//! the final configuration.

use std::error::Error;
use std::time::{Duration, Instant};

use crate::backend::PileBackend;
use crate::emitter::Emitter;

/// Where the controller is in its epoch/batch cycle. `EpochStable` means
/// the pile settled with more doubling epochs still pending; stabilizing at
/// the final epoch goes straight to `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running { epoch: u32, batch: u32 },
    EpochStable { epoch: u32 },
    Finished,
}

/// Bounds honored between batches, never inside a step. An adversarial
/// configuration may never stabilize; these are the way out.
#[derive(Debug, Clone, Default)]
pub struct RunLimits {
    /// Stop after this many batches across the whole run (0 = unbounded).
    pub max_batches: u64,
    /// Stop once this much wall-clock time has passed.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    BatchLimit,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub stop: StopReason,
    pub epochs_completed: u32,
    pub batches_run: u64,
    pub steps_run: u64,
    pub frames_written: u64,
    pub frames_failed: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of doubling epochs after the first; the run covers epochs
    /// 0..=doublings. Zero means a single plain stabilization.
    pub doublings: u32,
    /// Toppling steps applied between snapshot/stability checks.
    pub batch_iterations: usize,
    /// Per-channel multipliers for the grain-count color mapping.
    pub colour: [u8; 3],
    /// Abort the run on a snapshot write failure instead of continuing.
    pub abort_on_emit_error: bool,
}

pub struct DoublingController<B: PileBackend> {
    backend: B,
    cfg: ControllerConfig,
    phase: Phase,
}

impl<B: PileBackend> DoublingController<B> {
    pub fn new(backend: B, cfg: ControllerConfig) -> Self {
        Self {
            backend,
            cfg,
            phase: Phase::Running { epoch: 0, batch: 0 },
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Run to completion or until a limit trips. Snapshot failures are
    /// reported but never roll back the in-memory pile.
    pub fn run(
        &mut self,
        emitter: &mut dyn Emitter,
        limits: &RunLimits,
    ) -> Result<RunSummary, Box<dyn Error>> {
        let start = Instant::now();
        let deadline = limits.timeout.map(|t| start + t);
        let batch_iterations = self.cfg.batch_iterations.max(1);

        let mut stop = StopReason::Completed;
        let mut epochs_completed = 0u32;
        let mut batches_run = 0u64;
        let mut steps_run = 0u64;
        let mut frames_written = 0u64;
        let mut frames_failed = 0u64;

        loop {
            match self.phase {
                Phase::Finished => break,
                Phase::EpochStable { epoch } => {
                    self.backend.double();
                    self.phase = Phase::Running { epoch: epoch + 1, batch: 0 };
                }
                Phase::Running { epoch, batch } => {
                    self.backend.step_batch(batch_iterations);
                    steps_run += batch_iterations as u64;
                    batches_run += 1;

                    let frame = self.backend.render_rgb(self.cfg.colour);
                    match emitter.emit(&frame, epoch, batch) {
                        Ok(()) => frames_written += 1,
                        Err(e) => {
                            frames_failed += 1;
                            eprintln!(
                                "Warning: could not write snapshot {:04}.{:04}: {}",
                                epoch, batch, e
                            );
                            if self.cfg.abort_on_emit_error {
                                return Err(Box::new(e));
                            }
                        }
                    }

                    if self.backend.is_stable() {
                        epochs_completed = epoch + 1;
                        self.phase = if epoch == self.cfg.doublings {
                            Phase::Finished
                        } else {
                            Phase::EpochStable { epoch }
                        };
                    } else {
                        self.phase = Phase::Running { epoch, batch: batch + 1 };
                    }

                    // Batch boundary: the only place limits are consulted.
                    // A run that just finished is complete, not cut off, even
                    // when this batch exhausted the limit.
                    if self.phase == Phase::Finished {
                        break;
                    }
                    if limits.max_batches > 0 && batches_run >= limits.max_batches {
                        stop = StopReason::BatchLimit;
                        break;
                    }
                    if let Some(d) = deadline {
                        if Instant::now() >= d {
                            stop = StopReason::Timeout;
                            break;
                        }
                    }
                }
            }
        }

        // Async emitters accept frames into a queue, so some of the emits
        // counted as written may have failed on the worker; `finish` says
        // how many.
        match emitter.finish() {
            Ok(deferred_failures) => {
                if deferred_failures > 0 {
                    eprintln!("Warning: {} queued frame(s) failed to write", deferred_failures);
                    frames_failed += deferred_failures;
                    frames_written = frames_written.saturating_sub(deferred_failures);
                    if self.cfg.abort_on_emit_error {
                        return Err(
                            format!("{} frame(s) failed to write", deferred_failures).into()
                        );
                    }
                }
            }
            Err(e) => {
                eprintln!("Warning: {}", e);
                if self.cfg.abort_on_emit_error {
                    return Err(Box::new(e));
                }
            }
        }

        Ok(RunSummary {
            stop,
            epochs_completed,
            batches_run,
            steps_run,
            frames_written,
            frames_failed,
            elapsed: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::Frame;
    use crate::grid::{Grid, Kernel};
    use crate::pile::{stabilize, CpuPile};
    use std::io;

    /// Collects emitted frames in memory for comparison.
    #[derive(Default)]
    struct CaptureEmitter {
        frames: Vec<(u32, u32, Frame)>,
    }

    impl Emitter for CaptureEmitter {
        fn emit(&mut self, frame: &Frame, epoch: u32, batch: u32) -> io::Result<()> {
            self.frames.push((epoch, batch, frame.clone()));
            Ok(())
        }
    }

    struct FailingEmitter;

    impl Emitter for FailingEmitter {
        fn emit(&mut self, _frame: &Frame, _epoch: u32, _batch: u32) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }

    fn cfg(doublings: u32, batch_iterations: usize) -> ControllerConfig {
        ControllerConfig {
            doublings,
            batch_iterations,
            colour: [102, 182, 65],
            abort_on_emit_error: false,
        }
    }

    fn center_backend(side: usize, grains: u64) -> CpuPile {
        CpuPile::new(Grid::seeded(side, side, 0, grains, &[]), Kernel::von_neumann())
    }

    #[test]
    fn already_stable_pile_emits_one_frame_and_finishes() {
        let mut controller = DoublingController::new(center_backend(3, 2), cfg(0, 16));
        let mut capture = CaptureEmitter::default();
        let summary = controller.run(&mut capture, &RunLimits::default()).unwrap();

        assert_eq!(summary.stop, StopReason::Completed);
        assert_eq!(summary.epochs_completed, 1);
        assert_eq!(capture.frames.len(), 1);
        assert_eq!((capture.frames[0].0, capture.frames[0].1), (0, 0));
        assert_eq!(controller.phase(), Phase::Finished);
    }

    #[test]
    fn repeated_runs_emit_identical_frames() {
        let run = || {
            let mut controller = DoublingController::new(center_backend(7, 200), cfg(1, 4));
            let mut capture = CaptureEmitter::default();
            controller.run(&mut capture, &RunLimits::default()).unwrap();
            capture.frames
        };
        let first = run();
        let second = run();
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn doubling_run_matches_direct_run() {
        let base = 25u64;

        let mut doubled = DoublingController::new(center_backend(5, base), cfg(1, 8));
        doubled
            .run(&mut CaptureEmitter::default(), &RunLimits::default())
            .unwrap();

        let mut direct = Grid::seeded(5, 5, 0, 2 * base, &[]);
        stabilize(&mut direct, &Kernel::von_neumann());

        assert_eq!(doubled.backend_mut().grid(), direct);
    }

    #[test]
    fn batch_limit_interrupts_run() {
        let mut controller = DoublingController::new(center_backend(31, 1 << 16), cfg(0, 1));
        let limits = RunLimits { max_batches: 3, timeout: None };
        let summary = controller
            .run(&mut CaptureEmitter::default(), &limits)
            .unwrap();

        assert_eq!(summary.stop, StopReason::BatchLimit);
        assert_eq!(summary.batches_run, 3);
        assert!(matches!(controller.phase(), Phase::Running { .. }));
    }

    #[test]
    fn stabilizing_on_the_last_allowed_batch_reports_completed() {
        // 4 grains on a 3x3 settles in one step, so the single allowed
        // batch both finishes the run and exhausts the limit.
        let mut controller = DoublingController::new(center_backend(3, 4), cfg(0, 16));
        let limits = RunLimits { max_batches: 1, timeout: None };
        let summary = controller
            .run(&mut CaptureEmitter::default(), &limits)
            .unwrap();

        assert_eq!(summary.stop, StopReason::Completed);
        assert_eq!(summary.epochs_completed, 1);
        assert_eq!(summary.batches_run, 1);
        assert_eq!(controller.phase(), Phase::Finished);
    }

    #[test]
    fn deferred_write_failures_move_frames_from_written_to_failed() {
        use crate::emitter::AsyncEmitter;

        let mut controller = DoublingController::new(center_backend(9, 4000), cfg(0, 1));
        let mut emitter = AsyncEmitter::new(Box::new(FailingEmitter));
        let summary = controller.run(&mut emitter, &RunLimits::default()).unwrap();

        assert!(summary.batches_run > 1);
        assert_eq!(summary.frames_failed, summary.batches_run);
        assert_eq!(summary.frames_written, 0);
    }

    #[test]
    fn emit_failures_are_counted_not_fatal_by_default() {
        let mut controller = DoublingController::new(center_backend(3, 5), cfg(0, 16));
        let summary = controller
            .run(&mut FailingEmitter, &RunLimits::default())
            .unwrap();

        assert_eq!(summary.stop, StopReason::Completed);
        assert!(summary.frames_failed > 0);
        assert_eq!(summary.frames_written, 0);
    }

    #[test]
    fn emit_failure_aborts_when_policy_says_so() {
        let mut config = cfg(0, 16);
        config.abort_on_emit_error = true;
        let mut controller = DoublingController::new(center_backend(3, 5), config);
        let result = controller.run(&mut FailingEmitter, &RunLimits::default());
        assert!(result.is_err());
        // The pile itself is untouched by the failed write.
        assert!(controller.backend_mut().grid().total_grains() > 0);
    }

    #[test]
    fn snapshot_batches_count_up_within_an_epoch() {
        let mut controller = DoublingController::new(center_backend(9, 4000), cfg(0, 1));
        let mut capture = CaptureEmitter::default();
        controller.run(&mut capture, &RunLimits::default()).unwrap();

        assert!(capture.frames.len() > 2);
        for (i, (epoch, batch, _)) in capture.frames.iter().enumerate() {
            assert_eq!(*epoch, 0);
            assert_eq!(*batch as usize, i);
        }
    }
}
