use crate::action_mapper::{ActionMapper, ActionMode, ArmSide, MappedAction, ACTION_DIM};
use crate::error::{
    DeviceError, InferenceError, MalformedActionError, PipelineError, ValidationError,
};
use crate::frame_sink::FrameSink;
use crate::observation::{NormalizedObservation, ObservationNormalizer, RawObservation, StateVector};
use crate::policy::{Policy, PolicyInput};
use crate::robot::Robot;
use std::{collections::BTreeMap, fmt, future::Future, path::PathBuf, time::Duration};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct DriverSettings {
    pub max_steps: usize,
    /// Compute everything but never call the actuators
    pub dry_run: bool,
    pub action_mode: ActionMode,
    /// Pause after every step, bounds the command rate
    pub step_delay: Duration,
    pub task: Option<String>,
}

impl Default for DriverSettings {
    fn default() -> Self {
        DriverSettings {
            max_steps: 3,
            dry_run: false,
            action_mode: ActionMode::Absolute,
            step_delay: Duration::from_millis(500),
            task: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Observe,
    Validate,
    Normalize,
    Infer,
    MapAction,
    Act,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::Observe => "observe",
            Stage::Validate => "validate",
            Stage::Normalize => "normalize",
            Stage::Infer => "infer",
            Stage::MapAction => "map_action",
            Stage::Act => "act",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        steps: usize,
    },
    Aborted {
        step: usize,
        stage: Stage,
        error: PipelineError,
    },
    /// `steps` counts finished steps, a step cut short stays in the report
    Interrupted {
        steps: usize,
    },
}

/// What happened in one loop iteration
#[derive(Debug, Clone, Default)]
pub struct StepTrace {
    pub step: usize,
    pub camera_shapes: BTreeMap<String, Option<Vec<usize>>>,
    pub issues: Vec<ValidationError>,
    pub state: Option<StateVector>,
    /// The part of the first action frame that was consumed
    pub action: Option<Vec<f32>>,
    pub mapped: Option<MappedAction>,
    pub skipped: Option<MalformedActionError>,
    pub actuated: bool,
    pub saved_frames: Vec<PathBuf>,
    /// Reached the end of the step, also true for a skipped action
    pub completed: bool,
}

impl StepTrace {
    fn new(step: usize) -> Self {
        StepTrace {
            step,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub steps: Vec<StepTrace>,
    /// Result of the final reset, `None` if the robot never came up
    pub cleanup: Option<Result<(), DeviceError>>,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed { .. })
    }
}

type StepResult = Result<(), (Stage, PipelineError)>;

/// Runs observe -> normalize -> infer -> map -> act for a bounded number of steps
pub struct StepDriver<R, P> {
    robot: R,
    policy: P,
    normalizer: ObservationNormalizer,
    mapper: ActionMapper,
    settings: DriverSettings,
    frame_sink: Option<Box<dyn FrameSink>>,
}

impl<R: Robot, P: Policy> StepDriver<R, P> {
    pub fn new(
        robot: R,
        policy: P,
        normalizer: ObservationNormalizer,
        mapper: ActionMapper,
        settings: DriverSettings,
    ) -> Self {
        StepDriver {
            robot,
            policy,
            normalizer,
            mapper,
            settings,
            frame_sink: None,
        }
    }

    pub fn with_frame_sink(mut self, sink: Box<dyn FrameSink>) -> Self {
        self.frame_sink = Some(sink);
        self
    }

    pub fn robot(&self) -> &R {
        &self.robot
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub async fn run(&mut self) -> RunReport {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run until done, aborted or `shutdown` resolves
    ///
    /// Once `set_up` succeeded the robot is reset exactly once on the way out.
    pub async fn run_until<F>(&mut self, shutdown: F) -> RunReport
    where
        F: Future<Output = ()>,
    {
        info!(
            "Starting run: max_steps={} dry_run={} action_mode={} task={:?}",
            self.settings.max_steps,
            self.settings.dry_run,
            self.settings.action_mode,
            self.settings.task
        );
        let mut steps = Vec::new();
        if let Err(error) = self.robot.set_up().await {
            error!("Robot set up failed: {}", error);
            return RunReport {
                outcome: RunOutcome::Aborted {
                    step: 0,
                    stage: Stage::Init,
                    error: error.into(),
                },
                steps,
                cleanup: None,
            };
        }
        info!("Robot set up");

        let outcome = tokio::select! {
            outcome = self.run_steps(&mut steps) => Some(outcome),
            _ = shutdown => None,
        };
        let outcome = outcome.unwrap_or_else(|| {
            let finished = steps.iter().filter(|trace| trace.completed).count();
            warn!("Interrupted after {} steps", finished);
            RunOutcome::Interrupted { steps: finished }
        });

        match &outcome {
            RunOutcome::Completed { steps } => info!("Run completed after {} steps", steps),
            RunOutcome::Aborted { step, stage, error } => {
                error!("Run aborted in step {} at {}: {}", step + 1, stage, error)
            }
            RunOutcome::Interrupted { .. } => {}
        }

        info!("Resetting robot");
        let cleanup = self.robot.reset().await;
        match &cleanup {
            Ok(()) => info!("Robot reset"),
            Err(error) => error!("Robot reset failed: {}", error),
        }
        RunReport {
            outcome,
            steps,
            cleanup: Some(cleanup),
        }
    }

    async fn run_steps(&mut self, steps: &mut Vec<StepTrace>) -> RunOutcome {
        if let Err(error) = self.robot.reset().await {
            return RunOutcome::Aborted {
                step: 0,
                stage: Stage::Init,
                error: error.into(),
            };
        }
        info!("Robot at start pose");

        for step in 0..self.settings.max_steps {
            info!("===== step {}/{} =====", step + 1, self.settings.max_steps);
            // filled in place, an interrupt leaves the partial trace behind
            steps.push(StepTrace::new(step));
            let index = steps.len() - 1;
            if let Err((stage, error)) = self.step(&mut steps[index]).await {
                return RunOutcome::Aborted { step, stage, error };
            }
            steps[index].completed = true;
            sleep(self.settings.step_delay).await;
        }
        RunOutcome::Completed {
            steps: self.settings.max_steps,
        }
    }

    async fn step(&mut self, trace: &mut StepTrace) -> StepResult {
        let step = trace.step;

        enter(step, Stage::Observe);
        let raw = self
            .robot
            .get()
            .await
            .map_err(|error| (Stage::Observe, PipelineError::from(error)))?;
        log_raw(&raw);
        trace.camera_shapes = raw.camera_shapes();

        enter(step, Stage::Validate);
        let normalized = self.normalizer.normalize(&raw);
        for issue in &normalized.issues {
            warn!("{}", issue);
        }
        if !normalized.issues.is_empty() {
            warn!(
                "{} observation problems, continuing with defaults",
                normalized.issues.len()
            );
        }
        trace.issues = normalized.issues;

        enter(step, Stage::Normalize);
        let observation = normalized.observation;
        log_normalized(&observation);
        self.save_frames(&observation, trace);
        trace.state = Some(observation.state);

        enter(step, Stage::Infer);
        let input = PolicyInput::new(observation, self.settings.task.clone());
        let chunk = self
            .policy
            .infer(&input)
            .await
            .map_err(|error| (Stage::Infer, PipelineError::from(error)))?
            .into_chunk()
            .ok_or_else(|| (Stage::Infer, PipelineError::from(InferenceError::NoActions)))?;
        let (frames, width) = chunk.shape();
        info!("Action chunk: {} frames x {} values", frames, width);
        if let Some(frame) = chunk.first_frame() {
            let consumed = frame[..frame.len().min(ACTION_DIM)].to_vec();
            info!("First frame: {:.4?}", consumed);
            trace.action = Some(consumed);
        }

        enter(step, Stage::MapAction);
        let mapped = match self
            .mapper
            .map_chunk(&chunk, &input.state, self.settings.action_mode)
        {
            Ok(mapped) => mapped,
            Err(error) => {
                warn!("Skipping step {}: {}", step + 1, error);
                trace.skipped = Some(error);
                return Ok(());
            }
        };
        log_mapping(&mapped, self.settings.action_mode);
        let mapped = trace.mapped.insert(mapped);

        enter(step, Stage::Act);
        for (side, arm) in mapped.command.arms() {
            info!(
                "Command {} joints {:.2?} deg gripper {}",
                side,
                arm.joint_degrees().as_slice(),
                arm.gripper
            );
        }
        if self.settings.dry_run {
            info!("[DRY-RUN] not sending command");
        } else {
            self.robot
                .move_arms(&mapped.command)
                .await
                .map_err(|error| (Stage::Act, PipelineError::from(error)))?;
            info!("Command sent");
            trace.actuated = true;
        }
        Ok(())
    }

    fn save_frames(&mut self, observation: &NormalizedObservation, trace: &mut StepTrace) {
        let Some(sink) = self.frame_sink.as_mut() else {
            return;
        };
        for (camera, image) in &observation.images {
            match sink.save(trace.step, camera, image) {
                Ok(path) => {
                    info!("Saved {:?}", path);
                    trace.saved_frames.push(path);
                }
                Err(error) => warn!("Failed to save {}: {}", camera, error),
            }
        }
    }
}

fn enter(step: usize, stage: Stage) {
    debug!("step {} -> {}", step + 1, stage);
}

fn log_raw(raw: &RawObservation) {
    for (camera, frame) in &raw.cameras {
        match frame {
            Some(frame) => info!(
                "{}: shape={:?} dtype={} range={:?}",
                camera,
                frame.shape,
                frame.pixels.dtype(),
                frame.pixels.range()
            ),
            None => info!("{}: no image", camera),
        }
    }
    for (arm, reading) in &raw.arms {
        info!(
            "{}: joint={:.4?} gripper={:.4?}",
            arm, reading.joint, reading.gripper
        );
    }
}

fn log_normalized(observation: &NormalizedObservation) {
    for (camera, image) in &observation.images {
        let (width, height) = image.dimensions();
        debug!("{}: {}x{}x3 u8", camera, height, width);
    }
    debug!("state {:.4?}", observation.state.as_slice());
    for side in ArmSide::BOTH {
        let joints = observation.joints(side);
        info!(
            "{} joints {:.4?} rad {:.2?} deg gripper {:.4}",
            side,
            joints.as_slice(),
            joints.map(f32::to_degrees).as_slice(),
            observation.gripper(side)
        );
    }
}

fn log_mapping(mapped: &MappedAction, mode: ActionMode) {
    for (side, arm) in mapped.requested.arms() {
        info!("{} {} target {:.4?}", mode, side, arm.joint.as_slice());
    }
    for record in &mapped.clamps {
        let line = format!(
            "{} joint {}: {:7.2}° -> {:7.2}° [{:7.1}°, {:7.1}°]",
            record.arm,
            record.joint,
            record.requested.to_degrees(),
            record.applied.to_degrees(),
            record.limit.start().to_degrees(),
            record.limit.end().to_degrees()
        );
        if record.was_clamped() {
            warn!("{} clamped", line);
        } else {
            debug!("{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_mapper::MoveCommand;
    use crate::deploy_config::DeployConfig;
    use crate::frame_sink::PngFrameSink;
    use crate::policy::{ActionChunk, PolicyOutput, ZeroPolicy};
    use crate::robot::SimulatedRobot;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct FlakyRobot {
        inner: SimulatedRobot,
        fail_set_up: bool,
        fail_get_at: Option<usize>,
        fail_move: bool,
    }

    impl FlakyRobot {
        fn new() -> Self {
            FlakyRobot {
                inner: SimulatedRobot::new(&DeployConfig::included()).with_frame_size(48, 64),
                fail_set_up: false,
                fail_get_at: None,
                fail_move: false,
            }
        }
    }

    #[async_trait]
    impl Robot for FlakyRobot {
        async fn set_up(&mut self) -> Result<(), DeviceError> {
            if self.fail_set_up {
                return Err(DeviceError::Connection {
                    device: "can0".to_owned(),
                    message: "no such device".to_owned(),
                });
            }
            self.inner.set_up().await
        }

        async fn reset(&mut self) -> Result<(), DeviceError> {
            self.inner.reset().await
        }

        async fn get(&mut self) -> Result<RawObservation, DeviceError> {
            if Some(self.inner.calls().get) == self.fail_get_at {
                return Err(DeviceError::Sensor {
                    sensor: "cam_head".to_owned(),
                    message: "timeout".to_owned(),
                });
            }
            self.inner.get().await
        }

        async fn move_arms(&mut self, command: &MoveCommand) -> Result<(), DeviceError> {
            if self.fail_move {
                return Err(DeviceError::Actuator {
                    arm: "left_arm".to_owned(),
                    message: "bus off".to_owned(),
                });
            }
            self.inner.move_arms(command).await
        }
    }

    struct ScriptedPolicy {
        outputs: VecDeque<Result<PolicyOutput, InferenceError>>,
    }

    #[async_trait]
    impl Policy for ScriptedPolicy {
        async fn infer(&mut self, _input: &PolicyInput) -> Result<PolicyOutput, InferenceError> {
            self.outputs
                .pop_front()
                .unwrap_or_else(|| Err(InferenceError::Exhausted(0)))
        }
    }

    struct StalledPolicy;

    #[async_trait]
    impl Policy for StalledPolicy {
        async fn infer(&mut self, _input: &PolicyInput) -> Result<PolicyOutput, InferenceError> {
            std::future::pending::<()>().await;
            Err(InferenceError::NoActions)
        }
    }

    fn settings(max_steps: usize, dry_run: bool) -> DriverSettings {
        DriverSettings {
            max_steps,
            dry_run,
            step_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    fn driver<P: Policy>(
        robot: FlakyRobot,
        policy: P,
        settings: DriverSettings,
    ) -> StepDriver<FlakyRobot, P> {
        StepDriver::new(
            robot,
            policy,
            ObservationNormalizer::default(),
            ActionMapper::default(),
            settings,
        )
    }

    #[tokio::test]
    async fn dry_run_never_moves() {
        let mut driver = driver(FlakyRobot::new(), ZeroPolicy::new(14, 2), settings(3, true));
        let report = driver.run().await;
        assert!(matches!(report.outcome, RunOutcome::Completed { steps: 3 }));
        assert_eq!(report.steps.len(), 3);
        assert!(report.steps.iter().all(|step| !step.actuated && step.mapped.is_some()));
        let calls = driver.robot().inner.calls();
        assert_eq!(calls.move_arms, 0);
        assert_eq!(calls.get, 3);
        // start pose plus cleanup
        assert_eq!(calls.reset, 2);
        assert!(matches!(report.cleanup, Some(Ok(()))));
    }

    #[tokio::test]
    async fn execution_moves_every_step() {
        let mut driver = driver(FlakyRobot::new(), ZeroPolicy::new(16, 1), settings(2, false));
        let report = driver.run().await;
        assert!(report.is_completed());
        assert!(report.steps.iter().all(|step| step.actuated));
        assert_eq!(driver.robot().inner.calls().move_arms, 2);
        let sent = driver.robot().inner.last_command().unwrap();
        assert_eq!(sent, &report.steps[1].mapped.as_ref().unwrap().command);
        assert_eq!(report.steps[0].action.as_ref().unwrap().len(), ACTION_DIM);
    }

    #[tokio::test]
    async fn sensor_failure_aborts_and_resets_once() {
        let mut robot = FlakyRobot::new();
        robot.fail_get_at = Some(1);
        let mut driver = driver(robot, ZeroPolicy::new(14, 1), settings(5, false));
        let report = driver.run().await;
        match report.outcome {
            RunOutcome::Aborted {
                step: 1,
                stage: Stage::Observe,
                error: PipelineError::Device(DeviceError::Sensor { .. }),
            } => {}
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(report.steps.len(), 2);
        assert_eq!(driver.robot().inner.calls().reset, 2);
        assert_eq!(driver.robot().inner.calls().move_arms, 1);
    }

    #[tokio::test]
    async fn move_failure_aborts() {
        let mut robot = FlakyRobot::new();
        robot.fail_move = true;
        let mut driver = driver(robot, ZeroPolicy::new(14, 1), settings(3, false));
        let report = driver.run().await;
        assert!(matches!(
            report.outcome,
            RunOutcome::Aborted {
                step: 0,
                stage: Stage::Act,
                ..
            }
        ));
        assert_eq!(driver.robot().inner.calls().reset, 2);
        let failed = &report.steps[0];
        assert!(!failed.actuated);
        assert!(!failed.completed);
        assert!(failed.mapped.is_some());
    }

    #[tokio::test]
    async fn inference_failure_aborts() {
        let policy = ScriptedPolicy {
            outputs: VecDeque::from(vec![Err(InferenceError::Other(anyhow::anyhow!("cuda")))]),
        };
        let mut driver = driver(FlakyRobot::new(), policy, settings(3, false));
        let report = driver.run().await;
        assert!(matches!(
            report.outcome,
            RunOutcome::Aborted {
                step: 0,
                stage: Stage::Infer,
                error: PipelineError::Inference(InferenceError::Other(_)),
            }
        ));
        assert_eq!(driver.robot().inner.calls().reset, 2);
        assert_eq!(driver.robot().inner.calls().move_arms, 0);
    }

    #[tokio::test]
    async fn empty_output_aborts() {
        let policy = ScriptedPolicy {
            outputs: VecDeque::from(vec![Ok(PolicyOutput::Mapping(BTreeMap::new()))]),
        };
        let mut driver = driver(FlakyRobot::new(), policy, settings(3, false));
        let report = driver.run().await;
        assert!(matches!(
            report.outcome,
            RunOutcome::Aborted {
                stage: Stage::Infer,
                error: PipelineError::Inference(InferenceError::NoActions),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn malformed_action_skips_only_that_step() {
        let policy = ScriptedPolicy {
            outputs: VecDeque::from(vec![
                Ok(PolicyOutput::Chunk(ActionChunk::from_vector(vec![0.0; 7]))),
                Ok(PolicyOutput::Chunk(ActionChunk::from_vector(vec![0.0; 14]))),
            ]),
        };
        let mut driver = driver(FlakyRobot::new(), policy, settings(2, false));
        let report = driver.run().await;
        assert!(report.is_completed());
        assert_eq!(
            report.steps[0].skipped,
            Some(MalformedActionError::TooShort {
                len: 7,
                required: ACTION_DIM
            })
        );
        assert!(!report.steps[0].actuated);
        assert!(report.steps[1].actuated);
        assert_eq!(driver.robot().inner.calls().move_arms, 1);
    }

    #[tokio::test]
    async fn set_up_failure_skips_cleanup() {
        let mut robot = FlakyRobot::new();
        robot.fail_set_up = true;
        let mut driver = driver(robot, ZeroPolicy::new(14, 1), settings(3, false));
        let report = driver.run().await;
        assert!(matches!(
            report.outcome,
            RunOutcome::Aborted {
                stage: Stage::Init,
                ..
            }
        ));
        assert!(report.cleanup.is_none());
        assert_eq!(driver.robot().inner.calls().reset, 0);
    }

    #[tokio::test]
    async fn interrupt_still_resets() {
        let mut driver = driver(FlakyRobot::new(), StalledPolicy, settings(3, false));
        let report = driver
            .run_until(tokio::time::sleep(Duration::from_millis(10)))
            .await;
        assert!(matches!(report.outcome, RunOutcome::Interrupted { steps: 0 }));
        assert_eq!(driver.robot().inner.calls().reset, 2);
        assert!(matches!(report.cleanup, Some(Ok(()))));

        // the step stuck in inference is still reported
        assert_eq!(report.steps.len(), 1);
        let partial = &report.steps[0];
        assert!(!partial.completed);
        assert!(partial.state.is_some());
        assert_eq!(partial.camera_shapes.len(), 3);
        assert!(partial.action.is_none());
    }

    #[tokio::test]
    async fn saves_debug_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver(FlakyRobot::new(), ZeroPolicy::new(14, 1), settings(2, true))
            .with_frame_sink(Box::new(PngFrameSink::new(dir.path())));
        let report = driver.run().await;
        assert!(report.is_completed());
        assert_eq!(report.steps[1].saved_frames.len(), 3);
        assert!(dir.path().join("step_0001_cam_high.png").exists());
        assert!(dir.path().join("step_0000_cam_right_wrist.png").exists());
    }

    #[tokio::test]
    async fn observation_issues_are_recorded_not_fatal() {
        let mut config = DeployConfig::included();
        config.cameras.pop();
        let robot = FlakyRobot {
            inner: SimulatedRobot::new(&config).with_frame_size(8, 8),
            fail_set_up: false,
            fail_get_at: None,
            fail_move: false,
        };
        let mut driver = driver(robot, ZeroPolicy::new(14, 1), settings(1, true));
        let report = driver.run().await;
        assert!(report.is_completed());
        assert_eq!(
            report.steps[0].issues,
            vec![ValidationError::MissingCamera {
                camera: "cam_right_wrist".to_owned()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn steps_are_paced() {
        let settings = DriverSettings {
            max_steps: 3,
            dry_run: true,
            ..Default::default()
        };
        let mut driver = driver(FlakyRobot::new(), ZeroPolicy::new(14, 1), settings);
        let start = tokio::time::Instant::now();
        let report = driver.run().await;
        assert!(report.is_completed());
        assert!(report.steps.iter().all(|step| step.completed));
        assert!(start.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_steps_are_paced() {
        let policy = ScriptedPolicy {
            outputs: VecDeque::from(vec![
                Ok(PolicyOutput::Chunk(ActionChunk::from_vector(vec![0.0; 3]))),
                Ok(PolicyOutput::Chunk(ActionChunk::from_vector(vec![0.0; 3]))),
            ]),
        };
        let settings = DriverSettings {
            max_steps: 2,
            ..Default::default()
        };
        let mut driver = driver(FlakyRobot::new(), policy, settings);
        let start = tokio::time::Instant::now();
        let report = driver.run().await;
        assert!(matches!(report.outcome, RunOutcome::Completed { steps: 2 }));
        for step in &report.steps {
            assert!(step.skipped.is_some());
            assert!(step.completed);
        }
        assert_eq!(driver.robot().inner.calls().move_arms, 0);
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }
}
