use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::bail;
use ferry::core::mmap::MmapFile;
use ferry::core::region::REGION_HEADER_SIZE;
use ferry::core::{ChannelConfig, Direction, FramedRegion, NamedSemaphore, Role};
use ferry::ipc::{handshake, DuplexChannel};
use ferry::protocol::{ArrayPayload, Message, Scalar, ScalarMap, ScalarValue, StepReturn};
use ferry::sim::{
    Action, Controller, ControllerState, LineWalk, Simulation, Worker, WorkerSummary,
};
use ferry::Error;
use tempfile::{tempdir, TempDir};

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

fn test_config(dir: &TempDir) -> ChannelConfig {
    let n = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    ChannelConfig::new(format!("it-roles-{}-{n}", std::process::id()), 6006)
        .with_region_dir(dir.path())
        .with_capacity(64 * 1024)
        .with_connect_timeout(Duration::from_secs(5))
}

fn spawn_worker<S, F>(config: &ChannelConfig, factory: F) -> JoinHandle<ferry::Result<WorkerSummary>>
where
    S: Simulation + 'static,
    F: FnOnce() -> anyhow::Result<S> + Send + 'static,
{
    let config = config.clone();
    thread::spawn(move || Worker::new(factory, config)?.run())
}

fn assert_torn_down(config: &ChannelConfig) -> ferry::Result<()> {
    for name in config.semaphore_names() {
        assert!(!NamedSemaphore::exists(&name)?, "{name} survived teardown");
    }
    for path in config.region_paths() {
        assert!(!path.exists(), "{} survived teardown", path.display());
    }
    Ok(())
}

/// Echoes every action back as the observation and remembers what it saw.
struct Recorder {
    seen: Arc<Mutex<Vec<Action>>>,
}

impl Simulation for Recorder {
    fn reset(&mut self, seed: Option<i64>, _options: ScalarMap) -> anyhow::Result<(ArrayPayload, ScalarMap)> {
        let mut info = ScalarMap::new();
        info.insert("seed".to_string(), seed.map_or(ScalarValue::Bool(false), |s| (s as f64).into()));
        Ok((ArrayPayload::from_f64s(&[0.0], &[1]), info))
    }

    fn step(&mut self, action: Action) -> anyhow::Result<StepReturn> {
        let observation = match &action {
            Action::Scalar(scalar) => ArrayPayload::from_f64s(&[scalar.as_f64()], &[1]),
            Action::Array(payload) => payload.clone(),
        };
        let mut seen = self.seen.lock().unwrap();
        seen.push(action);
        Ok(StepReturn {
            observation,
            reward: seen.len() as f64,
            ..StepReturn::default()
        })
    }
}

struct FailingStep;

impl Simulation for FailingStep {
    fn reset(&mut self, _seed: Option<i64>, _options: ScalarMap) -> anyhow::Result<(ArrayPayload, ScalarMap)> {
        Ok((ArrayPayload::discrete(0), ScalarMap::new()))
    }

    fn step(&mut self, _action: Action) -> anyhow::Result<StepReturn> {
        bail!("physics exploded")
    }
}

struct SlowStep(Duration);

impl Simulation for SlowStep {
    fn reset(&mut self, _seed: Option<i64>, _options: ScalarMap) -> anyhow::Result<(ArrayPayload, ScalarMap)> {
        Ok((ArrayPayload::discrete(0), ScalarMap::new()))
    }

    fn step(&mut self, _action: Action) -> anyhow::Result<StepReturn> {
        thread::sleep(self.0);
        Ok(StepReturn::default())
    }
}

#[test]
fn session_runs_and_tears_down() -> ferry::Result<()> {
    let dir = tempdir()?;
    let config = test_config(&dir);
    let worker = spawn_worker(&config, || Ok(LineWalk::new()));

    let mut controller = Controller::connect(&config)?;
    assert_eq!(controller.state(), ControllerState::Idle);
    let (observation, info) = controller.reset(Some(7), ScalarMap::new())?;
    assert_eq!(observation.shape, vec![2]);
    assert_eq!(info["seeded"], ScalarValue::Bool(true));

    for i in 0..10 {
        let step = controller.step(ArrayPayload::discrete(i % 2))?;
        assert_eq!(step.info["steps"], ScalarValue::Number((i + 1) as f64));
        assert_eq!(controller.state(), ControllerState::Idle);
    }
    controller.close()?;
    assert_eq!(controller.state(), ControllerState::Closed);
    controller.close()?;

    let summary = worker.join().unwrap()?;
    assert_eq!(summary, WorkerSummary { resets: 1, steps: 10 });
    assert_torn_down(&config)
}

#[test]
fn identifiers_are_reusable_once_close_returns() -> ferry::Result<()> {
    let dir = tempdir()?;
    let config = test_config(&dir);
    for _ in 0..20 {
        let worker = spawn_worker(&config, || Ok(LineWalk::new()));
        let mut controller = Controller::connect(&config)?;
        controller.reset(None, ScalarMap::new())?;
        controller.close()?;

        // The worker thread may still be tearing down here.
        assert_torn_down(&config)?;
        DuplexChannel::create(&config, Role::Worker)?.close()?;
        worker.join().unwrap()?;
    }
    Ok(())
}

#[test]
fn same_seed_reproduces_episode() -> ferry::Result<()> {
    fn episode(config: &ChannelConfig) -> ferry::Result<Vec<StepReturn>> {
        let worker = spawn_worker(config, || Ok(LineWalk::new()));
        let mut controller = Controller::connect(config)?;
        let (observation, _) = controller.reset(Some(7), ScalarMap::new())?;
        let mut steps = vec![StepReturn {
            observation,
            ..StepReturn::default()
        }];
        for i in 0..20 {
            steps.push(controller.step(ArrayPayload::discrete(i % 3))?);
        }
        controller.close()?;
        worker.join().unwrap()?;
        Ok(steps)
    }

    let dir = tempdir()?;
    let first = episode(&test_config(&dir))?;
    let second = episode(&test_config(&dir))?;
    assert_eq!(first, second);

    // Same trajectory as driving the simulation in-process.
    let mut local = LineWalk::new();
    let (observation, _) = local.reset(Some(7), ScalarMap::new()).unwrap();
    assert_eq!(first[0].observation, observation);
    let local_first = local.step(Action::Scalar(Scalar::Int(0))).unwrap();
    assert_eq!(first[1], local_first);
    Ok(())
}

#[test]
fn replies_follow_request_order() -> ferry::Result<()> {
    const STEPS: usize = 200;
    let dir = tempdir()?;
    let config = test_config(&dir);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder_seen = Arc::clone(&seen);
    let worker = spawn_worker(&config, move || Ok(Recorder { seen: recorder_seen }));

    let mut controller = Controller::connect(&config)?;
    controller.reset(None, ScalarMap::new())?;
    for i in 0..STEPS {
        let step = controller.step(ArrayPayload::discrete(i as i64))?;
        assert_eq!(step.observation.to_f64_vec()?, vec![i as f64]);
        assert_eq!(step.reward, (i + 1) as f64);
    }
    controller.close()?;
    worker.join().unwrap()?;

    let seen = seen.lock().unwrap();
    let expected: Vec<Action> = (0..STEPS as i64)
        .map(|i| Action::Scalar(Scalar::Int(i)))
        .collect();
    assert_eq!(*seen, expected);
    Ok(())
}

#[test]
fn single_element_actions_arrive_as_scalars() -> ferry::Result<()> {
    let dir = tempdir()?;
    let config = test_config(&dir);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder_seen = Arc::clone(&seen);
    let worker = spawn_worker(&config, move || Ok(Recorder { seen: recorder_seen }));

    let mut controller = Controller::connect(&config)?;
    controller.reset(Some(3), ScalarMap::new())?;
    let vector = ArrayPayload::from_f64s(&[0.5, -1.5], &[2]);
    let unknown = ArrayPayload::new(vec![0u8; 2], vec![1], "float16");
    controller.step(ArrayPayload::discrete(3))?;
    controller.step(ArrayPayload::from_f64s(&[2.5], &[]))?;
    controller.step(vector.clone())?;
    controller.step(unknown.clone())?;
    controller.close()?;
    worker.join().unwrap()?;

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            Action::Scalar(Scalar::Int(3)),
            Action::Scalar(Scalar::Float(2.5)),
            Action::Array(vector),
            Action::Array(unknown),
        ]
    );
    Ok(())
}

#[test]
fn oversize_action_keeps_controller_idle() -> ferry::Result<()> {
    let dir = tempdir()?;
    let config = test_config(&dir).with_capacity(256);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder_seen = Arc::clone(&seen);
    let worker = spawn_worker(&config, move || Ok(Recorder { seen: recorder_seen }));

    let mut controller = Controller::connect(&config)?;
    controller.reset(None, ScalarMap::new())?;
    let huge = ArrayPayload::from_f64s(&[1.0; 64], &[64]);
    assert!(matches!(
        controller.step(huge),
        Err(Error::CapacityExceeded { .. })
    ));
    assert_eq!(controller.state(), ControllerState::Idle);

    controller.step(ArrayPayload::discrete(1))?;
    controller.close()?;
    let summary = worker.join().unwrap()?;
    assert_eq!(summary.steps, 1);
    assert_eq!(seen.lock().unwrap().len(), 1);
    Ok(())
}

#[test]
fn reserved_seed_is_rejected_locally() -> ferry::Result<()> {
    let dir = tempdir()?;
    let config = test_config(&dir);
    let worker = spawn_worker(&config, || Ok(LineWalk::new()));

    let mut controller = Controller::connect(&config)?;
    assert!(matches!(
        controller.reset(Some(-1), ScalarMap::new()),
        Err(Error::Unsupported(_))
    ));
    assert_eq!(controller.state(), ControllerState::Idle);
    controller.reset(Some(-2), ScalarMap::new())?;
    controller.close()?;
    assert_eq!(worker.join().unwrap()?.resets, 1);
    Ok(())
}

#[test]
fn reset_options_reach_the_simulation() -> ferry::Result<()> {
    let dir = tempdir()?;
    let config = test_config(&dir);
    let worker = spawn_worker(&config, || Ok(LineWalk::new()));

    let mut controller = Controller::connect(&config)?;
    let mut options = ScalarMap::new();
    options.insert("max_steps".to_string(), 2.0.into());
    controller.reset(Some(11), options)?;
    assert!(!controller.step(ArrayPayload::discrete(1))?.truncated);
    let (observation, _reward, terminated, truncated, info): (
        ArrayPayload,
        f64,
        bool,
        bool,
        ScalarMap,
    ) = controller.step(ArrayPayload::discrete(0))?.into();
    assert_eq!(observation.shape, vec![2]);
    assert!(!terminated);
    assert!(truncated);
    assert_eq!(info["steps"], ScalarValue::Number(2.0));
    controller.close()?;
    worker.join().unwrap()?;
    Ok(())
}

#[test]
fn simulation_failure_reaches_controller_as_peer_closed() -> ferry::Result<()> {
    let dir = tempdir()?;
    let config = test_config(&dir);
    let worker = spawn_worker(&config, || Ok(FailingStep));

    let mut controller = Controller::connect(&config)?;
    controller.reset(None, ScalarMap::new())?;
    assert!(matches!(
        controller.step(ArrayPayload::discrete(1)),
        Err(Error::PeerClosed)
    ));
    assert_eq!(controller.state(), ControllerState::Failed);
    assert!(matches!(
        controller.step(ArrayPayload::discrete(1)),
        Err(Error::ProtocolViolation(_))
    ));

    let err = worker.join().unwrap().unwrap_err();
    assert!(matches!(err, Error::Simulation(_)));
    assert!(err.to_string().contains("simulation failed"));
    controller.close()?;
    assert_eq!(controller.state(), ControllerState::Closed);
    assert_torn_down(&config)
}

#[test]
fn failing_factory_creates_nothing() -> ferry::Result<()> {
    let dir = tempdir()?;
    let config = test_config(&dir);
    let result = Worker::<LineWalk>::new(|| bail!("no licence"), config.clone());
    assert!(matches!(result, Err(Error::Simulation(_))));
    assert_torn_down(&config)
}

#[test]
fn worker_gives_up_without_controller() -> ferry::Result<()> {
    let dir = tempdir()?;
    let config = test_config(&dir).with_connect_timeout(Duration::from_millis(30));
    let err = Worker::new(|| Ok(LineWalk::new()), config.clone())?
        .run()
        .unwrap_err();
    assert!(matches!(err, Error::Timeout("handshake")));
    assert_torn_down(&config)
}

#[test]
fn unexpected_request_aborts_worker() -> ferry::Result<()> {
    let dir = tempdir()?;
    let config = test_config(&dir);
    let worker = spawn_worker(&config, || Ok(LineWalk::new()));

    let mut raw = DuplexChannel::connect(&config, Role::Controller, config.connect_timeout())?;
    handshake::accept(&mut raw, Some(config.connect_timeout()))?;
    raw.send(&Message::Status.encode()?)?;
    let reply = Message::decode(&raw.receive_timeout(Some(Duration::from_secs(5)))?)?;
    assert_eq!(reply, Message::Close);

    let err = worker.join().unwrap().unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation(_)));
    Ok(())
}

#[test]
fn corrupt_request_closes_controller_side() -> ferry::Result<()> {
    let dir = tempdir()?;
    let config = test_config(&dir);
    let worker = spawn_worker(&config, || Ok(LineWalk::new()));

    let mut raw = DuplexChannel::connect(&config, Role::Controller, config.connect_timeout())?;
    handshake::accept(&mut raw, Some(config.connect_timeout()))?;

    // Publish a request whose payload no longer matches its checksum.
    let path = config.region_path(Direction::ControllerToWorker);
    let request = Message::Action(ArrayPayload::discrete(1)).encode()?;
    FramedRegion::open(&path)?.write(&request)?;
    MmapFile::open(&path)?.range_mut(REGION_HEADER_SIZE, 1)?[0] ^= 0xFF;
    NamedSemaphore::open(&config.ready_name(Direction::ControllerToWorker))?.release()?;

    let reply = Message::decode(&raw.receive_timeout(Some(Duration::from_secs(5)))?)?;
    assert_eq!(reply, Message::Close);

    let err = worker.join().unwrap().unwrap_err();
    assert!(matches!(err, Error::Corrupt(_)));
    assert_torn_down(&config)
}

#[test]
fn reply_timeout_fails_controller() -> ferry::Result<()> {
    let dir = tempdir()?;
    let config = test_config(&dir).with_recv_timeout(Some(Duration::from_millis(100)));
    let worker = spawn_worker(&config, || Ok(SlowStep(Duration::from_millis(500))));

    let mut controller = Controller::connect(&config)?;
    controller.reset(None, ScalarMap::new())?;
    assert!(matches!(
        controller.step(ArrayPayload::discrete(1)),
        Err(Error::Timeout(_))
    ));
    assert_eq!(controller.state(), ControllerState::Failed);

    // Drain the late reply and shut the worker down by hand.
    let mut raw = DuplexChannel::open(&config, Role::Controller)?;
    let late = Message::decode(&raw.receive_timeout(Some(Duration::from_secs(5)))?)?;
    assert!(matches!(late, Message::StepReturn(_)));
    raw.send(&Message::Close.encode()?)?;
    let ack = Message::decode(&raw.receive_timeout(Some(Duration::from_secs(5)))?)?;
    assert_eq!(ack, Message::Status);

    assert_eq!(worker.join().unwrap()?.steps, 1);
    Ok(())
}

#[test]
fn dropping_idle_controller_closes_worker() -> ferry::Result<()> {
    let dir = tempdir()?;
    let config = test_config(&dir);
    let worker = spawn_worker(&config, || Ok(LineWalk::new()));

    let mut controller = Controller::connect(&config)?;
    controller.reset(Some(1), ScalarMap::new())?;
    drop(controller);

    let summary = worker.join().unwrap()?;
    assert_eq!(summary.resets, 1);
    assert_torn_down(&config)
}
