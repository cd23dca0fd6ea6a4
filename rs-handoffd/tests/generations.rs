//! Generations running side by side in one process, replacing each other
//! through a `LocalUpgrader`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use handoffd::signals::{self, CommandSender};
use handoffd::upgrader::fds::FdRegistry;
use handoffd::upgrader::Spawner;
use handoffd::{
    Coordinator, DrainSet, EchoHandler, Error, Exit, GenerationState, LocalUpgrader, Network,
    ServerConf, UpgradeError, Upgrader,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

struct Generation {
    commands: CommandSender,
    state: watch::Receiver<GenerationState>,
    run: JoinHandle<handoffd::Result<Exit>>,
}

impl Generation {
    fn start(conf: ServerConf, upgrader: Arc<dyn Upgrader>) -> Self {
        let (commands, receiver) = signals::channel();
        let coordinator = Coordinator::new(conf, upgrader, Arc::new(EchoHandler));
        let state = coordinator.state();
        let run = tokio::spawn(coordinator.run(receiver));
        Self {
            commands,
            state,
            run,
        }
    }

    async fn wait_for(&mut self, want: GenerationState) {
        tokio::time::timeout(WAIT, self.state.wait_for(|s| *s == want))
            .await
            .unwrap_or_else(|_| panic!("generation never reached {want:?}"))
            .expect("coordinator dropped its state");
    }

    async fn finish(self) -> handoffd::Result<Exit> {
        tokio::time::timeout(WAIT, self.run)
            .await
            .expect("generation did not exit")
            .expect("generation panicked")
    }
}

/// Every generation spawned through the shared spawner, oldest first.
#[derive(Clone, Default)]
struct Fleet {
    generations: Arc<Mutex<Vec<Generation>>>,
}

impl Fleet {
    fn spawner(&self, conf: ServerConf) -> Spawner {
        let generations = Arc::clone(&self.generations);
        Arc::new(move |child: LocalUpgrader| {
            let generation = Generation::start(conf.clone(), Arc::new(child));
            generations.lock().push(generation);
        })
    }

    fn len(&self) -> usize {
        self.generations.lock().len()
    }

    fn take(&self, index: usize) -> Generation {
        self.generations.lock().remove(index)
    }
}

fn unix_conf(dir: &tempfile::TempDir) -> (ServerConf, PathBuf) {
    let path = dir.path().join("echo.sock");
    let conf = ServerConf {
        listen: path.to_str().unwrap().to_string(),
        network: Network::Unix,
        ..ServerConf::default()
    };
    (conf, path)
}

async fn roundtrip(stream: &mut UnixStream, line: &str) -> String {
    stream
        .write_all(format!("{line}\n").as_bytes())
        .await
        .unwrap();
    let mut buf = vec![0u8; line.len() + 6];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("no reply")
        .unwrap();
    String::from_utf8(buf).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_serves_echo_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, path) = unix_conf(&dir);
    let fleet = Fleet::default();
    let upgrader = LocalUpgrader::new(fleet.spawner(conf.clone()));
    let mut server = Generation::start(conf, Arc::new(upgrader));
    server.wait_for(GenerationState::Serving).await;

    let mut client = UnixStream::connect(&path).await.unwrap();
    assert_eq!(roundtrip(&mut client, "hello").await, "echo hello\n");
    assert_eq!(roundtrip(&mut client, "").await, "echo \n");
    drop(client);

    server.commands.stop();
    assert_eq!(server.finish().await.unwrap(), Exit::Stopped);
    assert!(!path.exists(), "socket file is removed after a plain stop");
    assert_eq!(fleet.len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_drain_waits_for_live_connection() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, path) = unix_conf(&dir);
    let fleet = Fleet::default();
    let mut server = Generation::start(
        conf.clone(),
        Arc::new(LocalUpgrader::new(fleet.spawner(conf))),
    );
    server.wait_for(GenerationState::Serving).await;

    let mut client = UnixStream::connect(&path).await.unwrap();
    assert_eq!(roundtrip(&mut client, "one").await, "echo one\n");

    server.commands.stop();
    server.wait_for(GenerationState::Draining).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!server.run.is_finished(), "drain must wait for the open connection");

    // The handler answers the line it was waiting for, then lets go.
    assert_eq!(roundtrip(&mut client, "last").await, "echo last\n");
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    assert_eq!(server.finish().await.unwrap(), Exit::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_drain_timeout_gives_up() {
    let dir = tempfile::tempdir().unwrap();
    let (mut conf, path) = unix_conf(&dir);
    conf.graceful_shutdown_timeout_seconds = Some(1);
    let fleet = Fleet::default();
    let mut server = Generation::start(
        conf.clone(),
        Arc::new(LocalUpgrader::new(fleet.spawner(conf))),
    );
    server.wait_for(GenerationState::Serving).await;

    let mut idle = UnixStream::connect(&path).await.unwrap();
    assert_eq!(roundtrip(&mut idle, "hi").await, "echo hi\n");

    server.commands.stop();
    assert_eq!(server.finish().await.unwrap(), Exit::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upgrade_hands_over_listener_and_connection() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, path) = unix_conf(&dir);
    let fleet = Fleet::default();
    let mut old = Generation::start(
        conf.clone(),
        Arc::new(LocalUpgrader::new(fleet.spawner(conf))),
    );
    old.wait_for(GenerationState::Serving).await;

    let mut carried = UnixStream::connect(&path).await.unwrap();
    assert_eq!(roundtrip(&mut carried, "before").await, "echo before\n");

    old.commands.upgrade();
    old.wait_for(GenerationState::Draining).await;
    assert_eq!(fleet.len(), 1);
    let mut new = fleet.take(0);
    new.wait_for(GenerationState::Serving).await;

    // Only the successor accepts now.
    let mut fresh = UnixStream::connect(&path).await.unwrap();
    assert_eq!(roundtrip(&mut fresh, "fresh").await, "echo fresh\n");

    // The carried connection now belongs to the successor alone.
    assert_eq!(roundtrip(&mut carried, "during").await, "echo during\n");
    assert_eq!(old.finish().await.unwrap(), Exit::Upgraded);
    drop(carried);
    assert!(path.exists(), "the successor still listens on the path");

    assert_eq!(roundtrip(&mut fresh, "after").await, "echo after\n");
    drop(fresh);
    new.commands.stop();
    assert_eq!(new.finish().await.unwrap(), Exit::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_old_generation_lets_go_of_carried_connection() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, path) = unix_conf(&dir);
    let fleet = Fleet::default();
    let mut old = Generation::start(
        conf.clone(),
        Arc::new(LocalUpgrader::new(fleet.spawner(conf))),
    );
    old.wait_for(GenerationState::Serving).await;

    let mut carried = UnixStream::connect(&path).await.unwrap();
    assert_eq!(roundtrip(&mut carried, "before").await, "echo before\n");

    old.commands.upgrade();
    // No graceful timeout is set, so this only returns if the old generation
    // stops serving the idle carried client by itself.
    assert_eq!(old.finish().await.unwrap(), Exit::Upgraded);

    carried.write_all(b"a\nb\n").await.unwrap();
    let mut buf = vec![0u8; "echo a\necho b\n".len()];
    tokio::time::timeout(WAIT, carried.read_exact(&mut buf))
        .await
        .expect("both pipelined lines answered")
        .unwrap();
    assert_eq!(buf, b"echo a\necho b\n");

    drop(carried);
    let new = fleet.take(0);
    new.commands.stop();
    assert_eq!(new.finish().await.unwrap(), Exit::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_while_upgrading() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, _path) = unix_conf(&dir);
    let parked = Arc::new(Mutex::new(Vec::new()));
    let spawner: Spawner = {
        let parked = Arc::clone(&parked);
        Arc::new(move |child: LocalUpgrader| parked.lock().push(child))
    };
    let upgrader =
        Arc::new(LocalUpgrader::new(spawner).with_ready_timeout(Duration::from_secs(60)));
    let mut server = Generation::start(conf, upgrader.clone());
    server.wait_for(GenerationState::Serving).await;

    server.commands.upgrade();
    server.wait_for(GenerationState::Upgrading).await;
    server.commands.upgrade();
    server.commands.stop();

    assert_eq!(server.finish().await.unwrap(), Exit::Stopped);
    assert_eq!(upgrader.successors(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_connection_refused_during_handoff() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, path) = unix_conf(&dir);
    let fleet = Fleet::default();
    let mut old = Generation::start(
        conf.clone(),
        Arc::new(LocalUpgrader::new(fleet.spawner(conf))),
    );
    old.wait_for(GenerationState::Serving).await;

    let done = Arc::new(AtomicBool::new(false));
    let prober = {
        let done = Arc::clone(&done);
        let path = path.clone();
        tokio::spawn(async move {
            let (mut ok, mut refused) = (0usize, 0usize);
            while !done.load(Ordering::SeqCst) {
                match UnixStream::connect(&path).await {
                    Ok(conn) => {
                        ok += 1;
                        drop(conn);
                    }
                    Err(_) => refused += 1,
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            (ok, refused)
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    old.commands.upgrade();
    assert_eq!(old.finish().await.unwrap(), Exit::Upgraded);
    tokio::time::sleep(Duration::from_millis(20)).await;
    done.store(true, Ordering::SeqCst);

    let (ok, refused) = prober.await.unwrap();
    assert!(ok > 0);
    assert_eq!(refused, 0, "{refused} connection attempts were refused");

    let new = fleet.take(0);
    new.commands.stop();
    assert_eq!(new.finish().await.unwrap(), Exit::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_upgrade_keeps_serving() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, path) = unix_conf(&dir);
    // The successor is dropped without ever becoming ready.
    let upgrader = Arc::new(LocalUpgrader::new(Arc::new(|_child: LocalUpgrader| {})));
    let mut server = Generation::start(conf, upgrader.clone());
    server.wait_for(GenerationState::Serving).await;

    let mut client = UnixStream::connect(&path).await.unwrap();
    assert_eq!(roundtrip(&mut client, "a").await, "echo a\n");

    server.commands.upgrade();
    tokio::time::timeout(WAIT, async {
        while upgrader.successors() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("upgrade was attempted");
    server.wait_for(GenerationState::Serving).await;

    assert_eq!(roundtrip(&mut client, "b").await, "echo b\n");
    let mut other = UnixStream::connect(&path).await.unwrap();
    assert_eq!(roundtrip(&mut other, "c").await, "echo c\n");

    // A later request tries again.
    server.commands.upgrade();
    tokio::time::timeout(WAIT, async {
        while upgrader.successors() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("second upgrade was attempted");

    drop(client);
    drop(other);
    server.commands.stop();
    assert_eq!(server.finish().await.unwrap(), Exit::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_repeated_upgrade_requests_spawn_one_successor() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, _path) = unix_conf(&dir);
    let fleet = Fleet::default();
    let upgrader = Arc::new(LocalUpgrader::new(fleet.spawner(conf.clone())));
    let mut old = Generation::start(conf, upgrader.clone());
    old.wait_for(GenerationState::Serving).await;

    for _ in 0..5 {
        old.commands.upgrade();
    }
    assert_eq!(old.finish().await.unwrap(), Exit::Upgraded);
    assert_eq!(upgrader.successors(), 1);
    assert_eq!(fleet.len(), 1);

    // The exited generation refuses to upgrade again.
    assert!(matches!(
        upgrader.request_successor().await,
        Err(UpgradeError::Exiting)
    ));

    let mut new = fleet.take(0);
    new.wait_for(GenerationState::Serving).await;
    new.commands.stop();
    assert_eq!(new.finish().await.unwrap(), Exit::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_requests_are_rejected() {
    let parked = Arc::new(Mutex::new(Vec::new()));
    let spawner: Spawner = {
        let parked = Arc::clone(&parked);
        // Keep successors alive but never ready.
        Arc::new(move |child: LocalUpgrader| parked.lock().push(child))
    };
    let upgrader = LocalUpgrader::new(spawner).with_ready_timeout(Duration::from_millis(200));

    let (first, second) = tokio::join!(upgrader.request_successor(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        upgrader.request_successor().await
    });
    assert!(matches!(first, Err(UpgradeError::ReadyTimeout(_))));
    assert!(matches!(second, Err(UpgradeError::InProgress)));
    assert_eq!(upgrader.successors(), 1);
    assert_eq!(parked.lock().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listen_failure_is_fatal() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let conf = ServerConf {
        listen: taken.local_addr().unwrap().to_string(),
        network: Network::Tcp,
        ..ServerConf::default()
    };
    let upgrader = LocalUpgrader::new(Arc::new(|_child: LocalUpgrader| {}));
    let mut server = Generation::start(conf, Arc::new(upgrader));

    match server.run.await.unwrap() {
        Err(Error::Listen { network, .. }) => assert_eq!(network, Network::Tcp),
        other => panic!("expected a listen error, got {other:?}"),
    }
    assert_eq!(*server.state.borrow_and_update(), GenerationState::Exited);
}

/// Checks, at the moment the generation reports ready, that its accept loop
/// is registered and actually answering.
struct ReadyProbe {
    inner: LocalUpgrader,
    path: PathBuf,
    drain: Mutex<Option<DrainSet>>,
    accepting: AtomicBool,
    answered: AtomicBool,
    ready_calls: AtomicUsize,
}

#[async_trait]
impl Upgrader for ReadyProbe {
    fn registry(&self) -> &FdRegistry {
        self.inner.registry()
    }

    async fn request_successor(&self) -> Result<(), UpgradeError> {
        self.inner.request_successor().await
    }

    async fn signal_ready(&self) -> Result<(), UpgradeError> {
        let drain = self.drain.lock().clone().expect("drain set before run");
        self.accepting.store(drain.active() >= 1, Ordering::SeqCst);

        let mut conn = UnixStream::connect(&self.path).await.unwrap();
        let reply = roundtrip(&mut conn, "ready?").await;
        self.answered.store(reply == "echo ready?\n", Ordering::SeqCst);

        self.ready_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.signal_ready().await
    }

    async fn wait_for_exit(&self) {
        self.inner.wait_for_exit().await
    }

    fn stop(&self) {
        self.inner.stop()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ready_only_once_accepting() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, path) = unix_conf(&dir);
    let probe = Arc::new(ReadyProbe {
        inner: LocalUpgrader::new(Arc::new(|_child: LocalUpgrader| {})),
        path,
        drain: Mutex::new(None),
        accepting: AtomicBool::new(false),
        answered: AtomicBool::new(false),
        ready_calls: AtomicUsize::new(0),
    });

    let (commands, receiver) = signals::channel();
    let coordinator = Coordinator::new(conf, probe.clone(), Arc::new(EchoHandler));
    *probe.drain.lock() = Some(coordinator.drain());
    let mut state = coordinator.state();
    let run = tokio::spawn(coordinator.run(receiver));

    tokio::time::timeout(WAIT, state.wait_for(|s| *s == GenerationState::Serving))
        .await
        .expect("generation never served")
        .unwrap();
    assert_eq!(probe.ready_calls.load(Ordering::SeqCst), 1);
    assert!(probe.accepting.load(Ordering::SeqCst), "accept loop not registered");
    assert!(probe.answered.load(Ordering::SeqCst), "no echo before readiness");

    commands.stop();
    let exit = tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
    assert_eq!(exit.unwrap(), Exit::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upgrader_stop_ends_generation() {
    let dir = tempfile::tempdir().unwrap();
    let (conf, _path) = unix_conf(&dir);
    let upgrader = Arc::new(LocalUpgrader::new(Arc::new(|_child: LocalUpgrader| {})));
    let mut server = Generation::start(conf, upgrader.clone());
    server.wait_for(GenerationState::Serving).await;

    upgrader.stop();
    assert_eq!(server.finish().await.unwrap(), Exit::Stopped);
}
