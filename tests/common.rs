//! Shared test fixtures: an in-memory cluster of one and a small test
//! state machine with observable apply counts.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use strata::rsm::write_prep::WritePrepDisposition;
use strata::{
    ApplyContext, ClientId, CommandId, Config, Coordinator, MemoryEngine, SchemaRegistry,
    SnapshotView, SoloDriver, StateMachine, StorageEngine, StorageView, StrataResult, WriteReply,
};

/// Commands understood by the test state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TestCommand {
    /// Stage one key-value pair and acknowledge with code 0.
    Put {
        partition: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    /// Stage several pairs in one batch.
    PutMany {
        partition: String,
        pairs: Vec<(Vec<u8>, Vec<u8>)>,
    },
    /// Like `Put`, but request a post-commit completion notification.
    PutNotify {
        partition: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    /// Stage a pair, then fail with `code`; nothing must be written.
    PutThenFail {
        partition: String,
        key: Vec<u8>,
        value: Vec<u8>,
        code: i32,
    },
    /// Rejected by write-prep with `code`; never reaches the log.
    Inadmissible { code: i32 },
}

/// Read request understood by the test state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRead {
    pub partition: String,
    pub key: Vec<u8>,
}

/// Test state machine recording how often apply ran and how many
/// post-commit completions fired.
pub struct TestApp {
    apply_invocations: AtomicU64,
    completions: Arc<AtomicU64>,
}

impl TestApp {
    pub fn new() -> Self {
        Self {
            apply_invocations: AtomicU64::new(0),
            completions: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn apply_invocations(&self) -> u64 {
        self.apply_invocations.load(Ordering::Acquire)
    }

    pub fn completions(&self) -> u64 {
        self.completions.load(Ordering::Acquire)
    }
}

impl StateMachine for TestApp {
    fn write_prep(
        &self,
        _id: &CommandId,
        payload: &[u8],
        _storage: &StorageView<'_>,
    ) -> WritePrepDisposition {
        match bincode::deserialize::<TestCommand>(payload) {
            Ok(TestCommand::Inadmissible { code }) => WritePrepDisposition::Reject(code),
            _ => WritePrepDisposition::Proceed,
        }
    }

    fn apply(
        &self,
        _id: &CommandId,
        payload: &[u8],
        ctx: &mut ApplyContext<'_>,
    ) -> Result<i32, i32> {
        self.apply_invocations.fetch_add(1, Ordering::AcqRel);
        let command: TestCommand = bincode::deserialize(payload).map_err(|_| -22)?;
        match command {
            TestCommand::Put {
                partition,
                key,
                value,
            } => {
                ctx.stage_kv(&partition, key, value).map_err(|_| -5)?;
                Ok(0)
            }
            TestCommand::PutMany { partition, pairs } => {
                for (key, value) in pairs {
                    ctx.stage_kv(&partition, key, value).map_err(|_| -5)?;
                }
                Ok(0)
            }
            TestCommand::PutNotify {
                partition,
                key,
                value,
            } => {
                let counter = Arc::clone(&self.completions);
                ctx.stage_kv_notify(
                    &partition,
                    key,
                    value,
                    Box::new(move |token| {
                        let increment = token.downcast::<u64>().map(|n| *n).unwrap_or(1);
                        counter.fetch_add(increment, Ordering::AcqRel);
                    }),
                    Box::new(1u64),
                )
                .map_err(|_| -5)?;
                Ok(0)
            }
            TestCommand::PutThenFail {
                partition,
                key,
                value,
                code,
            } => {
                ctx.stage_kv(&partition, key, value).map_err(|_| -5)?;
                Err(code)
            }
            TestCommand::Inadmissible { .. } => Ok(0),
        }
    }

    fn read(
        &self,
        _id: &CommandId,
        request: &[u8],
        view: &SnapshotView,
        reply_buf: &mut [u8],
    ) -> StrataResult<usize> {
        let request: TestRead = bincode::deserialize(request)
            .map_err(|e| strata::StrataError::invalid(e.to_string()))?;
        match view.get(&request.partition, &request.key)? {
            None => Ok(0),
            Some(value) => {
                if reply_buf.len() < value.len() {
                    return Err(strata::StrataError::invalid("reply buffer too small"));
                }
                reply_buf[..value.len()].copy_from_slice(&value);
                Ok(value.len())
            }
        }
    }
}

/// One-node pipeline backed by the in-memory engine.
pub struct Cluster {
    pub coordinator: Coordinator,
    pub engine: Arc<MemoryEngine>,
    pub app: Arc<TestApp>,
    pub driver: Arc<SoloDriver>,
}

pub fn start_cluster(app_partitions: &[&str]) -> Cluster {
    start_cluster_with_registry(app_partitions, SchemaRegistry::new())
}

/// Install a test-friendly tracing subscriber once per process; honors
/// RUST_LOG for debugging failing runs.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn start_cluster_with_registry(app_partitions: &[&str], registry: SchemaRegistry) -> Cluster {
    init_tracing();
    let engine = Arc::new(MemoryEngine::new());
    let app = Arc::new(TestApp::new());
    let driver = Arc::new(SoloDriver::new());

    let coordinator = Coordinator::start(
        &Config::default(),
        "test-group",
        "test-instance-0",
        registry,
        app_partitions,
        engine.clone() as Arc<dyn StorageEngine>,
        app.clone() as Arc<dyn StateMachine>,
        driver.clone(),
    )
    .expect("coordinator start");

    Cluster {
        coordinator,
        engine,
        app,
        driver,
    }
}

pub fn client(n: u128) -> ClientId {
    ClientId::from_u128(n)
}

pub fn command(client_id: ClientId, sequence: u64) -> CommandId {
    CommandId::new(client_id, sequence)
}

pub fn encode(command: &TestCommand) -> Bytes {
    Bytes::from(bincode::serialize(command).unwrap())
}

pub fn submit_put(
    cluster: &Cluster,
    id: CommandId,
    partition: &str,
    key: &[u8],
    value: &[u8],
) -> StrataResult<WriteReply> {
    cluster.coordinator.submit(
        id,
        encode(&TestCommand::Put {
            partition: partition.to_string(),
            key: key.to_vec(),
            value: value.to_vec(),
        }),
    )
}

/// Read through a fresh snapshot; `None` when the key is absent.
pub fn read_value(cluster: &Cluster, partition: &str, key: &[u8]) -> Option<Vec<u8>> {
    let request = bincode::serialize(&TestRead {
        partition: partition.to_string(),
        key: key.to_vec(),
    })
    .unwrap();
    let mut buf = [0u8; 256];
    let id = command(client(0), 0);
    let n = cluster
        .coordinator
        .read(&id, &request, &mut buf)
        .expect("read");
    if n == 0 {
        None
    } else {
        Some(buf[..n].to_vec())
    }
}
