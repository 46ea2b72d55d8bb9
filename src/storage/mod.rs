//! Storage adapter
//!
//! Owns the GET/SET task queues and the single worker thread that drains
//! them under the RCU/WCU rate-limit gates. Real backends implement
//! [`StorageBackend`] and complete requests from their own threads; mock
//! mode resolves requests inside the worker after a fixed latency.
//!
//! Accounting is pessimistic: a GET prepays 1 RCU at submission (the exact
//! cost is only known at completion, and the prepayment stops a burst of
//! submissions in the gap), while a SET's WCU cost is known up front and
//! debited in full at submission. Failed requests keep their prepaid units.

pub mod mock;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::config::{DynamoConfig, MOCK_STORE_LATENCY_SEC, STORAGE_POLL_PERIOD_SEC};
use crate::error::Error;
use crate::rate::{ConcurrentProgress, RateLimiter};
use crate::stats::kv_to_rcu;
use crate::task::{GetTask, SetTask, Task, TaskQueue};

use self::mock::{MockKvFormat, MockStore};

/// Async contract of a real backing store. Implementations run requests on
/// their own threads and must invoke `done` exactly once.
pub trait StorageBackend: Send + Sync + 'static {
    fn get_async(
        &self,
        table: &str,
        key: Bytes,
        done: Box<dyn FnOnce(Result<Bytes, String>) + Send>,
    );

    fn put_async(
        &self,
        table: &str,
        key: Bytes,
        value: Bytes,
        done: Box<dyn FnOnce(Result<(), String>) + Send>,
    );
}

struct StorageRuntime {
    table: String,
    mock: bool,
    mock_store: MockStore,
    backend: Option<Arc<dyn StorageBackend>>,
}

struct StorageShared {
    get_queue: TaskQueue<GetTask>,
    set_queue: TaskQueue<SetTask>,
    rcu_limiter: RateLimiter<ConcurrentProgress>,
    wcu_limiter: RateLimiter<ConcurrentProgress>,
    running: AtomicBool,
    runtime: RwLock<StorageRuntime>,
}

/// Handle shared by request threads, the worker, and the controller
pub struct StorageAdapter {
    shared: Arc<StorageShared>,
    worker: Option<JoinHandle<()>>,
}

impl StorageAdapter {
    pub fn new(dynamo: DynamoConfig, backend: Option<Arc<dyn StorageBackend>>) -> Self {
        let shared = Arc::new(StorageShared {
            get_queue: TaskQueue::new(),
            set_queue: TaskQueue::new(),
            rcu_limiter: RateLimiter::new(1_000_000.0),
            wcu_limiter: RateLimiter::new(1_000_000.0),
            running: AtomicBool::new(true),
            runtime: RwLock::new(StorageRuntime {
                table: dynamo.table,
                mock: dynamo.mock,
                mock_store: MockStore::new(),
                backend,
            }),
        });
        let worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("hopper-storage".into())
                .spawn(move || worker_main(shared))
                .expect("spawn storage worker")
        };
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Queue a missed GET for the worker
    pub fn get_async(&self, t: GetTask) {
        self.shared.get_queue.push(t);
    }

    /// Queue a write-through PUT for the worker
    pub fn set_async(&self, t: SetTask) {
        self.shared.set_queue.push(t);
    }

    pub fn set_rcu_limit(&self, db_rcu: f64) {
        self.shared.rcu_limiter.propose_new_rate(db_rcu);
    }

    pub fn set_wcu_limit(&self, db_wcu: f64) {
        self.shared.wcu_limiter.propose_new_rate(db_wcu);
    }

    pub fn table(&self) -> String {
        self.shared.runtime.read().table.clone()
    }

    pub fn set_table(&self, table: String) {
        self.shared.runtime.write().table = table;
    }

    pub fn is_mock(&self) -> bool {
        self.shared.runtime.read().mock
    }

    pub fn disable_mock(&self) {
        self.shared.runtime.write().mock = false;
    }

    /// Enable mock mode backed by image files
    pub fn enable_mock_image(&self, paths: &[std::path::PathBuf]) -> Result<(), Error> {
        let mut rt = self.shared.runtime.write();
        rt.mock_store.init_image();
        for p in paths {
            rt.mock_store.load_image(p)?;
        }
        rt.mock = true;
        Ok(())
    }

    /// Enable mock mode with format-synthesized values
    pub fn enable_mock_format(&self, key_size: u32, val_size: u32) -> Result<(), Error> {
        let mut rt = self.shared.runtime.write();
        rt.mock_store.set_format(key_size, val_size)?;
        rt.mock = true;
        Ok(())
    }

    pub fn mock_format(&self) -> MockKvFormat {
        self.shared.runtime.read().mock_store.format()
    }
}

impl Drop for StorageAdapter {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_main(shared: Arc<StorageShared>) {
    debug!("storage worker started");
    let mut mock_queue: VecDeque<(Instant, Task)> = VecDeque::new();

    while shared.running.load(Ordering::Acquire) {
        let mut work_done = false;

        // mocked completions are independent of the rate-limit gates
        if shared.runtime.read().mock {
            work_done = process_mock(&shared, &mut mock_queue);
        }

        let rcu_wait = shared.rcu_limiter.check_wait_time();
        let wcu_wait = shared.wcu_limiter.check_wait_time();

        if rcu_wait <= 0.0 {
            if let Some(t) = shared.get_queue.pop() {
                submit_get(&shared, t, &mut mock_queue);
                // the exact RCU cost is only known at completion; prepay one
                // unit so the limiter cannot clear a flood of submissions
                // before the first completion lands
                shared.rcu_limiter.consume(1);
                work_done = true;
            }
        }
        if wcu_wait <= 0.0 {
            if let Some(t) = shared.set_queue.pop() {
                let wcu_cost = t.wcu_cost();
                submit_set(&shared, t, &mut mock_queue);
                shared.wcu_limiter.consume(wcu_cost);
                work_done = true;
            }
        }

        if !work_done {
            let sleep_sec = if rcu_wait > 0.0 && wcu_wait > 0.0 {
                rcu_wait.min(wcu_wait).min(STORAGE_POLL_PERIOD_SEC)
            } else {
                STORAGE_POLL_PERIOD_SEC
            };
            std::thread::sleep(Duration::from_secs_f64(sleep_sec));
        }
    }
    debug!("storage worker stopped");
}

fn submit_get(shared: &Arc<StorageShared>, t: GetTask, mock_queue: &mut VecDeque<(Instant, Task)>) {
    let runtime = shared.runtime.read();
    if runtime.mock {
        drop(runtime);
        let ready = Instant::now() + Duration::from_secs_f64(MOCK_STORE_LATENCY_SEC);
        mock_queue.push_back((ready, Task::Get(t)));
        return;
    }

    let Some(backend) = runtime.backend.clone() else {
        drop(runtime);
        let _ = t.done.send(Err("no storage backend configured".to_string()));
        return;
    };
    let table = runtime.table.clone();
    drop(runtime);

    let GetTask { key, done } = t;
    let key_len = key.len();
    let shared = shared.clone();
    backend.get_async(
        &table,
        key,
        Box::new(move |result| match result {
            Ok(val) => {
                // 1 RCU was prepaid at submission
                shared.rcu_limiter.consume(kv_to_rcu(key_len, val.len()) - 1);
                let _ = done.send(Ok(val));
            }
            Err(msg) => {
                // the prepaid RCU is kept even on failure
                let _ = done.send(Err(msg));
            }
        }),
    );
}

fn submit_set(shared: &Arc<StorageShared>, t: SetTask, mock_queue: &mut VecDeque<(Instant, Task)>) {
    let runtime = shared.runtime.read();
    if runtime.mock {
        drop(runtime);
        let ready = Instant::now() + Duration::from_secs_f64(MOCK_STORE_LATENCY_SEC);
        mock_queue.push_back((ready, Task::Set(t)));
        return;
    }

    let Some(backend) = runtime.backend.clone() else {
        drop(runtime);
        let _ = t.done.send(Err("no storage backend configured".to_string()));
        return;
    };
    let table = runtime.table.clone();
    drop(runtime);

    let SetTask { key, value, done } = t;
    backend.put_async(
        &table,
        key,
        value,
        Box::new(move |result| {
            // WCU accounting already happened at submission
            let _ = done.send(result);
        }),
    );
}

fn process_mock(shared: &Arc<StorageShared>, mock_queue: &mut VecDeque<(Instant, Task)>) -> bool {
    let Some((ready, _)) = mock_queue.front() else {
        return false;
    };
    if Instant::now() < *ready {
        return false;
    }
    let (_, task) = mock_queue.pop_front().expect("checked front");

    let mut runtime = shared.runtime.write();
    match task {
        Task::Get(t) => match runtime.mock_store.handle_get(&t.key) {
            Ok(val) => {
                trace!(key_len = t.key.len(), val_len = val.len(), "mock get done");
                shared.rcu_limiter.consume(t.rcu_cost(val.len()) - 1);
                let _ = t.done.send(Ok(val));
            }
            Err(msg) => {
                let _ = t.done.send(Err(msg));
            }
        },
        Task::Set(t) => {
            runtime.mock_store.record_put(&t.key, t.value.len());
            let _ = t.done.send(Ok(()));
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn adapter_mock() -> StorageAdapter {
        StorageAdapter::new(
            DynamoConfig {
                table: "t".into(),
                mock: true,
            },
            None,
        )
    }

    #[test]
    fn test_mock_get_synthesizes_value() {
        let adapter = adapter_mock();
        adapter.enable_mock_format(16, 500).unwrap();
        let (tx, rx) = oneshot::channel();
        adapter.get_async(GetTask {
            key: Bytes::from_static(b"K0000000001s016L"),
            done: tx,
        });
        let val = rx.blocking_recv().unwrap().unwrap();
        assert_eq!(val.len(), 500);
    }

    #[test]
    fn test_mock_get_malformed_key_errors() {
        let adapter = adapter_mock();
        let (tx, rx) = oneshot::channel();
        adapter.get_async(GetTask {
            key: Bytes::from_static(b"short"),
            done: tx,
        });
        assert!(rx.blocking_recv().unwrap().is_err());
    }

    #[test]
    fn test_mock_set_completes_ok() {
        let adapter = adapter_mock();
        let (tx, rx) = oneshot::channel();
        adapter.set_async(SetTask {
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"v"),
            done: tx,
        });
        assert!(rx.blocking_recv().unwrap().is_ok());
    }

    #[test]
    fn test_no_backend_errors_fast() {
        let adapter = StorageAdapter::new(
            DynamoConfig {
                table: "t".into(),
                mock: false,
            },
            None,
        );
        let (tx, rx) = oneshot::channel();
        adapter.get_async(GetTask {
            key: Bytes::from_static(b"k"),
            done: tx,
        });
        assert!(rx.blocking_recv().unwrap().is_err());
    }
}
