use std::{
    collections::HashMap,
    sync::{
        Mutex, mpsc,
        mpsc::{Receiver, Sender},
    },
    thread,
    time::Duration,
};

use crate::{LeakRate, Storage, ThrottleError, Value};

pub(super) const NOW: f64 = 1_000f64;

pub(super) fn rate(value: f64) -> LeakRate {
    LeakRate::try_from(value).unwrap()
}

/// Storage implementing only `get`/`set`, optionally sleeping inside each call to widen
/// race windows.
#[derive(Default)]
pub(super) struct PlainStorage {
    data: Mutex<HashMap<String, Value>>,
    pause: Duration,
}

impl PlainStorage {
    pub(super) fn slow(pause: Duration) -> Self {
        Self {
            data: Mutex::default(),
            pause,
        }
    }

    fn nap(&self) {
        if !self.pause.is_zero() {
            thread::sleep(self.pause);
        }
    }
}

impl Storage for PlainStorage {
    fn get(&self, key: &str, default: Option<Value>) -> Result<Option<Value>, ThrottleError> {
        let value = self.data.lock().unwrap().get(key).copied();
        self.nap();
        Ok(value.or(default))
    }

    fn set(&self, key: &str, value: Value) -> Result<(), ThrottleError> {
        self.nap();
        self.data.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Call {
    Get(String),
    Set(String, Value),
    Mget(Vec<String>, bool),
    Mset(Vec<(String, Value)>),
    Incr(String, i64, i64),
}

/// Storage that records every call and answers `mget` with a canned reply.
pub(super) struct RecordingStorage {
    mget_reply: Vec<Option<Value>>,
    calls: Mutex<Vec<Call>>,
}

impl RecordingStorage {
    pub(super) fn replying(mget_reply: Vec<Option<Value>>) -> Self {
        Self {
            mget_reply,
            calls: Mutex::default(),
        }
    }

    pub(super) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(super) fn incr_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Incr(..)))
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Storage for RecordingStorage {
    fn get(&self, key: &str, default: Option<Value>) -> Result<Option<Value>, ThrottleError> {
        self.record(Call::Get(key.to_string()));
        Ok(default)
    }

    fn set(&self, key: &str, value: Value) -> Result<(), ThrottleError> {
        self.record(Call::Set(key.to_string(), value));
        Ok(())
    }

    fn mget(
        &self,
        keys: &[&str],
        _default: Option<Value>,
        coherent: bool,
    ) -> Result<Vec<Option<Value>>, ThrottleError> {
        self.record(Call::Mget(
            keys.iter().map(|key| key.to_string()).collect(),
            coherent,
        ));
        Ok(self.mget_reply.clone())
    }

    fn mset(&self, values: &[(&str, Value)]) -> Result<(), ThrottleError> {
        self.record(Call::Mset(
            values
                .iter()
                .map(|(key, value)| (key.to_string(), *value))
                .collect(),
        ));
        Ok(())
    }

    fn incr(&self, key: &str, amount: i64, default: i64) -> Result<i64, ThrottleError> {
        self.record(Call::Incr(key.to_string(), amount, default));
        Ok(default + amount)
    }
}

/// Storage that parks any write to `gated_key` until the test releases it.
///
/// Every parked write announces itself on the `entered` channel first.
pub(super) struct GatedStorage {
    inner: PlainStorage,
    gated_key: &'static str,
    entered: Sender<()>,
    release: Mutex<Receiver<()>>,
}

pub(super) struct Gate {
    pub entered: Receiver<()>,
    pub release: Sender<()>,
}

impl GatedStorage {
    pub(super) fn new(gated_key: &'static str) -> (Self, Gate) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();

        let storage = Self {
            inner: PlainStorage::default(),
            gated_key,
            entered: entered_tx,
            release: Mutex::new(release_rx),
        };

        (
            storage,
            Gate {
                entered: entered_rx,
                release: release_tx,
            },
        )
    }
}

impl Storage for GatedStorage {
    fn get(&self, key: &str, default: Option<Value>) -> Result<Option<Value>, ThrottleError> {
        self.inner.get(key, default)
    }

    fn set(&self, key: &str, value: Value) -> Result<(), ThrottleError> {
        if key == self.gated_key {
            self.entered.send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }

        self.inner.set(key, value)
    }
}

/// Storage failing every write to `"boom"` and panicking on every write to `"panic"`.
#[derive(Default)]
pub(super) struct FaultyStorage {
    inner: PlainStorage,
}

impl Storage for FaultyStorage {
    fn get(&self, key: &str, default: Option<Value>) -> Result<Option<Value>, ThrottleError> {
        if key == "boom" {
            return Err(ThrottleError::Backend("read failed".into()));
        }

        self.inner.get(key, default)
    }

    fn set(&self, key: &str, value: Value) -> Result<(), ThrottleError> {
        match key {
            "boom" => Err(ThrottleError::Backend("write failed".into())),
            "panic" => panic!("backend crashed"),
            _ => self.inner.set(key, value),
        }
    }
}

/// Run `f` on a new thread and report whether it finished within `timeout`.
pub(super) fn finishes_within<F>(timeout: Duration, f: F) -> (bool, thread::JoinHandle<()>)
where
    F: FnOnce() + Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        f();
        let _ = done_tx.send(());
    });

    (done_rx.recv_timeout(timeout).is_ok(), handle)
}
