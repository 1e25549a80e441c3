use super::log_buffer::{LogBuffer, Stream};
use super::protocol::{Codec, ProtocolError, Request, RequestId, Response};
use super::types::{WorkerState, WorkerType};
use crate::config::WorkerCommand;
use crate::error::{BridgeError, Result};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// How many abandoned request ids are remembered per process
const ABANDONED_CAPACITY: usize = 1024;

enum Delivery {
    Frame(Response),
    Invalid(ProtocolError),
    Closed,
}

#[derive(Default)]
struct PendingInner {
    waiting: HashMap<RequestId, oneshot::Sender<Delivery>>,
    abandoned: HashSet<RequestId>,
    abandoned_order: VecDeque<RequestId>,
    closed: bool,
}

/// Calls awaiting a frame from one process, keyed by correlation id.
struct PendingCalls {
    worker_type: WorkerType,
    inner: Mutex<PendingInner>,
}

impl PendingCalls {
    fn new(worker_type: WorkerType) -> Self {
        Self {
            worker_type,
            inner: Mutex::new(PendingInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `None` once the process output has closed
    fn register(&self, id: RequestId) -> Option<oneshot::Receiver<Delivery>> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        inner.waiting.insert(id, tx);
        Some(rx)
    }

    /// Forget a call locally; a frame arriving for it later is discarded.
    fn abandon(&self, id: &RequestId) {
        let mut inner = self.lock();
        if inner.waiting.remove(id).is_none() {
            return;
        }
        inner.abandoned.insert(id.clone());
        inner.abandoned_order.push_back(id.clone());
        while inner.abandoned_order.len() > ABANDONED_CAPACITY {
            if let Some(old) = inner.abandoned_order.pop_front() {
                inner.abandoned.remove(&old);
            }
        }
    }

    fn in_flight(&self) -> usize {
        self.lock().waiting.len()
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        for (_, tx) in inner.waiting.drain() {
            let _ = tx.send(Delivery::Closed);
        }
    }

    /// Hand a stdout frame to the call it answers.
    fn route(&self, frame: &Map<String, Value>) {
        let mut inner = self.lock();
        match Codec::decode_frame(frame) {
            Ok(response) => {
                if let Some(tx) = inner.waiting.remove(&response.request_id) {
                    let _ = tx.send(Delivery::Frame(response));
                } else if inner.abandoned.contains(&response.request_id) {
                    debug!(
                        worker = %self.worker_type,
                        request_id = %response.request_id,
                        "Discarding late response for abandoned call"
                    );
                } else {
                    let actual = response.request_id.to_string();
                    self.fail_sole(&mut inner, |expected| ProtocolError::CorrelationMismatch {
                        expected: expected.to_string(),
                        actual,
                    });
                }
            }
            Err(error) => match Codec::peek_request_id(frame) {
                Some(id) if inner.waiting.contains_key(&id) => {
                    warn!(worker = %self.worker_type, request_id = %id, %error, "Invalid response frame");
                    if let Some(tx) = inner.waiting.remove(&id) {
                        let _ = tx.send(Delivery::Invalid(error));
                    }
                }
                Some(id) if inner.abandoned.contains(&id) => {
                    debug!(worker = %self.worker_type, request_id = %id, "Discarding late invalid frame");
                }
                _ => self.fail_sole(&mut inner, |_| error),
            },
        }
    }

    /// A frame that names no waiting call can only be attributed when exactly
    /// one call is in flight.
    fn fail_sole(
        &self,
        inner: &mut PendingInner,
        make_error: impl FnOnce(&RequestId) -> ProtocolError,
    ) {
        if inner.waiting.len() != 1 {
            warn!(
                worker = %self.worker_type,
                in_flight = inner.waiting.len(),
                "Dropping frame that matches no pending call"
            );
            return;
        }
        let Some(id) = inner.waiting.keys().next().cloned() else {
            return;
        };
        let error = make_error(&id);
        warn!(worker = %self.worker_type, request_id = %id, %error, "Protocol violation");
        if let Some(tx) = inner.waiting.remove(&id) {
            let _ = tx.send(Delivery::Invalid(error));
        }
    }
}

/// Removes the call from the pending table unless a frame was delivered.
/// Covers both timeouts and callers dropping the future.
struct AbandonGuard<'a> {
    pending: &'a PendingCalls,
    id: &'a RequestId,
    armed: bool,
}

impl<'a> AbandonGuard<'a> {
    fn new(pending: &'a PendingCalls, id: &'a RequestId) -> Self {
        Self {
            pending,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending.abandon(self.id);
        }
    }
}

/// One live worker subprocess and its stdio plumbing.
///
/// Owned by [`super::WorkerManager`]; nothing else touches the streams.
pub struct WorkerProcess {
    worker_type: WorkerType,
    instance: u64,
    pid: Option<u32>,
    started_at: Instant,
    child: tokio::sync::Mutex<Child>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: Arc<PendingCalls>,
    state: Mutex<WorkerState>,
    consecutive_timeouts: AtomicU32,
    health_failures: AtomicU32,
    last_health_check: Mutex<Option<Instant>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerProcess {
    /// Launch the worker and start reading its output
    pub fn spawn(
        worker_type: WorkerType,
        instance: u64,
        command: &WorkerCommand,
        log_buffer: &Arc<LogBuffer>,
    ) -> Result<Arc<Self>> {
        let mut cmd = Command::new(&command.command);
        cmd.args(&command.args);

        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        if let Some(ref dir) = command.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| BridgeError::Spawn {
            worker: worker_type,
            source,
        })?;
        let pid = child.id();

        let pending = Arc::new(PendingCalls::new(worker_type));
        let mut readers = Vec::with_capacity(2);
        match child.stdout.take() {
            Some(stdout) => readers.push(spawn_stdout_reader(
                worker_type,
                instance,
                stdout,
                Arc::clone(&pending),
                Arc::clone(log_buffer),
            )),
            None => pending.close(),
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_stderr_reader(
                worker_type,
                instance,
                stderr,
                Arc::clone(log_buffer),
            ));
        }
        let stdin = child.stdin.take();

        info!(worker = %worker_type, instance, pid = ?pid, command = %command.command, "Worker process started");

        Ok(Arc::new(Self {
            worker_type,
            instance,
            pid,
            started_at: Instant::now(),
            child: tokio::sync::Mutex::new(child),
            stdin: tokio::sync::Mutex::new(stdin),
            pending,
            state: Mutex::new(WorkerState::Ready),
            consecutive_timeouts: AtomicU32::new(0),
            health_failures: AtomicU32::new(0),
            last_health_check: Mutex::new(None),
            readers: Mutex::new(readers),
        }))
    }

    /// Send a request and wait for the frame carrying its id.
    ///
    /// On timeout, or when the returned future is dropped, the call is
    /// abandoned locally and the process keeps running.
    pub async fn call(&self, request: &Request, timeout: Duration) -> Result<Response> {
        let rx = self
            .pending
            .register(request.request_id.clone())
            .ok_or_else(|| BridgeError::Disconnected {
                worker: self.worker_type,
                reason: "worker output stream is closed".into(),
            })?;
        let mut guard = AbandonGuard::new(&self.pending, &request.request_id);

        let frame = request.to_frame().map_err(|source| BridgeError::Protocol {
            worker: self.worker_type,
            source,
        })?;
        let deadline = tokio::time::Instant::now() + timeout;
        if !self.write_frame(&frame, deadline).await? {
            debug!(
                worker = %self.worker_type,
                request_id = %request.request_id,
                "Request not written before the deadline, abandoning"
            );
            return Err(self.timed_out(request, timeout));
        }
        trace!(
            worker = %self.worker_type,
            instance = self.instance,
            request_id = %request.request_id,
            action = %request.action,
            "Request sent"
        );

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(Delivery::Frame(response))) => {
                guard.disarm();
                Ok(response)
            }
            Ok(Ok(Delivery::Invalid(source))) => {
                guard.disarm();
                Err(BridgeError::Protocol {
                    worker: self.worker_type,
                    source,
                })
            }
            Ok(Ok(Delivery::Closed)) | Ok(Err(_)) => {
                guard.disarm();
                Err(BridgeError::ProcessExited {
                    worker: self.worker_type,
                    status: self.exit_code(),
                })
            }
            Err(_) => {
                debug!(
                    worker = %self.worker_type,
                    request_id = %request.request_id,
                    "Call timed out, abandoning"
                );
                Err(self.timed_out(request, timeout))
            }
        }
    }

    fn timed_out(&self, request: &Request, timeout: Duration) -> BridgeError {
        BridgeError::Timeout {
            worker: self.worker_type,
            action: request.action.clone(),
            timeout,
        }
    }

    /// Write one frame to stdin. `Ok(false)` when `deadline` passed first.
    async fn write_frame(&self, frame: &[u8], deadline: tokio::time::Instant) -> Result<bool> {
        let Ok(mut stdin) = tokio::time::timeout_at(deadline, self.stdin.lock()).await else {
            return Ok(false);
        };
        let Some(writer) = stdin.as_mut() else {
            return Err(BridgeError::Disconnected {
                worker: self.worker_type,
                reason: "worker input stream is closed".into(),
            });
        };
        let written = tokio::time::timeout_at(deadline, async {
            writer.write_all(frame).await?;
            writer.flush().await
        })
        .await;
        match written {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => {
                *stdin = None;
                Err(BridgeError::Disconnected {
                    worker: self.worker_type,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                // a partly written frame leaves the stream unusable
                warn!(
                    worker = %self.worker_type,
                    instance = self.instance,
                    "Worker stopped reading its input, closing it"
                );
                *stdin = None;
                self.set_state(WorkerState::Unhealthy);
                Ok(false)
            }
        }
    }

    /// Exit code if the process has already been reaped
    fn exit_code(&self) -> Option<i32> {
        let mut child = self.child.try_lock().ok()?;
        child.try_wait().ok().flatten().and_then(|status| status.code())
    }

    /// Whether the process is still running and its output open
    pub async fn is_alive(&self) -> bool {
        if self.pending.is_closed() {
            return false;
        }
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    /// Whether new calls may be routed to this process
    pub fn is_accepting(&self) -> bool {
        !self.pending.is_closed()
            && matches!(self.state(), WorkerState::Starting | WorkerState::Ready)
    }

    /// Close stdin, wait up to `grace`, then signal and finally kill.
    pub async fn terminate(&self, grace: Duration) {
        self.set_state(WorkerState::Stopped);
        let half = grace / 2;

        match tokio::time::timeout(half, self.stdin.lock()).await {
            Ok(mut stdin) => drop(stdin.take()),
            Err(_) => warn!(worker = %self.worker_type, "Input stream busy, not closing it"),
        }

        let mut child = self.child.lock().await;
        let exited = matches!(tokio::time::timeout(half, child.wait()).await, Ok(Ok(_)));
        if !exited {
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    unsafe {
                        libc::kill(pid as i32, libc::SIGTERM);
                    }
                }
            }
            if !matches!(tokio::time::timeout(half, child.wait()).await, Ok(Ok(_))) {
                warn!(
                    worker = %self.worker_type,
                    instance = self.instance,
                    "Worker did not stop in time, killing"
                );
                if let Err(e) = child.kill().await {
                    warn!(worker = %self.worker_type, error = %e, "Failed to kill worker");
                }
            }
        }
        drop(child);

        self.pending.close();
        let readers: Vec<JoinHandle<()>> = self
            .readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in readers {
            handle.abort();
        }
        info!(worker = %self.worker_type, instance = self.instance, "Worker process stopped");
    }

    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn in_flight(&self) -> usize {
        self.pending.in_flight()
    }

    /// Count a timed-out call; returns the current streak
    pub fn record_timeout(&self) -> u32 {
        self.consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Any answer from the worker ends a timeout streak
    pub fn record_answer(&self) {
        self.consecutive_timeouts.store(0, Ordering::SeqCst);
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::SeqCst)
    }

    /// Record a liveness probe result; returns the current failure streak
    pub fn record_probe(&self, healthy: bool) -> u32 {
        *self
            .last_health_check
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        if healthy {
            self.health_failures.store(0, Ordering::SeqCst);
            0
        } else {
            self.health_failures.fetch_add(1, Ordering::SeqCst) + 1
        }
    }

    pub fn last_health_check(&self) -> Option<Instant> {
        *self
            .last_health_check
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

fn spawn_stdout_reader(
    worker_type: WorkerType,
    instance: u64,
    stdout: ChildStdout,
    pending: Arc<PendingCalls>,
    log_buffer: Arc<LogBuffer>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    handle_stdout_line(
                        worker_type,
                        instance,
                        line.trim_end_matches(['\r', '\n']),
                        &pending,
                        &log_buffer,
                    );
                }
                Err(e) => {
                    warn!(worker = %worker_type, instance, error = %e, "Failed reading worker output");
                    break;
                }
            }
        }
        debug!(worker = %worker_type, instance, "Worker output closed");
        pending.close();
    })
}

/// Route a frame, or keep the line as a diagnostic
fn handle_stdout_line(
    worker_type: WorkerType,
    instance: u64,
    line: &str,
    pending: &PendingCalls,
    log_buffer: &LogBuffer,
) {
    if let Some(frame) = Codec::parse_frame(line) {
        pending.route(&frame);
    } else if !line.trim().is_empty() {
        debug!(target: "worker_bridge::worker", worker = %worker_type, instance, stream = "stdout", "{}", line);
        log_buffer.push(worker_type, instance, Stream::Stdout, line.to_string());
    }
}

fn spawn_stderr_reader(
    worker_type: WorkerType,
    instance: u64,
    stderr: ChildStderr,
    log_buffer: Arc<LogBuffer>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        while let Ok(n) = reader.read_until(b'\n', &mut buf).await {
            if n == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            buf.clear();
            if line.is_empty() {
                continue;
            }
            debug!(target: "worker_bridge::worker", worker = %worker_type, instance, stream = "stderr", "{}", line);
            log_buffer.push(worker_type, instance, Stream::Stderr, line);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::protocol::Outcome;

    fn frame(id: &str) -> Map<String, Value> {
        parsed(&format!(r#"{{"request_id":"{id}","success":true,"data":{{"ok":1}}}}"#))
    }

    fn parsed(line: &str) -> Map<String, Value> {
        Codec::parse_frame(line).unwrap()
    }

    #[tokio::test]
    async fn routes_frames_by_id_not_arrival_order() {
        let pending = PendingCalls::new(WorkerType::Device);
        let rx_a = pending.register(RequestId::from("a")).unwrap();
        let rx_b = pending.register(RequestId::from("b")).unwrap();

        pending.route(&frame("b"));
        pending.route(&frame("a"));

        match rx_a.await.unwrap() {
            Delivery::Frame(r) => assert_eq!(r.request_id.as_str(), "a"),
            _ => panic!("expected frame for a"),
        }
        match rx_b.await.unwrap() {
            Delivery::Frame(r) => {
                assert_eq!(r.request_id.as_str(), "b");
                assert!(matches!(r.outcome, Outcome::Success(_)));
            }
            _ => panic!("expected frame for b"),
        }
        assert_eq!(pending.in_flight(), 0);
    }

    #[tokio::test]
    async fn late_frame_for_abandoned_call_is_not_delivered_to_next_call() {
        let pending = PendingCalls::new(WorkerType::Device);
        let _old = pending.register(RequestId::from("old")).unwrap();
        pending.abandon(&RequestId::from("old"));

        let rx_new = pending.register(RequestId::from("new")).unwrap();
        pending.route(&frame("old"));
        assert_eq!(pending.in_flight(), 1);

        pending.route(&frame("new"));
        match rx_new.await.unwrap() {
            Delivery::Frame(r) => assert_eq!(r.request_id.as_str(), "new"),
            _ => panic!("expected frame for new"),
        }
    }

    #[tokio::test]
    async fn unknown_id_fails_sole_pending_call_with_mismatch() {
        let pending = PendingCalls::new(WorkerType::Memory);
        let rx = pending.register(RequestId::from("mine")).unwrap();
        pending.route(&frame("someone-else"));
        match rx.await.unwrap() {
            Delivery::Invalid(ProtocolError::CorrelationMismatch { expected, actual }) => {
                assert_eq!(expected, "mine");
                assert_eq!(actual, "someone-else");
            }
            _ => panic!("expected correlation mismatch"),
        }
    }

    #[tokio::test]
    async fn frame_without_id_fails_sole_pending_call() {
        let pending = PendingCalls::new(WorkerType::Memory);
        let rx = pending.register(RequestId::from("mine")).unwrap();
        pending.route(&parsed(r#"{"success":true}"#));
        assert!(matches!(
            rx.await.unwrap(),
            Delivery::Invalid(ProtocolError::MissingField("request_id"))
        ));
    }

    #[tokio::test]
    async fn invalid_frame_with_known_id_goes_to_that_call() {
        let pending = PendingCalls::new(WorkerType::Model);
        let rx_a = pending.register(RequestId::from("a")).unwrap();
        let _rx_b = pending.register(RequestId::from("b")).unwrap();
        pending.route(&parsed(r#"{"request_id":"a","success":"maybe"}"#));
        assert!(matches!(
            rx_a.await.unwrap(),
            Delivery::Invalid(ProtocolError::InvalidField { field: "success", .. })
        ));
        assert_eq!(pending.in_flight(), 1);
    }

    #[tokio::test]
    async fn uncorrelated_frame_is_dropped_when_several_calls_wait() {
        let pending = PendingCalls::new(WorkerType::Model);
        let _a = pending.register(RequestId::from("a")).unwrap();
        let _b = pending.register(RequestId::from("b")).unwrap();
        pending.route(&parsed(r#"{"success":true}"#));
        assert_eq!(pending.in_flight(), 2);
    }

    #[tokio::test]
    async fn close_fails_waiters_and_rejects_new_calls() {
        let pending = PendingCalls::new(WorkerType::Inference);
        let rx = pending.register(RequestId::from("a")).unwrap();
        pending.close();
        assert!(matches!(rx.await.unwrap(), Delivery::Closed));
        assert!(pending.register(RequestId::from("b")).is_none());
    }

    #[tokio::test]
    async fn non_json_brace_line_is_logged_not_routed() {
        let pending = PendingCalls::new(WorkerType::Model);
        let log_buffer = LogBuffer::default();
        let mut rx = pending.register(RequestId::from("a")).unwrap();

        let line = "{'loaded': True, 'layers': 32}";
        handle_stdout_line(WorkerType::Model, 1, line, &pending, &log_buffer);

        assert_eq!(pending.in_flight(), 1);
        assert!(rx.try_recv().is_err());
        let logs = log_buffer.tail(WorkerType::Model, 10);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].line, line);

        let answer = r#"{"request_id":"a","success":true,"data":null}"#;
        handle_stdout_line(WorkerType::Model, 1, answer, &pending, &log_buffer);
        assert_eq!(pending.in_flight(), 0);
        assert!(matches!(rx.try_recv(), Ok(Delivery::Frame(_))));
        assert_eq!(log_buffer.tail(WorkerType::Model, 10).len(), 1);
    }

    #[test]
    fn abandoned_ids_are_bounded() {
        let pending = PendingCalls::new(WorkerType::Device);
        for i in 0..(ABANDONED_CAPACITY + 10) {
            let id = RequestId::from(format!("r{i}").as_str());
            let _rx = pending.register(id.clone());
            pending.abandon(&id);
        }
        let inner = pending.lock();
        assert_eq!(inner.abandoned.len(), ABANDONED_CAPACITY);
        assert!(!inner.abandoned.contains(&RequestId::from("r0")));
    }
}
