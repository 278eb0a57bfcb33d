use crate::latch::LineLatch;
use crate::lock::DispatcherLock;
use anyhow::{Context, Result};
use futures::future::join_all;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    task::JoinHandle,
};
use tracing::{debug, trace};

/// One of a task's two output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn label(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }

    fn index(self) -> usize {
        match self {
            Stream::Stdout => 0,
            Stream::Stderr => 1,
        }
    }
}

/// State shared between the dispatcher and one task's workers.
///
/// The record lives for the rest of the process once created. The group
/// leader pid is 0 until the runner has created the child; once stored it is
/// only ever read.
pub struct TaskRecord {
    pub id: usize,
    group: AtomicI32,
    output: [LineLatch; 2],
}

impl TaskRecord {
    pub fn new(id: usize, line_length: usize) -> Self {
        Self {
            id,
            group: AtomicI32::new(0),
            output: [LineLatch::new(line_length), LineLatch::new(line_length)],
        }
    }

    /// Pid of the task's process-group leader, or 0 before the child exists.
    pub fn group_leader(&self) -> i32 {
        self.group.load(Ordering::Acquire)
    }

    /// Copy of the most recent complete line seen on `stream`.
    pub fn last_line(&self, stream: Stream) -> String {
        self.output[stream.index()].read()
    }

    fn latch(&self, stream: Stream) -> &LineLatch {
        &self.output[stream.index()]
    }
}

/// Spawns the runner for one task. The runner owns the child process and the
/// argument vector; a failure in the process primitives brings the whole
/// executor down.
pub fn spawn_runner(
    lock: Arc<DispatcherLock>,
    record: Arc<TaskRecord>,
    args: Vec<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = run_task(lock, record, args).await {
            eprintln!("executor: {err:#}");
            std::process::exit(1);
        }
    })
}

/// Drives one task from creation to its completion report.
///
/// Creates the child in its own process group, records the group leader,
/// starts a listener per stream, reports the startup line through the
/// run-accounting phases, then reaps the child and reports its completion
/// through the status phases. Both listeners are awaited before returning,
/// so joining the runner joins the whole task.
async fn run_task(
    lock: Arc<DispatcherLock>,
    record: Arc<TaskRecord>,
    args: Vec<String>,
) -> Result<()> {
    let mut child =
        spawn_child(&args).with_context(|| format!("failed to start '{}'", args[0]))?;
    let pid = child.id().context("spawned child has no pid")? as i32;
    record.group.store(pid, Ordering::Release);

    let stdout = child.stdout.take().context("child stdout was not piped")?;
    let stderr = child.stderr.take().context("child stderr was not piped")?;
    let listeners = vec![
        spawn_listener(stdout, Arc::clone(&record), Stream::Stdout),
        spawn_listener(stderr, Arc::clone(&record), Stream::Stderr),
    ];

    println!("Task {} started: pid {}.", record.id, pid);
    lock.after_run();

    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to wait for task {}", record.id))?;
    debug!(task = record.id, ?status, "child reaped");

    lock.before_status().await;
    match status.code() {
        Some(code) => println!("Task {} ended: status {}.", record.id, code),
        None => println!("Task {} ended: signalled.", record.id),
    }
    lock.after_status();
    // The argument vector is held until the completion report is out.
    drop(args);

    join_all(listeners).await;
    Ok(())
}

/// Starts the program named by `args[0]` with both output streams piped back
/// to the executor and the child leading its own process group, so that a
/// later interrupt reaches the program together with all its descendants.
fn spawn_child(args: &[String]) -> std::io::Result<Child> {
    let (program, rest) = args.split_first().expect("argument vector is never empty");
    let mut command = Command::new(program);
    command
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // SAFETY: setpgid is async-signal-safe and runs between fork and exec.
    unsafe {
        command.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    command.spawn()
}

/// Reads one piped stream line by line, latching each complete line with its
/// trailing newline stripped. Data left unterminated at end of stream is
/// latched as the final line. Exits when the pipe closes.
fn spawn_listener<R>(stream: R, record: Arc<TaskRecord>, which: Stream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(stream);
    tokio::spawn(async move {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                    }
                    record.latch(which).set(&String::from_utf8_lossy(&buf));
                }
            }
        }
        trace!(task = record.id, stream = which.label(), "stream closed");
    })
}
