//! Command grammar and the dispatcher loop.

use crate::config::Limits;
use crate::latch;
use crate::lock::DispatcherLock;
use crate::process::{self, Stream, TaskRecord};
use anyhow::{Context, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One line of the command stream, tokenized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start a program: first token the program, the rest its arguments.
    Run(Vec<String>),
    /// Report the latched stdout line of a task.
    Out(usize),
    /// Report the latched stderr line of a task.
    Err(usize),
    /// Interrupt a task's whole process group.
    Kill(usize),
    /// Pause the dispatcher for the given number of milliseconds.
    Sleep(u64),
    /// Begin shutdown. Any unknown verb means the same.
    Quit,
    /// Empty or malformed line; nothing to do.
    Nop,
}

pub fn parse_command(line: &str) -> Command {
    let mut tokens = line.split_ascii_whitespace();
    let Some(verb) = tokens.next() else {
        return Command::Nop;
    };
    match verb {
        "run" => Command::Run(tokens.map(str::to_owned).collect()),
        "out" => id_arg(tokens.next()).map_or(Command::Nop, Command::Out),
        "err" => id_arg(tokens.next()).map_or(Command::Nop, Command::Err),
        "kill" => id_arg(tokens.next()).map_or(Command::Nop, Command::Kill),
        "sleep" => match tokens.next().and_then(|t| t.parse().ok()) {
            Some(millis) => Command::Sleep(millis),
            None => {
                warn!(line, "sleep needs a duration in milliseconds");
                Command::Nop
            }
        },
        _ => Command::Quit,
    }
}

fn id_arg(token: Option<&str>) -> Option<usize> {
    match token.map(str::parse) {
        Some(Ok(id)) => Some(id),
        _ => {
            warn!("command needs a numeric task id");
            None
        }
    }
}

struct TaskEntry {
    record: Arc<TaskRecord>,
    runner: JoinHandle<()>,
}

/// The assembled executor: the task table, the dispatcher lock, and the
/// command loop over standard input.
pub struct Executor {
    limits: Limits,
    lock: Arc<DispatcherLock>,
    tasks: Vec<TaskEntry>,
}

impl Executor {
    pub fn new(limits: Limits) -> Self {
        let capacity = limits.max_tasks;
        Self {
            limits,
            lock: Arc::new(DispatcherLock::new()),
            tasks: Vec::with_capacity(capacity),
        }
    }

    /// Reads commands until `quit` or end of input, then shuts down.
    ///
    /// Each iteration is one dispatcher step: clear a kill window left by
    /// the previous step, enter the step, execute the verb, leave the step.
    /// Task ids are dense and assigned in command order; entries are never
    /// removed.
    pub async fn run(&mut self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut kill_pending = false;
        let mut quit = false;
        while !quit {
            let Some(line) = lines
                .next_line()
                .await
                .context("failed to read the command stream")?
            else {
                break;
            };
            let command = parse_command(latch::clip(&line, self.limits.command_length));
            if kill_pending {
                self.lock.after_kill();
                kill_pending = false;
            }
            self.lock.before_dispatch().await;
            match command {
                Command::Run(args) => self.start_task(args),
                Command::Out(id) => self.report_output(id, Stream::Stdout),
                Command::Err(id) => self.report_output(id, Stream::Stderr),
                Command::Kill(id) => {
                    self.lock.before_kill();
                    self.interrupt(id);
                    kill_pending = true;
                }
                Command::Sleep(millis) => tokio::time::sleep(Duration::from_millis(millis)).await,
                Command::Quit => quit = true,
                Command::Nop => {}
            }
            self.lock.after_dispatch();
        }
        if kill_pending {
            self.lock.after_kill();
        }
        self.shutdown().await;
        Ok(())
    }

    /// Assigns the next task id and hands the argument vector to a runner.
    fn start_task(&mut self, args: Vec<String>) {
        if args.is_empty() {
            warn!("run needs a program to start");
            return;
        }
        if self.tasks.len() >= self.limits.max_tasks {
            warn!(limit = self.limits.max_tasks, "task capacity exhausted");
            return;
        }
        let id = self.tasks.len();
        let record = Arc::new(TaskRecord::new(id, self.limits.line_length));
        self.lock.before_run();
        let runner = process::spawn_runner(Arc::clone(&self.lock), Arc::clone(&record), args);
        self.tasks.push(TaskEntry { record, runner });
    }

    /// Snapshots one latch and prints it. Runs inside a dispatcher step, so
    /// the line cannot interleave with any report.
    fn report_output(&self, id: usize, stream: Stream) {
        let Some(entry) = self.tasks.get(id) else {
            warn!(task = id, "no such task");
            return;
        };
        let line = entry.record.last_line(stream);
        println!("Task {} {}: '{}'.", id, stream.label(), line);
    }

    fn interrupt(&self, id: usize) {
        let Some(entry) = self.tasks.get(id) else {
            warn!(task = id, "no such task");
            return;
        };
        signal_group(&entry.record, Signal::SIGINT);
    }

    /// Kills every task's process group, then joins the runners in task-id
    /// order. The kill happens inside a final dispatcher step so that owed
    /// reports drain first; the completion lines of the killed tasks are
    /// emitted by their runners while this loop joins them.
    async fn shutdown(&mut self) {
        debug!(tasks = self.tasks.len(), "shutting down");
        self.lock.before_dispatch().await;
        for entry in &self.tasks {
            signal_group(&entry.record, Signal::SIGKILL);
        }
        self.lock.after_dispatch();
        for entry in self.tasks.drain(..) {
            if let Err(err) = entry.runner.await {
                warn!(%err, "runner failed to join");
            }
        }
    }
}

/// Signals a task's whole process group. A task whose child does not exist
/// yet is skipped; a group that is already gone fails quietly.
fn signal_group(record: &TaskRecord, sig: Signal) {
    let group = record.group_leader();
    if group == 0 {
        return;
    }
    if let Err(err) = signal::killpg(Pid::from_raw(group), sig) {
        debug!(task = record.id, %err, "killpg");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_keeps_the_program_and_its_arguments() {
        assert_eq!(
            parse_command("run /bin/echo hello world"),
            Command::Run(vec![
                "/bin/echo".to_string(),
                "hello".to_string(),
                "world".to_string()
            ])
        );
    }

    #[test]
    fn report_and_kill_verbs_take_a_task_id() {
        assert_eq!(parse_command("out 0"), Command::Out(0));
        assert_eq!(parse_command("err 12"), Command::Err(12));
        assert_eq!(parse_command("kill 3"), Command::Kill(3));
    }

    #[test]
    fn sleep_takes_milliseconds() {
        assert_eq!(parse_command("sleep 1500"), Command::Sleep(1500));
    }

    #[test]
    fn empty_lines_do_nothing() {
        assert_eq!(parse_command(""), Command::Nop);
        assert_eq!(parse_command("   \t "), Command::Nop);
    }

    #[test]
    fn unknown_verbs_quit() {
        assert_eq!(parse_command("quit"), Command::Quit);
        assert_eq!(parse_command("halt"), Command::Quit);
    }

    #[test]
    fn malformed_arguments_are_ignored() {
        assert_eq!(parse_command("out"), Command::Nop);
        assert_eq!(parse_command("kill abc"), Command::Nop);
        assert_eq!(parse_command("sleep"), Command::Nop);
        assert_eq!(parse_command("sleep fast"), Command::Nop);
    }

    #[test]
    fn extra_whitespace_is_accepted() {
        assert_eq!(parse_command("  kill   7  "), Command::Kill(7));
    }
}
