//! End-to-end scenarios driving the executor binary over piped stdio.
//!
//! The command grammar splits on whitespace with no quoting, so the child
//! command lines below are built from space-free tokens (printf format
//! strings, `${IFS}` where a shell word needs an internal separator).

use std::io::Write;
use std::process::{Command, ExitStatus, Stdio};

fn run_script(script: &str) -> (String, ExitStatus) {
    let mut child = Command::new(env!("CARGO_BIN_EXE_executor"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn the executor");
    child
        .stdin
        .as_mut()
        .expect("executor stdin not piped")
        .write_all(script.as_bytes())
        .expect("failed to write the command script");
    let output = child
        .wait_with_output()
        .expect("failed to wait for the executor");
    (
        String::from_utf8(output.stdout).expect("executor output was not UTF-8"),
        output.status,
    )
}

#[test]
fn a_task_reports_startup_and_a_clean_exit_in_order() {
    let (out, status) = run_script("run /bin/echo hello\nsleep 300\nquit\n");
    assert!(status.success());
    let started = out
        .find("Task 0 started: pid ")
        .expect("startup line missing");
    let ended = out
        .find("Task 0 ended: status 0.")
        .expect("completion line missing");
    assert!(started < ended, "completion reported before startup:\n{out}");
}

#[test]
fn out_reports_the_most_recent_stdout_line() {
    let (out, status) = run_script("run /usr/bin/printf A\\nB\\n\nsleep 300\nout 0\nquit\n");
    assert!(status.success());
    assert!(out.contains("Task 0 stdout: 'B'."), "unexpected output:\n{out}");
}

#[test]
fn err_reports_the_most_recent_stderr_line() {
    let (out, status) = run_script("run /bin/sh -c echo${IFS}oops>&2\nsleep 300\nerr 0\nquit\n");
    assert!(status.success());
    assert!(out.contains("Task 0 stderr: 'oops'."), "unexpected output:\n{out}");
    assert!(!out.contains("Task 0 stdout: 'oops'."));
}

#[test]
fn latches_start_out_empty() {
    let (out, status) = run_script("run /bin/sleep 1\nout 0\nerr 0\nquit\n");
    assert!(status.success());
    assert!(out.contains("Task 0 stdout: ''."), "unexpected output:\n{out}");
    assert!(out.contains("Task 0 stderr: ''."), "unexpected output:\n{out}");
}

#[test]
fn kill_interrupts_the_whole_group_and_reports_it() {
    let (out, status) = run_script("run /bin/cat\nsleep 200\nkill 0\nsleep 300\nquit\n");
    assert!(status.success());
    let started = out
        .find("Task 0 started: pid ")
        .expect("startup line missing");
    let ended = out
        .find("Task 0 ended: signalled.")
        .expect("signalled completion missing");
    assert!(started < ended);
}

#[test]
fn parallel_tasks_start_before_either_ends() {
    let script = "run /bin/sleep 1\nrun /bin/sleep 1\nsleep 1500\nquit\n";
    let (out, status) = run_script(script);
    assert!(status.success());
    let started_0 = out.find("Task 0 started: pid ").expect("task 0 never started");
    let started_1 = out.find("Task 1 started: pid ").expect("task 1 never started");
    let ended_0 = out.find("Task 0 ended: status 0.").expect("task 0 never ended");
    let ended_1 = out.find("Task 1 ended: status 0.").expect("task 1 never ended");
    assert!(started_0 < started_1);
    assert!(started_1 < ended_0.min(ended_1), "a task ended early:\n{out}");
}

#[test]
fn an_unterminated_write_is_latched_once_the_stream_closes() {
    let (out, status) = run_script("run /usr/bin/printf xxxxxxxx\nsleep 300\nout 0\nquit\n");
    assert!(status.success());
    assert!(out.contains("Task 0 stdout: 'xxxxxxxx'."), "unexpected output:\n{out}");
}

#[test]
fn long_lines_are_truncated_to_the_latch_capacity() {
    // 1500 digits on one line; the latch keeps the first 1022 bytes.
    let (out, status) = run_script("run /usr/bin/printf %01500d\\n 0\nsleep 300\nout 0\nquit\n");
    assert!(status.success());
    let expected = format!("Task 0 stdout: '{}'.", "0".repeat(1022));
    assert!(out.contains(&expected), "truncation mismatch:\n{out}");
}

#[test]
fn a_nonzero_exit_status_is_reported() {
    let (out, status) = run_script("run /bin/sh -c exit${IFS}7\nsleep 300\nquit\n");
    assert!(status.success());
    assert!(out.contains("Task 0 ended: status 7."), "unexpected output:\n{out}");
}

#[test]
fn end_of_input_is_a_clean_shutdown() {
    let (out, status) = run_script("");
    assert!(status.success());
    assert!(out.is_empty());
}

#[test]
fn an_unknown_verb_quits() {
    let (out, status) = run_script("halt\nout 0\n");
    assert!(status.success());
    assert!(out.is_empty());
}

#[test]
fn empty_lines_are_no_ops() {
    let (out, status) = run_script("\n\n\nquit\n");
    assert!(status.success());
    assert!(out.is_empty());
}

#[test]
fn task_ids_are_dense_and_assigned_in_command_order() {
    let (out, status) = run_script("run /bin/echo a\nrun /bin/echo b\nsleep 300\nquit\n");
    assert!(status.success());
    assert!(out.contains("Task 0 started: pid "));
    assert!(out.contains("Task 1 started: pid "));
    assert!(out.contains("Task 0 ended: status 0."));
    assert!(out.contains("Task 1 ended: status 0."));
}

#[test]
fn every_emitted_line_is_whole() {
    let (out, status) = run_script("run /bin/echo a\nrun /bin/echo b\nsleep 300\nquit\n");
    assert!(status.success());
    for line in out.lines() {
        assert!(
            line.starts_with("Task ") && line.ends_with('.'),
            "garbled line: {line:?}"
        );
    }
}
