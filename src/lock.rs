//! Ordering protocol between the command dispatcher and per-task reporters.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct State {
    /// True while a dispatcher step is in progress.
    dispatcher_running: bool,
    /// Startup reports owed by dispatched `run` commands.
    pending_runs: u32,
    /// Runners blocked waiting to emit their completion line.
    waiting_reports: u32,
    /// Runners currently emitting their completion line.
    active_reports: u32,
    /// True between a kill step and the prelude of the following step.
    kill_priority: bool,
}

/// Serializes everything the executor prints on its own stdout.
///
/// The dispatcher brackets each command with [`before_dispatch`] and
/// [`after_dispatch`]; no step starts while a startup or completion report is
/// owed. Runners bracket their startup line with [`before_run`] /
/// [`after_run`] and their completion line with [`before_status`] /
/// [`after_status`]; completion lines are held back while a step is active.
/// [`before_kill`] opens a window during which completion reports bypass that
/// hold, so tasks brought down by a `kill` get reported before the next
/// command; [`after_kill`] closes it again.
///
/// This is one state machine behind one mutex, not a lock to be decomposed:
/// the counters are only meaningful jointly. Each phase operation holds the
/// mutex for its whole body and never across an await; waits re-check their
/// guard in a loop, with interest registered before the mutex is released so
/// a wake cannot slip by.
///
/// [`before_dispatch`]: DispatcherLock::before_dispatch
/// [`after_dispatch`]: DispatcherLock::after_dispatch
/// [`before_run`]: DispatcherLock::before_run
/// [`after_run`]: DispatcherLock::after_run
/// [`before_kill`]: DispatcherLock::before_kill
/// [`after_kill`]: DispatcherLock::after_kill
/// [`before_status`]: DispatcherLock::before_status
/// [`after_status`]: DispatcherLock::after_status
pub struct DispatcherLock {
    state: Mutex<State>,
    dispatcher: Notify,
    ended_tasks: Notify,
}

impl DispatcherLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            dispatcher: Notify::new(),
            ended_tasks: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("dispatcher lock mutex poisoned")
    }

    /// Waits until no report is owed and no kill window is open, then marks
    /// a dispatcher step as running.
    pub async fn before_dispatch(&self) {
        loop {
            let notified = self.dispatcher.notified();
            tokio::pin!(notified);
            {
                let mut st = self.state();
                if !st.kill_priority
                    && st.waiting_reports + st.active_reports + st.pending_runs == 0
                {
                    st.dispatcher_running = true;
                    return;
                }
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    /// Ends the current dispatcher step and hands the turn to one waiting
    /// reporter, if any.
    pub fn after_dispatch(&self) {
        self.state().dispatcher_running = false;
        self.ended_tasks.notify_one();
    }

    /// Registers the startup report owed by a freshly dispatched `run`.
    /// Called inside a dispatcher step; never waits.
    pub fn before_run(&self) {
        self.state().pending_runs += 1;
    }

    /// Marks a startup report as emitted. When the last one is in, the turn
    /// goes to a waiting reporter, or back to the dispatcher.
    pub fn after_run(&self) {
        let mut st = self.state();
        st.pending_runs -= 1;
        if st.pending_runs > 0 {
            return;
        }
        if st.waiting_reports > 0 {
            drop(st);
            self.ended_tasks.notify_one();
        } else if st.active_reports == 0 && !st.kill_priority {
            drop(st);
            self.dispatcher.notify_one();
        }
    }

    /// Opens the kill window. Called inside a kill step; never waits.
    pub fn before_kill(&self) {
        self.state().kill_priority = true;
    }

    /// Closes the kill window. Called in the prelude of the step that
    /// follows a kill; entering that step then waits out any reports the
    /// kill provoked.
    pub fn after_kill(&self) {
        self.state().kill_priority = false;
    }

    /// Waits for the right to emit a completion line: immediately inside a
    /// kill window or while the dispatcher is idle, otherwise once the
    /// current step finishes.
    pub async fn before_status(&self) {
        loop {
            let notified = self.ended_tasks.notified();
            tokio::pin!(notified);
            {
                let mut st = self.state();
                if st.kill_priority || !st.dispatcher_running {
                    st.active_reports += 1;
                    return;
                }
                st.waiting_reports += 1;
                notified.as_mut().enable();
            }
            notified.await;
            self.state().waiting_reports -= 1;
        }
    }

    /// Marks a completion line as emitted and passes the turn on: first to
    /// the next waiting reporter, then to the dispatcher once nothing else
    /// is owed.
    pub fn after_status(&self) {
        let mut st = self.state();
        st.active_reports -= 1;
        if st.waiting_reports > 0 {
            drop(st);
            self.ended_tasks.notify_one();
        } else if st.active_reports + st.pending_runs == 0 {
            drop(st);
            self.dispatcher.notify_one();
        }
    }
}

impl Default for DispatcherLock {
    fn default() -> Self {
        Self::new()
    }
}
