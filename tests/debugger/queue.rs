use crate::common::{
    app_module, corelib_module, FakeAppDomain, FakeProcess, FakeThread, TestEnv, COMPUTE, MAIN,
    PROGRAM_CS, TIMEOUT,
};
use mdbg::debugger::breakpoint::LineBreakpointRequest;
use mdbg::debugger::config::DebuggerConfig;
use mdbg::debugger::event::{DebuggerEvent, EventSink, StopReason, StoppedEvent};
use mdbg::debugger::runtime::HResult;
use mdbg::debugger::DebuggerBuilder;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// Time to let the worker pick up an entry that must not be handled yet.
const SETTLE: Duration = Duration::from_millis(100);

#[test]
fn test_stop_serializes_later_callbacks() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    let app = app_module();
    env.load(&app);
    let (views, _) = env
        .debugger
        .set_line_breakpoints(PROGRAM_CS, &[LineBreakpointRequest::new(11)])
        .unwrap();

    env.main_thread.at(app.frame(MAIN, 6));
    env.worker_thread.at(app.frame(COMPUTE, 8));

    let first = env.expect_stop(|| {
        env.breakpoint(&env.main_thread, app.function_of(MAIN).breakpoint_at(6))
    });
    assert_eq!(first.hit_breakpoint_ids, vec![views[0].id]);

    // second thread completes a step while the first stop is not continued yet
    assert_eq!(
        env.step_complete(&env.worker_thread),
        mdbg::debugger::runtime::HResult::S_OK
    );
    thread::sleep(SETTLE);
    assert_eq!(env.sink.stops().len(), 1);

    env.debugger.continue_execution().unwrap();
    let stops = env.sink.wait_stops(2);
    assert_eq!(
        stops[1],
        StoppedEvent::new(StopReason::Step, env.worker_thread.tid())
    );

    let events = env.sink.events();
    let continued = events
        .iter()
        .position(|e| matches!(e, DebuggerEvent::Continued { .. }))
        .unwrap();
    let second_stop = events
        .iter()
        .rposition(|e| matches!(e, DebuggerEvent::Stopped(_)))
        .unwrap();
    assert!(continued < second_stop);

    env.resume();
    thread::sleep(SETTLE);
    assert_eq!(env.sink.stops().len(), 2);
}

#[test]
fn test_pause() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();

    env.debugger.pause().unwrap();
    let stop = env.sink.wait_stops(1).pop().unwrap();
    assert_eq!(
        stop,
        StoppedEvent::new(StopReason::Pause, env.main_thread.tid())
    );
    assert_eq!(env.process.counters().stops, 1);
    assert!(env.debugger.callbacks_queue().is_stopped());

    // pause of a stopped debuggee is a no-op
    env.debugger.pause().unwrap();
    thread::sleep(SETTLE);
    assert_eq!(env.sink.stops().len(), 1);
    assert_eq!(env.process.counters().stops, 1);

    env.resume();
    assert!(env.debugger.callbacks_queue().is_running());
}

#[test]
fn test_pause_reports_last_stopped_thread() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    let app = app_module();
    env.load(&app);

    env.worker_thread.at(app.frame(MAIN, 16));
    env.expect_stop(|| env.user_break(&env.worker_thread));
    env.resume();

    env.debugger.pause().unwrap();
    let stop = env.sink.wait_stops(2).pop().unwrap();
    assert_eq!(stop.reason, StopReason::Pause);
    assert_eq!(stop.thread_id, env.worker_thread.tid());
}

#[test]
fn test_continue_without_stop_is_noop() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    let continues = env.process.counters().continues;

    env.debugger.continue_execution().unwrap();
    assert_eq!(env.process.counters().continues, continues);
    assert_eq!(
        env.sink
            .count(|e| matches!(e, DebuggerEvent::Continued { .. })),
        0
    );
}

#[test]
fn test_user_break() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    let app = app_module();
    let corelib = corelib_module();
    env.load(&app);
    env.load(&corelib);

    env.main_thread.at(app.frame(MAIN, 16));
    let stop = env.expect_stop(|| env.user_break(&env.main_thread));
    assert_eq!(
        stop,
        StoppedEvent::new(StopReason::Pause, env.main_thread.tid())
            .with_description("Debugger.Break")
    );
    env.resume();

    // raised inside CoreLib while Just-My-Code is on
    env.main_thread.at(corelib.frame(0x0600_0100, 4));
    env.expect_silent(|| env.user_break(&env.main_thread));

    env.debugger.set_just_my_code(false);
    env.expect_stop(|| env.user_break(&env.main_thread));
}

#[test]
fn test_process_exit() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    let app = app_module();
    env.load(&app);

    env.main_thread.at(app.frame(MAIN, 16));
    env.expect_stop(|| env.user_break(&env.main_thread));

    env.process.set_exit_code(3);
    assert_eq!(
        env.callback.exit_process(env.process.clone()),
        mdbg::debugger::runtime::HResult::S_OK
    );

    let events = env.sink.events();
    let tail: Vec<_> = events.iter().rev().take(2).rev().cloned().collect();
    assert_eq!(
        tail,
        vec![
            DebuggerEvent::Exited { exit_code: 3 },
            DebuggerEvent::Terminated
        ]
    );
    assert!(!env.debugger.callbacks_queue().is_stopped());

    // stop is released, continue and a second exit are no-ops
    let continues = env.process.counters().continues;
    env.debugger.continue_execution().unwrap();
    env.callback.exit_process(env.process.clone());
    env.debugger.terminate().unwrap();
    assert_eq!(env.process.counters().continues, continues);
    assert_eq!(
        env.sink.count(|e| matches!(e, DebuggerEvent::Terminated)),
        1
    );
    assert_eq!(
        env.sink
            .count(|e| matches!(e, DebuggerEvent::Exited { .. })),
        1
    );
}

#[test]
fn test_terminate() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();

    env.debugger.terminate().unwrap();
    let counters = env.process.counters();
    assert_eq!(counters.stops, 1);
    assert_eq!(counters.terminated, Some(0));
    // session ends with the runtime exit callback
    assert_eq!(env.sink.count(|e| matches!(e, DebuggerEvent::Terminated)), 0);

    env.callback.exit_process(env.process.clone());
    assert_eq!(env.sink.count(|e| matches!(e, DebuggerEvent::Terminated)), 1);
}

#[test]
fn test_terminate_without_process() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.debugger.terminate().unwrap();
    assert_eq!(env.sink.events(), vec![DebuggerEvent::Terminated]);
}

#[test]
fn test_process_event() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    assert_eq!(
        env.sink.events()[0],
        DebuggerEvent::Process {
            name: "App".to_string(),
            system_process_id: 4242,
        }
    );
}

/// Sink that blocks thread events until opened.
#[derive(Default)]
struct GateSink {
    open: Mutex<bool>,
    cond: Condvar,
    blocked: Mutex<bool>,
}

impl GateSink {
    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn wait_blocked(&self) {
        let deadline = std::time::Instant::now() + TIMEOUT;
        while !*self.blocked.lock().unwrap() {
            assert!(std::time::Instant::now() < deadline, "worker never blocked");
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl EventSink for GateSink {
    fn emit(&self, event: DebuggerEvent) {
        if !matches!(event, DebuggerEvent::Thread { .. }) {
            return;
        }
        *self.blocked.lock().unwrap() = true;
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
    }
}

#[test]
fn test_teardown_with_concurrent_process_exit() {
    let sink = Arc::new(GateSink::default());
    let debugger = DebuggerBuilder::new()
        .with_sink(sink.clone())
        .build()
        .unwrap();
    let process = FakeProcess::new(4242);
    debugger.set_process(process.clone());
    let callback = debugger.managed_callback();

    // worker is busy with a deferred callback
    assert_eq!(
        callback.create_thread(Arc::new(FakeAppDomain), FakeThread::new(7)),
        HResult::S_OK
    );
    sink.wait_blocked();

    let (done_tx, done_rx) = mpsc::channel();
    let teardown = thread::spawn(move || {
        drop(debugger);
        done_tx.send(()).unwrap();
    });
    thread::sleep(SETTLE);

    // runtime reports the exit while the debugger is being dropped
    assert_eq!(callback.exit_process(process.clone()), HResult::S_OK);
    sink.open();

    done_rx
        .recv_timeout(TIMEOUT)
        .expect("callbacks worker was not joined");
    teardown.join().unwrap();
    assert_eq!(
        callback.create_thread(Arc::new(FakeAppDomain), FakeThread::new(8)),
        HResult::E_FAIL
    );
}
