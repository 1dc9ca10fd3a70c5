use crate::common::{
    app_module, foo_module, lib_module, TestEnv, CTOR, CTOR_INT, COMPUTE, C_CS, FOO_CS,
    HELPER_CS, HELPER_RUN, HIDDEN, MAIN, PROGRAM_CS,
};
use mdbg::dap::protocol::event_message;
use mdbg::debugger::breakpoint::{
    BreakpointView, FunctionBreakpointRequest, LineBreakpointRequest, SourceView,
};
use mdbg::debugger::config::DebuggerConfig;
use mdbg::debugger::event::{ChangeReason, DebuggerEvent, StopReason, StoppedEvent};
use mdbg::debugger::Error;
use serde_json::json;

fn line(l: i64) -> LineBreakpointRequest {
    LineBreakpointRequest::new(l)
}

/// `(id, line, verified)` of every line breakpoint.
fn summary(env: &TestEnv) -> Vec<(u32, Option<u32>, bool)> {
    env.debugger
        .breakpoints()
        .line
        .views()
        .into_iter()
        .map(|v| (v.id, v.line, v.verified))
        .collect()
}

#[test]
fn test_pending_breakpoint_resolved_on_module_load() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();

    let (views, changes) = env
        .debugger
        .set_line_breakpoints(FOO_CS, &[line(42)])
        .unwrap();
    assert_eq!(
        views,
        vec![BreakpointView {
            id: 1,
            verified: false,
            message: None,
            source: None,
            line: Some(42),
            end_line: None,
            hit_count: 0,
        }]
    );
    // the record is reported back to the caller, not to the sink
    assert_eq!(
        changes
            .iter()
            .map(|e| (e.reason, e.breakpoint.id))
            .collect::<Vec<_>>(),
        vec![(ChangeReason::New, 1)]
    );
    assert!(env.sink.breakpoint_events().is_empty());

    env.load(&foo_module());

    let events = env.sink.breakpoint_events();
    assert_eq!(
        events,
        vec![DebuggerEvent::Breakpoint {
            reason: ChangeReason::Changed,
            breakpoint: BreakpointView {
                id: 1,
                verified: true,
                message: None,
                source: Some(SourceView::new(FOO_CS)),
                line: Some(44),
                end_line: Some(44),
                hit_count: 0,
            },
        }]
    );
    assert_eq!(
        event_message(&events[0]),
        (
            "breakpoint",
            Some(json!({
                "reason": "changed",
                "breakpoint": {
                    "id": 1,
                    "verified": true,
                    "line": 44,
                    "endLine": 44,
                    "source": {"name": "Foo.cs", "path": "/app/src/Foo.cs"},
                },
            }))
        )
    );
}

#[test]
fn test_constructor_initializer_line_hits_once() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    let app = app_module();
    env.load(&app);

    let (views, _) = env.debugger.set_line_breakpoints(C_CS, &[line(50)]).unwrap();
    assert!(views[0].verified);
    assert_eq!(views[0].line, Some(50));

    // one site per constructor
    let ctor = app.function_of(CTOR);
    let ctor_int = app.function_of(CTOR_INT);
    assert!(ctor.breakpoint_at(0).active());
    assert!(ctor_int.breakpoint_at(0).active());

    env.main_thread.at(app.frame(CTOR, 0));
    let stop = env.expect_stop(|| env.breakpoint(&env.main_thread, ctor.breakpoint_at(0)));
    assert_eq!(
        stop,
        StoppedEvent::new(StopReason::Breakpoint, env.main_thread.tid())
            .with_hit_breakpoints(vec![views[0].id])
    );
    assert!(stop.all_threads_stopped);

    env.resume();
    assert_eq!(env.sink.stops().len(), 1);
    assert_eq!(env.debugger.breakpoints().line.views()[0].hit_count, 1);
}

#[test]
fn test_conditional_breakpoint() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    let app = app_module();
    env.load(&app);
    env.evaluator.set("i==5", false);

    let (views, _) = env
        .debugger
        .set_line_breakpoints(PROGRAM_CS, &[line(11).with_condition("i==5")])
        .unwrap();
    assert!(views[0].verified);

    env.main_thread.at(app.frame(MAIN, 6));
    let bp = app.function_of(MAIN).breakpoint_at(6);

    // false condition: debuggee is never observed stopped
    env.expect_silent(|| env.breakpoint(&env.main_thread, bp.clone()));
    assert_eq!(
        env.sink
            .count(|e| matches!(e, DebuggerEvent::Continued { .. })),
        0
    );
    assert_eq!(env.evaluator.calls(), vec!["i==5".to_string()]);

    env.evaluator.set("i==5", true);
    let stop = env.expect_stop(|| env.breakpoint(&env.main_thread, bp));
    assert_eq!(stop.reason, StopReason::Breakpoint);
    assert_eq!(stop.hit_breakpoint_ids, vec![views[0].id]);
}

#[test]
fn test_condition_evaluation_failure_is_no_hit() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    let app = app_module();
    env.load(&app);

    let (views, _) = env
        .debugger
        .set_line_breakpoints(PROGRAM_CS, &[line(12).with_condition("j > 0")])
        .unwrap();
    env.main_thread.at(app.frame(MAIN, 16));
    let bp = app.function_of(MAIN).breakpoint_at(16);
    env.expect_silent(|| env.breakpoint(&env.main_thread, bp));

    let outputs: Vec<_> = env
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            DebuggerEvent::Output { output, .. } => Some(output),
            _ => None,
        })
        .collect();
    assert_eq!(outputs.len(), 1);
    assert!(outputs[0].starts_with(&format!(
        "breakpoint {}: condition evaluation failed",
        views[0].id
    )));
}

#[test]
fn test_just_my_code_suppression() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    let app = app_module();
    env.load(&app);

    let (views, _) = env
        .debugger
        .set_line_breakpoints(PROGRAM_CS, &[line(40)])
        .unwrap();
    assert!(views[0].verified);
    assert_eq!(views[0].line, Some(40));

    env.main_thread.at(app.frame(HIDDEN, 0));
    let bp = app.function_of(HIDDEN).breakpoint_at(0);
    env.expect_silent(|| env.breakpoint(&env.main_thread, bp.clone()));

    env.debugger.set_just_my_code(false);
    let stop = env.expect_stop(|| env.breakpoint(&env.main_thread, bp.clone()));
    assert_eq!(stop.hit_breakpoint_ids, vec![views[0].id]);
    env.resume();

    // back to the initial decision
    env.debugger.set_just_my_code(true);
    env.expect_silent(|| env.breakpoint(&env.main_thread, bp));
    assert_eq!(env.sink.stops().len(), 1);
}

#[test]
fn test_resubmission_is_idempotent() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    env.load(&app_module());
    let line_bps = &env.debugger.breakpoints().line;

    let requests = [line(11), line(12).with_condition("x > 1")];
    let (first, events) = line_bps.set_breakpoints(PROGRAM_CS, &requests).unwrap();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.reason == ChangeReason::New));

    let (second, events) = line_bps.set_breakpoints(PROGRAM_CS, &requests).unwrap();
    assert!(events.is_empty());
    assert_eq!(first, second);

    // same line with another condition is a different breakpoint
    let (third, events) = line_bps
        .set_breakpoints(
            PROGRAM_CS,
            &[line(12).with_condition("x > 1"), line(11).with_condition("y")],
        )
        .unwrap();
    assert_eq!(third[0].id, first[1].id);
    assert_ne!(third[1].id, first[0].id);
    let reasons: Vec<_> = events.iter().map(|e| (e.reason, e.breakpoint.id)).collect();
    assert_eq!(
        reasons,
        vec![
            (ChangeReason::New, third[1].id),
            (ChangeReason::Removed, first[0].id)
        ]
    );

    // relative and non canonical paths address the same file
    let (fourth, events) = line_bps
        .set_breakpoints(
            "/app/src/../src/./Program.cs",
            &[line(12).with_condition("x > 1"), line(11).with_condition("y")],
        )
        .unwrap();
    assert!(events.is_empty());
    assert_eq!(fourth, third);
}

#[test]
fn test_reapply_after_module_churn() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    let requests = [line(11), line(13), line(99)];

    let (pending, _) = env
        .debugger
        .set_line_breakpoints(PROGRAM_CS, &requests)
        .unwrap();
    assert!(pending.iter().all(|v| !v.verified));

    let app = app_module();
    env.load(&app);
    let loaded = summary(&env);
    env.unload(&app);
    env.load(&app);
    assert_eq!(summary(&env), loaded);

    let (views, events) = env
        .debugger
        .set_line_breakpoints(PROGRAM_CS, &requests)
        .unwrap();
    assert!(events.is_empty());
    assert_eq!(
        views
            .iter()
            .map(|v| (v.id, v.line, v.verified))
            .collect::<Vec<_>>(),
        loaded
    );
    // ids survive the first verifying load
    assert_eq!(
        views.iter().map(|v| v.id).collect::<Vec<_>>(),
        pending.iter().map(|v| v.id).collect::<Vec<_>>()
    );
    // line without sequence points stays pending forever
    assert_eq!(loaded[2], (pending[2].id, Some(99), false));
}

#[test]
fn test_line_between_sequence_points() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    env.load(&app_module());

    let (views, _) = env
        .debugger
        .set_line_breakpoints(PROGRAM_CS, &[line(13)])
        .unwrap();
    assert!(views[0].verified);
    assert_eq!(views[0].line, Some(14));
    assert_eq!(views[0].end_line, Some(14));
    assert_eq!(views[0].source, Some(SourceView::new(PROGRAM_CS)));
}

#[test]
fn test_invalid_line_rejects_request() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    env.load(&app_module());

    let (views, _) = env
        .debugger
        .set_line_breakpoints(PROGRAM_CS, &[line(11)])
        .unwrap();

    let err = env
        .debugger
        .set_line_breakpoints(PROGRAM_CS, &[line(12), line(0)])
        .unwrap_err();
    assert!(matches!(err, Error::InvalidLineNumber(0)));
    let err = env
        .debugger
        .set_line_breakpoints(PROGRAM_CS, &[line(-3)])
        .unwrap_err();
    assert!(matches!(err, Error::InvalidLineNumber(-3)));

    // nothing changed
    assert_eq!(env.debugger.breakpoints().line.views(), views);
}

#[test]
fn test_activation_failure_reported() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    let app = app_module();
    env.debugger
        .set_line_breakpoints(PROGRAM_CS, &[line(11)])
        .unwrap();

    app.function_of(MAIN).fail_breakpoints(true);
    env.load(&app);

    let events = env.sink.breakpoint_events();
    assert_eq!(events.len(), 1);
    let DebuggerEvent::Breakpoint { reason, breakpoint } = &events[0] else {
        unreachable!()
    };
    assert_eq!(*reason, ChangeReason::Changed);
    assert!(!breakpoint.verified);
    assert!(breakpoint.message.is_some());
}

#[test]
fn test_unload_returns_breakpoint_to_pending() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    let app = app_module();
    env.load(&app);

    let (views, _) = env
        .debugger
        .set_line_breakpoints(PROGRAM_CS, &[line(11)])
        .unwrap();
    let bp = app.function_of(MAIN).breakpoint_at(6);

    env.unload(&app);
    assert!(!bp.active());
    assert_eq!(
        env.sink.breakpoint_events().last(),
        Some(&DebuggerEvent::Breakpoint {
            reason: ChangeReason::Changed,
            breakpoint: BreakpointView {
                id: views[0].id,
                verified: false,
                message: None,
                source: None,
                line: Some(11),
                end_line: None,
                hit_count: 0,
            },
        })
    );

    env.load(&app);
    let DebuggerEvent::Breakpoint { reason, breakpoint } =
        env.sink.breakpoint_events().pop().unwrap()
    else {
        unreachable!()
    };
    assert_eq!(reason, ChangeReason::Changed);
    assert_eq!(breakpoint.id, views[0].id);
    assert!(breakpoint.verified);
    assert_eq!(breakpoint.line, Some(11));
    assert!(app.function_of(MAIN).breakpoint_at(6).active());
}

#[test]
fn test_function_breakpoints() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    let app = app_module();
    env.load(&app);

    let (views, _) = env.debugger.set_function_breakpoints(&[
        FunctionBreakpointRequest::new("Program.Compute"),
        FunctionBreakpointRequest::new("Lib.Helper.Run"),
    ]);
    assert!(views[0].verified);
    assert_eq!(views[0].line, Some(20));
    assert_eq!(views[0].source, Some(SourceView::new(PROGRAM_CS)));
    assert!(!views[1].verified);

    let compute = app.function_of(COMPUTE);
    env.main_thread.at(app.frame(COMPUTE, 0));
    let stop = env.expect_stop(|| env.breakpoint(&env.main_thread, compute.breakpoint_at(0)));
    assert_eq!(stop.hit_breakpoint_ids, vec![views[0].id]);
    env.resume();

    let lib = lib_module();
    env.load(&lib);
    let DebuggerEvent::Breakpoint { reason, breakpoint } =
        env.sink.breakpoint_events().pop().unwrap()
    else {
        unreachable!()
    };
    assert_eq!(reason, ChangeReason::Changed);
    assert_eq!(breakpoint.id, views[1].id);
    assert!(breakpoint.verified);
    assert_eq!(breakpoint.line, Some(5));
    assert_eq!(breakpoint.source, Some(SourceView::new(HELPER_CS)));

    // parameter list narrows overloads, ids of kept entries are preserved
    let (views2, _) = env.debugger.set_function_breakpoints(&[
        FunctionBreakpointRequest::new("Program.Compute"),
        FunctionBreakpointRequest::new("App.Program.Compute(System.Int32)"),
        FunctionBreakpointRequest::new("App.Program.Compute( System.String )"),
    ]);
    assert_eq!(views2[0].id, views[0].id);
    assert!(views2[1].verified);
    assert!(!views2[2].verified);
    assert!(compute.breakpoints().iter().any(|bp| bp.active()));
    // removed record released its handle
    assert!(!lib
        .function_of(HELPER_RUN)
        .breakpoints()
        .iter()
        .any(|bp| bp.active()));
}

#[test]
fn test_entry_breakpoint() {
    let config = DebuggerConfig {
        stop_at_entry: true,
        ..DebuggerConfig::default()
    };
    let env = TestEnv::new(config);
    env.start();
    env.load(&lib_module());
    let app = app_module();
    env.load(&app);

    let bp = app.function_of(MAIN).breakpoint_at(0);
    env.main_thread.at(app.frame(MAIN, 0));
    let stop = env.expect_stop(|| env.breakpoint(&env.main_thread, bp.clone()));
    assert_eq!(
        stop,
        StoppedEvent::new(StopReason::Entry, env.main_thread.tid())
    );
    assert!(!bp.active());
    assert!(env.debugger.breakpoints().entry.is_fired());
    env.resume();

    // one shot
    env.expect_silent(|| env.breakpoint(&env.main_thread, bp));
}

#[test]
fn test_detach_releases_handles() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    let app = app_module();
    env.load(&app);
    env.debugger
        .set_line_breakpoints(PROGRAM_CS, &[line(11)])
        .unwrap();
    env.debugger
        .set_function_breakpoints(&[FunctionBreakpointRequest::new("Compute")]);
    let line_bp = app.function_of(MAIN).breakpoint_at(6);
    let function_bp = app.function_of(COMPUTE).breakpoint_at(0);

    env.debugger.detach().unwrap();

    assert!(!line_bp.active());
    assert!(!function_bp.active());
    assert!(env.debugger.breakpoints().line.views().is_empty());
    let counters = env.process.counters();
    assert!(counters.detached);
    assert_eq!(counters.terminated, None);
    assert_eq!(
        env.sink
            .count(|e| matches!(e, DebuggerEvent::Terminated)),
        1
    );
}
