use crate::common::{app_module, corelib_module, no_jmc, TestEnv, MAIN};
use mdbg::debugger::breakpoint::{ExceptionBreakMode, ExceptionFilter};
use mdbg::debugger::config::DebuggerConfig;
use mdbg::debugger::event::{DebuggerEvent, StopReason, StoppedEvent};
use mdbg::debugger::runtime::ExceptionCallbackType;
use mdbg::debugger::ExceptionInfo;

const INVALID_OPERATION: &str = "System.InvalidOperationException";

/// Token of a CoreLib method, it never has symbols.
const CORELIB_METHOD: u32 = 0x0600_0100;

#[test]
fn test_user_unhandled_exception() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    let app = app_module();
    let corelib = corelib_module();
    env.load(&app);
    env.load(&corelib);

    let views = env
        .debugger
        .set_exception_breakpoints(&[(ExceptionFilter::UserUnhandled, None)]);
    assert_eq!(views.len(), 1);
    assert!(views[0].verified);

    env.main_thread.throw(INVALID_OPERATION, "Sequence contains no elements");

    env.expect_silent(|| {
        env.exception(
            &env.main_thread,
            Some(app.frame(MAIN, 16)),
            ExceptionCallbackType::FirstChance,
        )
    });

    // handler lives in CoreLib, user code doesn't catch it
    let stop = env.expect_stop(|| {
        env.exception(
            &env.main_thread,
            Some(corelib.frame(CORELIB_METHOD, 0)),
            ExceptionCallbackType::CatchHandlerFound,
        )
    });
    assert_eq!(
        stop,
        StoppedEvent::new(StopReason::Exception, env.main_thread.tid())
            .with_text(INVALID_OPERATION)
            .with_description(format!(
                "Exception is not handled in user code: '{INVALID_OPERATION}'"
            ))
            .with_hit_breakpoints(vec![views[0].id])
    );
    assert_eq!(
        env.debugger.exception_info(env.main_thread.tid()),
        Some(ExceptionInfo {
            type_name: INVALID_OPERATION.to_string(),
            message: Some("Sequence contains no elements".to_string()),
            break_mode: ExceptionBreakMode::UserUnhandled,
        })
    );

    env.resume();
    assert_eq!(
        env.sink
            .count(|e| matches!(e, DebuggerEvent::Continued { .. })),
        1
    );

    let stop = env.expect_stop(|| {
        env.exception(&env.main_thread, None, ExceptionCallbackType::Unhandled)
    });
    assert_eq!(stop.reason, StopReason::Exception);
    assert_eq!(
        stop.description.as_deref(),
        Some("Unhandled exception: 'System.InvalidOperationException'")
    );
    assert!(stop.hit_breakpoint_ids.is_empty());
    assert_eq!(
        env.debugger
            .exception_info(env.main_thread.tid())
            .map(|info| info.break_mode),
        Some(ExceptionBreakMode::Unhandled)
    );
    assert_eq!(env.sink.stops().len(), 2);
}

#[test]
fn test_exception_caught_in_user_code() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    let app = app_module();
    env.load(&app);
    env.load(&corelib_module());
    env.debugger
        .set_exception_breakpoints(&[(ExceptionFilter::UserUnhandled, None)]);
    env.main_thread.throw(INVALID_OPERATION, "boom");

    env.expect_silent(|| {
        env.exception(
            &env.main_thread,
            Some(app.frame(MAIN, 16)),
            ExceptionCallbackType::FirstChance,
        )
    });
    env.expect_silent(|| {
        env.exception(
            &env.main_thread,
            Some(app.frame(MAIN, 24)),
            ExceptionCallbackType::CatchHandlerFound,
        )
    });

    // a user catch was reported before the handler search finished
    env.expect_silent(|| {
        env.exception(
            &env.main_thread,
            None,
            ExceptionCallbackType::UserCatchHandlerFound,
        )
    });
    env.expect_silent(|| {
        env.exception(
            &env.main_thread,
            Some(corelib_module().frame(CORELIB_METHOD, 0)),
            ExceptionCallbackType::CatchHandlerFound,
        )
    });
    assert_eq!(env.debugger.exception_info(env.main_thread.tid()), None);
}

#[test]
fn test_throw_filter() {
    let env = TestEnv::new(no_jmc());
    env.start();
    let app = app_module();
    env.load(&app);

    let views = env
        .debugger
        .set_exception_breakpoints(&[(ExceptionFilter::Throw, None)]);
    env.main_thread.throw(INVALID_OPERATION, "boom");

    let stop = env.expect_stop(|| {
        env.exception(
            &env.main_thread,
            Some(app.frame(MAIN, 16)),
            ExceptionCallbackType::FirstChance,
        )
    });
    assert_eq!(stop.text.as_deref(), Some(INVALID_OPERATION));
    assert_eq!(
        stop.description.as_deref(),
        Some("Exception thrown: 'System.InvalidOperationException'")
    );
    assert_eq!(stop.hit_breakpoint_ids, vec![views[0].id]);
    env.resume();

    // condition narrows exception types
    env.debugger.set_exception_breakpoints(&[(
        ExceptionFilter::Throw,
        Some("System.ArgumentException".to_string()),
    )]);
    env.expect_silent(|| {
        env.exception(
            &env.main_thread,
            Some(app.frame(MAIN, 16)),
            ExceptionCallbackType::FirstChance,
        )
    });

    env.debugger.set_exception_breakpoints(&[(
        ExceptionFilter::Throw,
        Some("!System.ArgumentException".to_string()),
    )]);
    let stop = env.expect_stop(|| {
        env.exception(
            &env.main_thread,
            Some(app.frame(MAIN, 16)),
            ExceptionCallbackType::FirstChance,
        )
    });
    assert_eq!(stop.reason, StopReason::Exception);
}

#[test]
fn test_throw_filter_with_just_my_code() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    let app = app_module();
    env.load(&app);
    env.debugger
        .set_exception_breakpoints(&[(ExceptionFilter::Throw, None)]);
    env.main_thread.throw(INVALID_OPERATION, "boom");

    // first chance in any code is ignored, user first chance stops
    env.expect_silent(|| {
        env.exception(&env.main_thread, None, ExceptionCallbackType::FirstChance)
    });
    let stop = env.expect_stop(|| {
        env.exception(
            &env.main_thread,
            Some(app.frame(MAIN, 16)),
            ExceptionCallbackType::UserFirstChance,
        )
    });
    assert_eq!(stop.reason, StopReason::Exception);
}

#[test]
fn test_composite_filter_keeps_single_id() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();

    let views = env.debugger.set_exception_breakpoints(&[
        (ExceptionFilter::Throw, None),
        (ExceptionFilter::UserUnhandled, None),
    ]);
    assert_eq!(views.len(), 1);

    let again = env.debugger.set_exception_breakpoints(&[
        (ExceptionFilter::UserUnhandled, None),
        (ExceptionFilter::Throw, None),
    ]);
    assert_eq!(again, views);
}

#[test]
fn test_thread_exit_resets_exception_state() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    env.load(&corelib_module());
    env.main_thread.throw(INVALID_OPERATION, "boom");

    env.expect_stop(|| env.exception(&env.main_thread, None, ExceptionCallbackType::Unhandled));
    assert!(env.debugger.exception_info(env.main_thread.tid()).is_some());
    env.resume();

    env.expect_silent(|| {
        env.callback
            .exit_thread(env.app_domain.clone(), env.main_thread.clone())
    });
    assert_eq!(env.debugger.exception_info(env.main_thread.tid()), None);
    assert_eq!(
        env.sink.count(|e| matches!(
            e,
            DebuggerEvent::Thread {
                reason: mdbg::debugger::event::ThreadReason::Exited,
                ..
            }
        )),
        1
    );
}
