use crate::common::{
    app_module, corelib_module, FakeFrame, FakeThread, FakeUnwinder, StackItem, TestEnv, COMPUTE,
    MAIN, PROGRAM_CS,
};
use mdbg::debugger::breakpoint::{LineBreakpointRequest, SourceView};
use mdbg::debugger::config::DebuggerConfig;
use mdbg::debugger::frame::{
    internal_frame_name, walk_frames, FrameType, NativeFrame, NativeUnwinder, WalkFrame,
    NATIVE_FRAMES_NAME,
};
use mdbg::debugger::runtime::{
    CpuContext, IlOffset, InternalFrame, InternalFrameType, MappingResult,
};
use mdbg::debugger::thread::{FrameId, ThreadId};
use mdbg::debugger::Error;
use std::ops::ControlFlow;
use std::sync::Arc;

fn managed(token: u32, il_offset: IlOffset) -> String {
    format!("{token:#x}+{il_offset:#x}")
}

fn describe(frame: WalkFrame) -> String {
    match frame {
        WalkFrame::Managed(frame) => {
            let token = frame.function().unwrap().token();
            let (il_offset, _) = frame.ip().unwrap();
            managed(token.0, il_offset)
        }
        WalkFrame::Internal(internal) => internal_frame_name(internal.kind).to_string(),
        WalkFrame::Native(native) => native.name.unwrap_or_default(),
        WalkFrame::NativeChain => NATIVE_FRAMES_NAME.to_string(),
    }
}

fn walk(thread: &FakeThread, unwinder: Option<&dyn NativeUnwinder>) -> Vec<(FrameType, String)> {
    let mut frames = vec![];
    walk_frames(thread, unwinder, |frame_type, frame| {
        frames.push((frame_type, describe(frame)));
        Ok(ControlFlow::Continue(()))
    })
    .unwrap();
    frames
}

fn native_context(sp: u64) -> CpuContext {
    CpuContext {
        ip: 0x7e00_0000 + sp,
        sp,
        fp: sp + 0x10,
    }
}

fn libc_unwinder() -> FakeUnwinder {
    FakeUnwinder {
        frames: vec![
            NativeFrame {
                ip: 0x7f10_0010,
                sp: 0x50,
                name: Some("libc.so.6!read".to_string()),
                in_runtime: false,
            },
            NativeFrame {
                ip: 0x7f20_0020,
                sp: 0x60,
                name: Some("libcoreclr.so!ThePreStub".to_string()),
                in_runtime: true,
            },
        ],
        calls: Default::default(),
    }
}

#[test]
fn test_internal_frames_spliced_by_address() {
    let app = app_module();
    let thread = FakeThread::new(1);
    thread.set_stack(vec![
        StackItem::managed(app.frame(MAIN, 6), 0x100),
        StackItem::managed(app.frame(COMPUTE, 8), 0x200),
    ]);
    thread.set_internals(vec![
        InternalFrame {
            kind: InternalFrameType::M2U,
            address: 0x150,
        },
        InternalFrame {
            kind: InternalFrameType::Exception,
            address: 0x120,
        },
        InternalFrame {
            kind: InternalFrameType::FuncEval,
            address: 0x300,
        },
        InternalFrame {
            kind: InternalFrameType::U2M,
            address: 0x80,
        },
    ]);

    assert_eq!(
        walk(&thread, None),
        vec![
            (
                FrameType::ClrInternal,
                "[Native to Managed Transition]".to_string()
            ),
            (FrameType::ClrManaged, managed(MAIN, 6)),
            (
                FrameType::ClrInternal,
                "[Managed to Native Transition]".to_string()
            ),
            (FrameType::ClrManaged, managed(COMPUTE, 8)),
            (FrameType::ClrInternal, "[Function Evaluation]".to_string()),
        ]
    );
}

#[test]
fn test_native_chains_collapse() {
    let app = app_module();
    let thread = FakeThread::new(1);
    thread.set_stack(vec![
        StackItem::native(0x50),
        StackItem::native(0x60),
        StackItem::managed(app.frame(MAIN, 6), 0x100),
        StackItem::RuntimeUnwindable(native_context(0x180)),
        StackItem::managed(app.frame(COMPUTE, 8), 0x200),
        StackItem::native(0x300),
    ]);

    let chain = (FrameType::Native, NATIVE_FRAMES_NAME.to_string());
    assert_eq!(
        walk(&thread, None),
        vec![
            chain.clone(),
            (FrameType::ClrManaged, managed(MAIN, 6)),
            (FrameType::ClrManaged, managed(COMPUTE, 8)),
            chain,
        ]
    );

    // unwinder without results falls back to the chain label
    let unwinder = FakeUnwinder::default();
    assert_eq!(walk(&thread, Some(&unwinder))[0], (FrameType::Native, NATIVE_FRAMES_NAME.to_string()));
}

#[test]
fn test_native_frames_unwound() {
    let app = app_module();
    let thread = FakeThread::new(1);
    thread.set_stack(vec![
        StackItem::native(0x50),
        StackItem::native(0x58),
        StackItem::managed(app.frame(MAIN, 6), 0x100),
        StackItem::native(0x300),
    ]);

    let unwinder = libc_unwinder();
    let frames = walk(&thread, Some(&unwinder));
    assert_eq!(
        frames,
        vec![
            (FrameType::Native, "libc.so.6!read".to_string()),
            (FrameType::ClrNative, "libcoreclr.so!ThePreStub".to_string()),
            (FrameType::ClrManaged, managed(MAIN, 6)),
            (FrameType::Native, "libc.so.6!read".to_string()),
            (FrameType::ClrNative, "libcoreclr.so!ThePreStub".to_string()),
        ]
    );

    // chain starts at its first native frame, ends at the next managed one or the stack end
    assert_eq!(
        *unwinder.calls.lock().unwrap(),
        vec![
            (native_context(0x50), Some(0x100)),
            (native_context(0x300), None)
        ]
    );
}

#[test]
fn test_frame_pointer_fixed_on_top_frame_only() {
    let app = app_module();
    let thread = FakeThread::new(1);
    let top = CpuContext {
        ip: 0x7f00_1000,
        sp: 0x100,
        fp: 0,
    };
    thread.set_stack(vec![
        StackItem::Managed(app.frame(MAIN, 6), top),
        StackItem::Managed(
            app.frame(COMPUTE, 8),
            CpuContext {
                ip: 0x7f00_2000,
                sp: 0x200,
                fp: 0,
            },
        ),
    ]);

    assert_eq!(walk(&thread, None).len(), 2);
    assert_eq!(
        thread.set_contexts(),
        vec![CpuContext { fp: 0x100, ..top }]
    );

    // top of the walk is unmanaged, managed frames keep their context
    let thread = FakeThread::new(2);
    thread.set_stack(vec![
        StackItem::native(0x50),
        StackItem::Managed(app.frame(MAIN, 6), top),
    ]);
    walk(&thread, None);
    assert!(thread.set_contexts().is_empty());
}

#[test]
fn test_frames_without_mapping_skipped() {
    let app = app_module();
    let thread = FakeThread::new(1);
    thread.set_stack(vec![
        StackItem::managed(
            FakeFrame::with_mapping(app.function_of(MAIN), 0, MappingResult::NoInfo),
            0x100,
        ),
        StackItem::managed(
            FakeFrame::with_mapping(app.function_of(MAIN), 0, MappingResult::UnmappedAddress),
            0x180,
        ),
        StackItem::managed(
            FakeFrame::with_mapping(app.function_of(COMPUTE), 8, MappingResult::Approximate),
            0x200,
        ),
    ]);

    assert_eq!(
        walk(&thread, None),
        vec![(FrameType::ClrManaged, managed(COMPUTE, 8))]
    );
}

#[test]
fn test_walk_stops_on_break() {
    let app = app_module();
    let thread = FakeThread::new(1);
    thread.set_stack(vec![
        StackItem::managed(app.frame(MAIN, 6), 0x100),
        StackItem::native(0x180),
        StackItem::managed(app.frame(COMPUTE, 8), 0x200),
    ]);

    let mut seen = 0;
    walk_frames(thread.as_ref(), None, |_, _| {
        seen += 1;
        Ok(ControlFlow::Break(()))
    })
    .unwrap();
    assert_eq!(seen, 1);
}

#[test]
fn test_walk_error() {
    let thread = FakeThread::new(1);
    let err = walk_frames(thread.as_ref(), None, |_, _| Ok(ControlFlow::Continue(()))).unwrap_err();
    assert!(matches!(err, Error::Runtime(_)));
}

/// Stop main thread at line 11 of `Main` with a mixed stack.
fn stop_with_stack(env: &TestEnv, stack: Vec<StackItem>) {
    let app = app_module();
    env.load(&app);
    env.debugger
        .set_line_breakpoints(PROGRAM_CS, &[LineBreakpointRequest::new(11)])
        .unwrap();
    let mut items = vec![StackItem::managed(app.frame(MAIN, 6), 0x100)];
    items.extend(stack);
    env.main_thread.set_stack(items);
    env.expect_stop(|| env.breakpoint(&env.main_thread, app.function_of(MAIN).breakpoint_at(6)));
}

#[test]
fn test_stack_trace() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    let app = app_module();
    stop_with_stack(
        &env,
        vec![
            StackItem::native(0x180),
            StackItem::managed(app.frame(COMPUTE, 8), 0x200),
        ],
    );
    let tid = env.main_thread.tid();

    let (frames, total) = env.debugger.stack_trace(tid, 0, 0).unwrap();
    assert_eq!(total, 3);
    assert_eq!(frames.len(), 3);

    assert_eq!(frames[0].name, "App.dll!App.Program.Main");
    assert_eq!(frames[0].source, Some(SourceView::new(PROGRAM_CS)));
    assert_eq!(frames[0].line, 11);
    assert_eq!(frames[0].column, 9);
    assert_eq!(frames[0].end_line, Some(11));
    assert_eq!(frames[0].end_column, Some(31));
    assert_eq!(frames[0].presentation_hint, None);
    assert_eq!(frames[0].frame_type, FrameType::ClrManaged);

    assert_eq!(frames[1].name, NATIVE_FRAMES_NAME);
    assert_eq!(frames[1].presentation_hint, Some("label"));
    assert_eq!(frames[1].source, None);
    assert_eq!(frames[1].frame_type, FrameType::Native);

    assert_eq!(frames[2].name, "App.dll!App.Program.Compute");
    assert_eq!(frames[2].line, 21);

    // paging keeps the total and frame ids
    let (page, total) = env.debugger.stack_trace(tid, 1, 1).unwrap();
    assert_eq!(total, 3);
    assert_eq!(page, vec![frames[1].clone()]);

    let (thread, level) = env
        .debugger
        .frame_by_id(FrameId::from_raw(frames[2].id))
        .unwrap();
    assert_eq!((thread, level), (tid, 2));

    let err = env
        .debugger
        .stack_trace(ThreadId::new(999), 0, 0)
        .unwrap_err();
    assert!(matches!(err, Error::ThreadNotFound(_)));
}

#[test]
fn test_frame_ids_invalidated_on_resume() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    stop_with_stack(&env, vec![]);
    let tid = env.main_thread.tid();

    let (frames, _) = env.debugger.stack_trace(tid, 0, 0).unwrap();
    let id = FrameId::from_raw(frames[0].id);
    assert!(env.debugger.frame_by_id(id).is_ok());

    env.resume();
    assert!(matches!(
        env.debugger.frame_by_id(id),
        Err(Error::FrameNotFound(_))
    ));
    assert!(matches!(
        env.debugger.stack_trace(tid, 0, 0),
        Err(Error::ProcessRunning)
    ));
}

#[test]
fn test_stack_trace_frames_without_source() {
    let env = TestEnv::new(DebuggerConfig::default());
    env.start();
    let app = app_module();
    let corelib = corelib_module();
    env.load(&corelib);
    stop_with_stack(
        &env,
        vec![
            StackItem::managed(corelib.frame(0x0600_0100, 4), 0x200),
            // hidden sequence point is shown at the nearest visible line
            StackItem::managed(app.frame(MAIN, 24), 0x300),
        ],
    );

    let (frames, _) = env
        .debugger
        .stack_trace(env.main_thread.tid(), 0, 0)
        .unwrap();
    assert_eq!(frames[1].name, "System.Private.CoreLib.dll!Method0x06000100");
    assert_eq!(frames[1].source, None);
    assert_eq!(frames[1].line, 0);
    assert_eq!(frames[2].line, 12);
}

#[test]
fn test_stack_trace_with_interop() {
    let config = DebuggerConfig {
        interop_debugging: true,
        ..DebuggerConfig::default()
    };
    let env = TestEnv::with_unwinder(config, Some(Arc::new(libc_unwinder())));
    env.start();
    stop_with_stack(&env, vec![StackItem::native(0x180)]);

    let (frames, total) = env
        .debugger
        .stack_trace(env.main_thread.tid(), 0, 0)
        .unwrap();
    assert_eq!(total, 3);
    assert_eq!(frames[1].name, "libc.so.6!read");
    assert_eq!(frames[1].frame_type, FrameType::Native);
    assert_eq!(frames[2].frame_type, FrameType::ClrNative);

    // without interop debugging the unwinder is ignored
    let env = TestEnv::with_unwinder(DebuggerConfig::default(), Some(Arc::new(libc_unwinder())));
    env.start();
    stop_with_stack(&env, vec![StackItem::native(0x180)]);
    let (frames, _) = env
        .debugger
        .stack_trace(env.main_thread.tid(), 0, 0)
        .unwrap();
    assert_eq!(frames[1].name, NATIVE_FRAMES_NAME);
}
