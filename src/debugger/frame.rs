//! Frame Walker: turns the runtime mixed stack walk (managed frames, runtime internal
//! frames and unmanaged code) into a single classified frame sequence.

use crate::debugger::breakpoint::SourceView;
use crate::debugger::error::Error;
use crate::debugger::runtime::{
    CpuContext, Frame, InternalFrame, InternalFrameType, MappingResult, Thread, WalkPosition,
};
use crate::weak_error;
use itertools::Itertools;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FrameType {
    Unknown,
    /// Unmanaged code outside the runtime.
    Native,
    /// Unmanaged code of the runtime itself.
    ClrNative,
    /// Runtime transition or stub frame.
    ClrInternal,
    ClrManaged,
}

/// Native frame produced by a [`NativeUnwinder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeFrame {
    pub ip: u64,
    pub sp: u64,
    pub name: Option<String>,
    /// Frame belongs to the runtime native code.
    pub in_runtime: bool,
}

/// Single visible frame.
pub enum WalkFrame {
    Managed(Arc<dyn Frame>),
    Internal(InternalFrame),
    Native(NativeFrame),
    /// Unresolved unmanaged chain, shown as a single `[Native Frames]` entry.
    NativeChain,
}

/// Stack frame as it shown to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrameView {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceView>,
    pub line: u32,
    pub column: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_column: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presentation_hint: Option<&'static str>,
    #[serde(skip)]
    pub frame_type: FrameType,
}

impl StackFrameView {
    /// Frame without source, rendered as a label.
    pub fn label(id: i64, name: impl Into<String>, frame_type: FrameType) -> Self {
        Self {
            id,
            name: name.into(),
            source: None,
            line: 0,
            column: 0,
            end_line: None,
            end_column: None,
            presentation_hint: Some("label"),
            frame_type,
        }
    }
}

/// Display name of an internal frame.
pub fn internal_frame_name(kind: InternalFrameType) -> &'static str {
    match kind {
        InternalFrameType::M2U => "[Managed to Native Transition]",
        InternalFrameType::U2M => "[Native to Managed Transition]",
        InternalFrameType::AppDomainTransition => "[Appdomain Transition]",
        InternalFrameType::LightweightFunction => "[Lightweight Function]",
        InternalFrameType::FuncEval => "[Function Evaluation]",
        InternalFrameType::InternalCall => "[Internal Call]",
        InternalFrameType::ClassInit => "[Class Initialization]",
        InternalFrameType::Security => "[Security]",
        InternalFrameType::JitCompilation => "[JIT Compilation]",
        InternalFrameType::Exception | InternalFrameType::None => "[Internal Frame]",
    }
}

pub const NATIVE_FRAMES_NAME: &str = "[Native Frames]";

/// Unwinder for unmanaged parts of a stack, used with interop debugging.
pub trait NativeUnwinder: Send + Sync {
    /// Unwind unmanaged chain that begins at `start` until stack pointer reaches `end_sp`
    /// (stack pointer of the next managed frame) or the end of stack if `end_sp` is `None`.
    fn unwind(
        &self,
        thread: &dyn Thread,
        start: CpuContext,
        end_sp: Option<u64>,
    ) -> Result<Vec<NativeFrame>, Error>;
}

/// Internal frames visible in call stacks.
fn is_visible_internal(kind: InternalFrameType) -> bool {
    matches!(
        kind,
        InternalFrameType::M2U
            | InternalFrameType::U2M
            | InternalFrameType::AppDomainTransition
            | InternalFrameType::LightweightFunction
            | InternalFrameType::FuncEval
            | InternalFrameType::InternalCall
            | InternalFrameType::ClassInit
            | InternalFrameType::Security
            | InternalFrameType::JitCompilation
    )
}

macro_rules! emit {
    ($cb: expr, $frame_type: expr, $frame: expr) => {
        if let ControlFlow::Break(()) = ($cb)($frame_type, $frame)? {
            return Ok(ControlFlow::Break(()));
        }
    };
}

struct Walker<'a, F> {
    thread: &'a dyn Thread,
    unwinder: Option<&'a dyn NativeUnwinder>,
    internals: VecDeque<InternalFrame>,
    cb: F,
}

impl<F> Walker<'_, F>
where
    F: FnMut(FrameType, WalkFrame) -> Result<ControlFlow<()>, Error>,
{
    /// Emit internal frames that are closer to the leaf than `sp` (all if `sp` is `None`).
    fn flush_internals(&mut self, sp: Option<u64>) -> Result<ControlFlow<()>, Error> {
        while let Some(internal) = self.internals.front().copied() {
            if sp.map(|sp| internal.address >= sp).unwrap_or(false) {
                break;
            }
            self.internals.pop_front();
            emit!(self.cb, FrameType::ClrInternal, WalkFrame::Internal(internal));
        }
        Ok(ControlFlow::Continue(()))
    }

    fn flush_unmanaged(
        &mut self,
        start: CpuContext,
        end_sp: Option<u64>,
    ) -> Result<ControlFlow<()>, Error> {
        if let ControlFlow::Break(()) = self.flush_internals(Some(start.sp))? {
            return Ok(ControlFlow::Break(()));
        }

        let unwound = self.unwinder.and_then(|unwinder| {
            weak_error!(
                unwinder.unwind(self.thread, start, end_sp),
                "native unwind:"
            )
        });
        match unwound {
            Some(frames) if !frames.is_empty() => {
                for frame in frames {
                    let frame_type = if frame.in_runtime {
                        FrameType::ClrNative
                    } else {
                        FrameType::Native
                    };
                    emit!(self.cb, frame_type, WalkFrame::Native(frame));
                }
            }
            _ => {
                emit!(self.cb, FrameType::Native, WalkFrame::NativeChain);
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn walk(&mut self) -> Result<ControlFlow<()>, Error> {
        let mut stack_walk = self.thread.create_stack_walk()?;
        let mut unmanaged_start: Option<CpuContext> = None;
        let mut is_top = true;

        loop {
            match stack_walk.position()? {
                WalkPosition::Native => {
                    if unmanaged_start.is_none() {
                        unmanaged_start = Some(stack_walk.context()?);
                    }
                }
                WalkPosition::RuntimeUnwindable => {}
                WalkPosition::Managed(frame) => {
                    let mut ctx = stack_walk.context()?;
                    if is_top && ctx.sp != 0 && ctx.fp == 0 {
                        ctx.fp = ctx.sp;
                        stack_walk.set_context(ctx)?;
                        log::trace!(target: "frame", "fix frame pointer of top frame: {:#x}", ctx.sp);
                    }

                    if let Some(start) = unmanaged_start.take() {
                        if let ControlFlow::Break(()) = self.flush_unmanaged(start, Some(ctx.sp))? {
                            return Ok(ControlFlow::Break(()));
                        }
                    }
                    if let ControlFlow::Break(()) = self.flush_internals(Some(ctx.sp))? {
                        return Ok(ControlFlow::Break(()));
                    }

                    let (_, mapping) = frame.ip()?;
                    if matches!(
                        mapping,
                        MappingResult::NoInfo | MappingResult::UnmappedAddress
                    ) {
                        log::trace!(target: "frame", "skip frame without IL mapping ({mapping})");
                    } else {
                        emit!(self.cb, FrameType::ClrManaged, WalkFrame::Managed(frame));
                    }
                }
            }
            is_top = false;

            if !stack_walk.next()? {
                break;
            }
        }

        if let Some(start) = unmanaged_start.take() {
            if let ControlFlow::Break(()) = self.flush_unmanaged(start, None)? {
                return Ok(ControlFlow::Break(()));
            }
        }
        self.flush_internals(None)
    }
}

/// Invoke callback for every visible frame of a thread from innermost to outermost.
///
/// Callback may return [`ControlFlow::Break`] to stop the walk, this is not an error.
/// If `unwinder` is `None` each unmanaged chain collapses into a single
/// [`WalkFrame::NativeChain`] entry.
pub fn walk_frames<F>(
    thread: &dyn Thread,
    unwinder: Option<&dyn NativeUnwinder>,
    cb: F,
) -> Result<(), Error>
where
    F: FnMut(FrameType, WalkFrame) -> Result<ControlFlow<()>, Error>,
{
    let internals = weak_error!(thread.active_internal_frames(), "internal frames:")
        .unwrap_or_default()
        .into_iter()
        .filter(|f| is_visible_internal(f.kind))
        .sorted_by_key(|f| f.address)
        .collect();

    let mut walker = Walker {
        thread,
        unwinder,
        internals,
        cb,
    };
    walker.walk()?;
    Ok(())
}
