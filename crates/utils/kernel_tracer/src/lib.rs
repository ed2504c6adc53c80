#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
mod macros;
mod level;
mod record;
mod span;

pub use level::{max_level, set_max_level, Level, LevelFilter};
pub use record::Record;
pub use span::{Loggable, OwnedEnterGuard, Span, SpanAttr, SpanId};

use klocks::Once;

/// 日志的实际输出由使用者决定，通过 [`init`] 注册
pub static KERNLE_TRACER: Once<&'static dyn Tracer> = Once::new();

pub trait Tracer: Send + Sync {
    fn log(&self, record: &Record<'_>);
    fn new_span(&self, span_attr: SpanAttr) -> SpanId;
    fn enter(&self, span_id: &SpanId);
    fn exit(&self, span_id: &SpanId);
    fn drop_span(&self, span_id: SpanId);
}

/// 注册全局 tracer。只有第一次调用生效
pub fn init(tracer: &'static dyn Tracer) {
    KERNLE_TRACER.call_once(|| tracer);
}

#[inline]
#[doc(hidden)]
pub fn log_impl(level: Level, target: &'static str, args: core::fmt::Arguments<'_>) {
    if level > max_level() {
        return;
    }
    if let Some(tracer) = KERNLE_TRACER.get() {
        tracer.log(&Record::new(level, target, args));
    }
}
