use core::{fmt::Write, marker::PhantomData, num::NonZeroU32};

use alloc::{string::String, vec::Vec};
use compact_str::CompactString;

use crate::{max_level, Level, KERNLE_TRACER};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SpanId(NonZeroU32);

impl SpanId {
    pub fn from_non_zero_u32(id: NonZeroU32) -> Self {
        Self(id)
    }

    pub fn to_u32(&self) -> u32 {
        self.0.get()
    }

    pub fn as_slab_index(&self) -> usize {
        self.0.get() as usize - 1
    }
}

/// 可用于 span 宏键值对中值的类型
pub trait Loggable {
    fn log(&self, writer: &mut CompactString);
}

// 要经过这个转一道。
// 无法 impl<T: Display> Loggable for T 后再去给其他上游类型 impl Loggable 因为上游随时可能为该类型实现 Display，导致冲突
trait SpecDisplay: core::fmt::Display {}

macro_rules! mydisplay_impl {
    ($($t:tt)*) => ($(
        impl SpecDisplay for $t {}
    )*);
}

mydisplay_impl!(u8 u16 u32 u64 usize i8 i16 i32 i64 isize bool str char String CompactString);

impl<T: SpecDisplay + ?Sized> Loggable for T {
    fn log(&self, writer: &mut CompactString) {
        let _ = write!(writer, "{self}");
    }
}

impl<T: SpecDisplay + ?Sized> SpecDisplay for &T {}

impl<T: SpecDisplay> Loggable for [T] {
    fn log(&self, writer: &mut CompactString) {
        writer.push('[');
        let mut rest = false;
        for t in self {
            if rest {
                writer.push_str(", ");
            }
            let _ = write!(writer, "{t}");
            rest = true;
        }
        writer.push(']');
    }
}

impl<T: SpecDisplay> Loggable for Vec<T> {
    fn log(&self, writer: &mut CompactString) {
        self.as_slice().log(writer);
    }
}

/// 一个 span 的静态信息，由 tracer 保存
#[derive(Debug)]
pub struct SpanAttr {
    level: Level,
    name: &'static str,
    kvs: Option<CompactString>,
}

impl SpanAttr {
    pub fn level(&self) -> Level {
        self.level
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kvs(&self) -> Option<&str> {
        self.kvs.as_deref()
    }
}

pub struct Span {
    id: Option<SpanId>,
}

impl Span {
    /// 创建一个新的 span。但只是将其注册，而没有实际实际启用。
    ///
    /// 调用 `entered()` 以进入该 span
    pub fn new<'a>(
        level: Level,
        name: &'static str,
        kvs: Option<&'a [(&'static str, &'a dyn Loggable)]>,
    ) -> Self {
        if level > max_level() {
            return Self::disabled();
        }
        let Some(tracer) = KERNLE_TRACER.get() else {
            return Self::disabled();
        };
        let kvs = kvs.filter(|kvs| !kvs.is_empty()).map(|kvs| {
            let mut kvs_str = CompactString::new("");
            for (i, (key, value)) in kvs.iter().enumerate() {
                if i != 0 {
                    kvs_str.push(' ');
                }
                kvs_str.push_str(key);
                kvs_str.push('=');
                value.log(&mut kvs_str);
            }
            kvs_str
        });
        let id = tracer.new_span(SpanAttr { level, name, kvs });
        Span { id: Some(id) }
    }

    pub fn disabled() -> Self {
        Self { id: None }
    }

    pub fn entered(self) -> OwnedEnterGuard {
        if let (Some(id), Some(tracer)) = (&self.id, KERNLE_TRACER.get()) {
            tracer.enter(id);
        }
        OwnedEnterGuard {
            span: self,
            _not_send: PhantomData,
        }
    }
}

impl Drop for Span {
    #[inline]
    fn drop(&mut self) {
        if let (Some(id), Some(tracer)) = (self.id.take(), KERNLE_TRACER.get()) {
            tracer.drop_span(id);
        }
    }
}

#[must_use = "once a span has been entered, it should be exited"]
pub struct OwnedEnterGuard {
    span: Span,
    _not_send: PhantomData<*const ()>,
}

impl Drop for OwnedEnterGuard {
    fn drop(&mut self) {
        if let (Some(id), Some(tracer)) = (&self.span.id, KERNLE_TRACER.get()) {
            tracer.exit(id);
        }
    }
}
