//! 默认的 tracer 实现，日志输出到 stderr
//!
//! span 的静态信息存放在全局的 slab 中，而进入的 span 栈是每个宿主线程（即每个核）私有的

use core::{cell::RefCell, fmt, num::NonZeroU32};
use std::io::Write as _;

use anstyle::{AnsiColor, Reset, Style};
use kernel_tracer::{Level, LevelFilter, Record, SpanAttr, SpanId, Tracer};
use klocks::{Lazy, SpinMutex};
use slab::Slab;

static STDERR_TRACER: Lazy<StderrTracer> = Lazy::new(|| StderrTracer {
    slab: SpinMutex::new(Slab::with_capacity(64)),
});

std::thread_local! {
    static SPAN_STACK: RefCell<Vec<SpanId>> = const { RefCell::new(Vec::new()) };
}

/// 注册全局 tracer，可重复调用。环境变量 `KERNEL_CLOG` 可以在运行时覆盖日志等级
pub fn init() {
    if let Some(filter) = std::env::var("KERNEL_CLOG")
        .ok()
        .and_then(|name| LevelFilter::parse(&name))
    {
        kernel_tracer::set_max_level(filter);
    }
    kernel_tracer::init(&*STDERR_TRACER);
}

struct StderrTracer {
    slab: SpinMutex<Slab<SpanAttr>>,
}

impl Tracer for StderrTracer {
    fn log(&self, record: &Record<'_>) {
        let mut line = String::with_capacity(128);
        if self.write_log(&mut line, record).is_ok() {
            let _ = std::io::stderr().lock().write_all(line.as_bytes());
        }
    }

    fn new_span(&self, span_attr: SpanAttr) -> SpanId {
        let id = self.slab.lock().insert(span_attr);
        let id = NonZeroU32::new(id as u32 + 1).expect("slab index plus one is never zero");
        SpanId::from_non_zero_u32(id)
    }

    fn enter(&self, span_id: &SpanId) {
        SPAN_STACK.with_borrow_mut(|stack| stack.push(span_id.clone()));
    }

    fn exit(&self, span_id: &SpanId) {
        let exited = SPAN_STACK.with_borrow_mut(Vec::pop);
        // 维持一个栈结构，因此退出的 id 应当与进入的 id 保持一致
        debug_assert_eq!(exited.as_ref(), Some(span_id));
    }

    fn drop_span(&self, span_id: SpanId) {
        self.slab.lock().remove(span_id.as_slab_index());
    }
}

impl StderrTracer {
    fn write_log(&self, writer: &mut impl fmt::Write, record: &Record<'_>) -> fmt::Result {
        // 开头部分，即日志级别，如 `[ INFO]`
        let color = match record.level() {
            Level::Error => AnsiColor::Red,
            Level::Warn => AnsiColor::BrightYellow,
            Level::Info => AnsiColor::Blue,
            Level::Debug => AnsiColor::Green,
            Level::Trace => AnsiColor::BrightBlack,
        };
        write!(
            writer,
            "{}[{:>5}]{}",
            color.render_fg(),
            record.level(),
            Reset.render()
        )?;

        // Span 栈部分
        const SPAN_NAME_COLOR: Style = AnsiColor::White.on_default().bold();
        let has_span = SPAN_STACK.with_borrow(|stack| -> Result<bool, fmt::Error> {
            let slab = self.slab.lock();
            for id in stack {
                let Some(span_attr) = slab.get(id.as_slab_index()) else {
                    continue;
                };
                write!(
                    writer,
                    "-{}{}{}",
                    SPAN_NAME_COLOR.render(),
                    span_attr.name(),
                    Reset.render()
                )?;
                if let Some(kvs) = span_attr.kvs() {
                    write!(writer, "{{{kvs}}}")?;
                }
            }
            Ok(!stack.is_empty())
        })?;
        writer.write_str(if has_span { ": " } else { " " })?;

        // 模块路径去掉 crate 名
        let target = record.target();
        let target = target.split_once("::").map_or(target, |(_, rest)| rest);
        const TARGET_COLOR: Style = AnsiColor::BrightBlack.on_default();
        write!(writer, "{}{target}{} ", TARGET_COLOR.render(), Reset.render())?;

        // 日志信息部分
        writeln!(writer, "{}", record.args())
    }
}
