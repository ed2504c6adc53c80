use core::{
    cmp::Ordering,
    fmt,
    sync::atomic::{AtomicU8, Ordering as AtomicOrdering},
};

static LEVEL_NAMES: [&str; 6] = ["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"];

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum Level {
    Error = 1,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        LEVEL_NAMES[self as usize]
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// 日志等级的上限，`Off` 表示什么都不输出
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum LevelFilter {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LevelFilter {
    const ALL: [Self; 6] = [
        Self::Off,
        Self::Error,
        Self::Warn,
        Self::Info,
        Self::Debug,
        Self::Trace,
    ];

    pub fn as_str(self) -> &'static str {
        LEVEL_NAMES[self as usize]
    }

    /// 不区分大小写地解析等级名
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|filter| filter.as_str().eq_ignore_ascii_case(name.trim()))
    }

    fn from_u8(raw: u8) -> Self {
        Self::ALL.get(raw as usize).copied().unwrap_or(Self::Off)
    }
}

impl fmt::Display for LevelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl PartialEq<LevelFilter> for Level {
    fn eq(&self, other: &LevelFilter) -> bool {
        *self as u8 == *other as u8
    }
}

impl PartialOrd<LevelFilter> for Level {
    fn partial_cmp(&self, other: &LevelFilter) -> Option<Ordering> {
        (*self as u8).partial_cmp(&(*other as u8))
    }
}

/// 编译期由环境变量 `KERNEL_CLOG` 给出的初始等级，默认只输出警告与错误
const INITIAL_LEVEL: LevelFilter = match option_env!("KERNEL_CLOG") {
    Some(name) => match name.as_bytes() {
        b"TRACE" | b"trace" => LevelFilter::Trace,
        b"DEBUG" | b"debug" => LevelFilter::Debug,
        b"INFO" | b"info" => LevelFilter::Info,
        b"ERROR" | b"error" => LevelFilter::Error,
        b"OFF" | b"off" => LevelFilter::Off,
        _ => LevelFilter::Warn,
    },
    None => LevelFilter::Warn,
};

static MAX_LEVEL: AtomicU8 = AtomicU8::new(INITIAL_LEVEL as u8);

/// 运行时调整日志等级
pub fn set_max_level(filter: LevelFilter) {
    MAX_LEVEL.store(filter as u8, AtomicOrdering::Relaxed);
}

pub fn max_level() -> LevelFilter {
    LevelFilter::from_u8(MAX_LEVEL.load(AtomicOrdering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_compare_against_filters() {
        assert!(Level::Error <= LevelFilter::Warn);
        assert!(Level::Debug > LevelFilter::Info);
        assert!(Level::Error > LevelFilter::Off);
        assert!(Level::Trace == LevelFilter::Trace);
    }

    #[test]
    fn parse_ignores_case() {
        assert_eq!(LevelFilter::parse("debug"), Some(LevelFilter::Debug));
        assert_eq!(LevelFilter::parse(" Trace "), Some(LevelFilter::Trace));
        assert_eq!(LevelFilter::parse("verbose"), None);
        assert_eq!(format!("{:>5}", Level::Warn), " WARN");
    }
}
