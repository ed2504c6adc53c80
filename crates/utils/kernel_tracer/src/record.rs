use core::fmt::Arguments;

use crate::Level;

/// 一条日志
#[derive(Clone, Debug)]
pub struct Record<'a> {
    level: Level,
    /// 发出日志的模块路径
    target: &'static str,
    args: Arguments<'a>,
}

impl<'a> Record<'a> {
    pub fn new(level: Level, target: &'static str, args: Arguments<'a>) -> Self {
        Self {
            level,
            target,
            args,
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn target(&self) -> &'static str {
        self.target
    }

    pub fn args(&self) -> &Arguments<'a> {
        &self.args
    }
}
