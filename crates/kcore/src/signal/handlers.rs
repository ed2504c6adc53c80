use defines::signal::{KSignalAction, Signal, NSIG};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefaultHandler {
    Terminate,
    Ignore,
    CoreDump,
    Stop,
    Continue,
}

impl DefaultHandler {
    pub fn new(signal: Signal) -> Self {
        #[allow(clippy::enum_glob_use)]
        use Signal::*;
        match signal {
            SIGABRT | SIGBUS | SIGFPE | SIGILL | SIGQUIT | SIGSEGV | SIGSYS | SIGTRAP | SIGXCPU
            | SIGXFSZ => DefaultHandler::CoreDump,
            SIGCHLD | SIGURG | SIGWINCH | SIGPWR => DefaultHandler::Ignore,
            SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultHandler::Stop,
            SIGCONT => DefaultHandler::Continue,
            _ => DefaultHandler::Terminate,
        }
    }
}

/// 由进程持有，`fork` 时复制
#[derive(Clone)]
pub struct SignalHandlers {
    actions: [KSignalAction; NSIG],
}

impl SignalHandlers {
    pub const fn new() -> Self {
        const DEFAULT_ACTION: KSignalAction = KSignalAction::new();
        Self {
            actions: [DEFAULT_ACTION; NSIG],
        }
    }

    pub fn action(&self, signal: Signal) -> &KSignalAction {
        &self.actions[signal.index()]
    }

    pub fn action_mut(&mut self, signal: Signal) -> &mut KSignalAction {
        &mut self.actions[signal.index()]
    }
}

impl Default for SignalHandlers {
    fn default() -> Self {
        Self::new()
    }
}
