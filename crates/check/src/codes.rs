//! Per-file status codes
//!
//! A closed, totally ordered set of codes describing the health of one
//! database file, usable directly as a process exit code: 0 is healthy,
//! engine error codes sit in one range, signal-derived codes (from a
//! diagnosis child that died abnormally) in another, and OS errno values
//! are shifted above [`CheckCode::MAX`].

use fleetstate_core::Error;

/// Status of one diagnosed database file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckCode {
    Ok,
    /// The file (or its symlink target) does not exist; the agent will
    /// recreate it
    OkDoesNotExist,

    // Engine error range
    EngineKeyExists,
    EngineKeyNotFound,
    EnginePageNotFound,
    EngineCorruptPage,
    EnginePanic,
    EngineVersionMismatch,
    EngineInvalidDatabase,
    EngineMapFull,
    EngineDbsFull,
    EngineReadersFull,
    EngineTxnFull,
    EngineCursorStackTooDeep,
    EngineMapResized,
    EngineIncompatible,
    EngineBadTxn,
    EngineBadValueSize,

    /// The validator accumulated at least one defect
    ValidateFailed,
    /// Forked diagnosis child could not be waited for
    PidError,

    // Signal range: the diagnosis child died from a signal
    SignalHangup,
    SignalInterrupt,
    SignalQuit,
    SignalIllegalInstruction,
    SignalTrap,
    SignalAbort,
    SignalFloatingPointException,
    SignalKill,
    SignalBusError,
    SignalSegfault,
    SignalBadSyscall,
    SignalBrokenPipe,
    SignalAlarm,
    SignalTerminate,
    SignalOther,

    Unknown,

    /// Raw OS errno, shifted above [`CheckCode::MAX`]
    SystemError(i32),
}

impl CheckCode {
    /// Codes below this are the named set; higher exit codes encode an
    /// errno as `MAX + errno`.
    pub const MAX: i32 = 38;

    /// The process-exit encoding of this code
    pub fn exit_code(self) -> i32 {
        use CheckCode::*;
        match self {
            Ok => 0,
            OkDoesNotExist => 1,
            EngineKeyExists => 2,
            EngineKeyNotFound => 3,
            EnginePageNotFound => 4,
            EngineCorruptPage => 5,
            EnginePanic => 6,
            EngineVersionMismatch => 7,
            EngineInvalidDatabase => 8,
            EngineMapFull => 9,
            EngineDbsFull => 10,
            EngineReadersFull => 11,
            EngineTxnFull => 12,
            EngineCursorStackTooDeep => 13,
            EngineMapResized => 14,
            EngineIncompatible => 15,
            EngineBadTxn => 16,
            EngineBadValueSize => 17,
            ValidateFailed => 18,
            PidError => 19,
            SignalHangup => 20,
            SignalInterrupt => 21,
            SignalQuit => 22,
            SignalIllegalInstruction => 23,
            SignalTrap => 24,
            SignalAbort => 25,
            SignalFloatingPointException => 26,
            SignalKill => 27,
            SignalBusError => 28,
            SignalSegfault => 29,
            SignalBadSyscall => 30,
            SignalBrokenPipe => 31,
            SignalAlarm => 32,
            SignalTerminate => 33,
            SignalOther => 34,
            Unknown => 35,
            SystemError(errno) => Self::MAX + errno,
        }
    }

    /// Decode the exit status of a diagnosis child
    pub fn from_exit(code: i32) -> CheckCode {
        use CheckCode::*;
        match code {
            0 => Ok,
            1 => OkDoesNotExist,
            2 => EngineKeyExists,
            3 => EngineKeyNotFound,
            4 => EnginePageNotFound,
            5 => EngineCorruptPage,
            6 => EnginePanic,
            7 => EngineVersionMismatch,
            8 => EngineInvalidDatabase,
            9 => EngineMapFull,
            10 => EngineDbsFull,
            11 => EngineReadersFull,
            12 => EngineTxnFull,
            13 => EngineCursorStackTooDeep,
            14 => EngineMapResized,
            15 => EngineIncompatible,
            16 => EngineBadTxn,
            17 => EngineBadValueSize,
            18 => ValidateFailed,
            19 => PidError,
            20 => SignalHangup,
            21 => SignalInterrupt,
            22 => SignalQuit,
            23 => SignalIllegalInstruction,
            24 => SignalTrap,
            25 => SignalAbort,
            26 => SignalFloatingPointException,
            27 => SignalKill,
            28 => SignalBusError,
            29 => SignalSegfault,
            30 => SignalBadSyscall,
            31 => SignalBrokenPipe,
            32 => SignalAlarm,
            33 => SignalTerminate,
            34 => SignalOther,
            35 => Unknown,
            errno if errno > Self::MAX => SystemError(errno - Self::MAX),
            _ => Unknown,
        }
    }

    /// Map a store-layer error to its status code
    pub fn from_error(err: &Error) -> CheckCode {
        match err {
            Error::NotFound => CheckCode::EngineKeyNotFound,
            Error::Corrupt { .. } | Error::PermanentCorrupt { .. } => CheckCode::EngineCorruptPage,
            Error::MapFull { .. } => CheckCode::EngineMapFull,
            Error::TxnFull => CheckCode::EngineTxnFull,
            Error::ReadersFull => CheckCode::EngineReadersFull,
            Error::DbsFull => CheckCode::EngineDbsFull,
            Error::CursorFull => CheckCode::EngineCursorStackTooDeep,
            Error::BadTxn => CheckCode::EngineBadTxn,
            Error::VersionMismatch => CheckCode::EngineVersionMismatch,
            Error::Incompatible => CheckCode::EngineIncompatible,
            Error::KeyTooLarge { .. } | Error::ValueTooLarge { .. } => {
                CheckCode::EngineBadValueSize
            }
            Error::ValidateFailed { .. } => CheckCode::ValidateFailed,
            Error::Io { source, .. } => match source.raw_os_error() {
                Some(errno) if errno > 0 => CheckCode::SystemError(errno),
                _ => CheckCode::Unknown,
            },
            _ => CheckCode::Unknown,
        }
    }

    #[cfg(unix)]
    pub fn from_signal(signal: nix::sys::signal::Signal) -> CheckCode {
        use nix::sys::signal::Signal::*;
        match signal {
            SIGHUP => CheckCode::SignalHangup,
            SIGINT => CheckCode::SignalInterrupt,
            SIGQUIT => CheckCode::SignalQuit,
            SIGILL => CheckCode::SignalIllegalInstruction,
            SIGTRAP => CheckCode::SignalTrap,
            SIGABRT => CheckCode::SignalAbort,
            SIGFPE => CheckCode::SignalFloatingPointException,
            SIGKILL => CheckCode::SignalKill,
            SIGBUS => CheckCode::SignalBusError,
            SIGSEGV => CheckCode::SignalSegfault,
            SIGSYS => CheckCode::SignalBadSyscall,
            SIGPIPE => CheckCode::SignalBrokenPipe,
            SIGALRM => CheckCode::SignalAlarm,
            SIGTERM => CheckCode::SignalTerminate,
            _ => CheckCode::SignalOther,
        }
    }

    /// Healthy codes do not count towards the corruption total
    pub fn is_healthy(self) -> bool {
        matches!(self, CheckCode::Ok | CheckCode::OkDoesNotExist)
    }

    /// Name printed in per-file status lines
    pub fn name(self) -> String {
        use CheckCode::*;
        let name = match self {
            Ok => "OK",
            OkDoesNotExist => "OK_DOES_NOT_EXIST",
            EngineKeyExists => "ENGINE_KEY_EXISTS",
            EngineKeyNotFound => "ENGINE_KEY_NOT_FOUND",
            EnginePageNotFound => "ENGINE_PAGE_NOT_FOUND",
            EngineCorruptPage => "ENGINE_CORRUPT_PAGE",
            EnginePanic => "ENGINE_PANIC_FATAL_ERROR",
            EngineVersionMismatch => "ENGINE_VERSION_MISMATCH",
            EngineInvalidDatabase => "ENGINE_INVALID_DATABASE",
            EngineMapFull => "ENGINE_MAP_FULL",
            EngineDbsFull => "ENGINE_DBS_FULL",
            EngineReadersFull => "ENGINE_READERS_FULL",
            EngineTxnFull => "ENGINE_TRANSACTION_FULL",
            EngineCursorStackTooDeep => "ENGINE_CURSOR_STACK_TOO_DEEP",
            EngineMapResized => "ENGINE_MAP_RESIZE_BEYOND_SIZE",
            EngineIncompatible => "ENGINE_INCOMPATIBLE_OPERATION",
            EngineBadTxn => "ENGINE_BAD_OR_INVALID_TRANSACTION",
            EngineBadValueSize => "ENGINE_WRONG_KEY_OR_VALUE_SIZE",
            ValidateFailed => "VALIDATE_FAILED",
            PidError => "PID_ERROR",
            SignalHangup => "SIGNAL_HANGUP",
            SignalInterrupt => "SIGNAL_INTERRUPT",
            SignalQuit => "SIGNAL_QUIT",
            SignalIllegalInstruction => "SIGNAL_ILLEGAL_INSTRUCTION",
            SignalTrap => "SIGNAL_TRACE_TRAP",
            SignalAbort => "SIGNAL_ABORT",
            SignalFloatingPointException => "SIGNAL_FLOATING_POINT_EXCEPTION",
            SignalKill => "SIGNAL_KILL",
            SignalBusError => "SIGNAL_BUS_ERROR",
            SignalSegfault => "SIGNAL_SEGFAULT",
            SignalBadSyscall => "SIGNAL_NON_EXISTENT_SYSCALL",
            SignalBrokenPipe => "SIGNAL_INVALID_PIPE",
            SignalAlarm => "SIGNAL_TIMER_EXPIRED",
            SignalTerminate => "SIGNAL_TERMINATE",
            SignalOther => "SIGNAL_OTHER",
            Unknown => "UNKNOWN",
            SystemError(errno) => {
                let detail = std::io::Error::from_raw_os_error(errno);
                return format!("SYSTEM_ERROR {errno} - {detail}");
            }
        };
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn exit_codes_roundtrip() {
        for code in [
            CheckCode::Ok,
            CheckCode::OkDoesNotExist,
            CheckCode::EngineCorruptPage,
            CheckCode::ValidateFailed,
            CheckCode::SignalSegfault,
            CheckCode::Unknown,
            CheckCode::SystemError(13),
        ] {
            assert_eq!(CheckCode::from_exit(code.exit_code()), code);
        }
    }

    #[test]
    fn errno_is_shifted_above_the_named_range() {
        let code = CheckCode::SystemError(2);
        assert!(code.exit_code() > CheckCode::MAX);
        assert!(code.name().starts_with("SYSTEM_ERROR 2"));
    }

    #[test]
    fn healthy_codes() {
        assert!(CheckCode::Ok.is_healthy());
        assert!(CheckCode::OkDoesNotExist.is_healthy());
        assert!(!CheckCode::SignalSegfault.is_healthy());
        assert!(!CheckCode::ValidateFailed.is_healthy());
    }

    #[test]
    fn error_mapping() {
        assert_eq!(
            CheckCode::from_error(&Error::Corrupt {
                path: PathBuf::from("x"),
                message: "bad".into()
            }),
            CheckCode::EngineCorruptPage
        );
        assert_eq!(
            CheckCode::from_error(&Error::ValidateFailed { errors: 3 }),
            CheckCode::ValidateFailed
        );
        let io = Error::io(
            "open",
            std::io::Error::from_raw_os_error(13),
        );
        assert_eq!(CheckCode::from_error(&io), CheckCode::SystemError(13));
    }

    #[cfg(unix)]
    #[test]
    fn signal_mapping() {
        use nix::sys::signal::Signal;
        assert_eq!(
            CheckCode::from_signal(Signal::SIGSEGV),
            CheckCode::SignalSegfault
        );
        assert_eq!(
            CheckCode::from_signal(Signal::SIGWINCH),
            CheckCode::SignalOther
        );
    }
}
