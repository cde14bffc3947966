use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::port::Port;

/// 16550 UART on the standard COM1 ports. This is the kernel console: all
/// log output and panic reports go through it.
pub struct SerialPort {
    data: Port<u8>,
    int_en: Port<u8>,
    fifo_ctrl: Port<u8>,
    line_ctrl: Port<u8>,
    modem_ctrl: Port<u8>,
    line_sts: Port<u8>,
}

impl SerialPort {
    pub const unsafe fn new(base: u16) -> SerialPort {
        SerialPort {
            data: Port::new(base),
            int_en: Port::new(base + 1),
            fifo_ctrl: Port::new(base + 2),
            line_ctrl: Port::new(base + 3),
            modem_ctrl: Port::new(base + 4),
            line_sts: Port::new(base + 5),
        }
    }

    /// 38400 8N1, FIFOs on, interrupts off: the console is polled so it
    /// stays usable from fault handlers and the panic path.
    pub fn init(&mut self) {
        unsafe {
            self.int_en.write(0x00);
            self.line_ctrl.write(0x80);
            self.data.write(0x03);
            self.int_en.write(0x00);
            self.line_ctrl.write(0x03);
            self.fifo_ctrl.write(0xC7);
            self.modem_ctrl.write(0x0B);
        }
    }

    fn wait_for_tx_empty(&mut self) {
        unsafe {
            while (self.line_sts.read() & 0x20) == 0 {}
        }
    }

    pub fn send(&mut self, byte: u8) {
        self.wait_for_tx_empty();
        unsafe {
            self.data.write(byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.send(b'\r');
            }
            self.send(byte);
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref CONSOLE: Mutex<SerialPort> = {
        let mut port = unsafe { SerialPort::new(0x3F8) };
        port.init();
        Mutex::new(port)
    };
}

/// Log severities, numbered like the classic Unix syslog levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Emergency = 1,
    Alert = 2,
    Critical = 3,
    Error = 4,
    Warning = 5,
    Notice = 6,
    Info = 7,
    Debug = 8,
}

impl LogLevel {
    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Emergency => "EMERG",
            LogLevel::Alert => "ALERT",
            LogLevel::Critical => "CRIT",
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARN",
            LogLevel::Notice => "NOTICE",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Messages above this level are dropped at the logging entry point.
pub const MAX_LOG_LEVEL: LogLevel = LogLevel::Info;

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    // Logging from interrupt handlers must not deadlock against a thread
    // already holding the console.
    x86_64::instructions::interrupts::without_interrupts(|| {
        CONSOLE.lock().write_fmt(args).expect("Printing to serial failed");
    });
}

#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments) {
    if level <= MAX_LOG_LEVEL {
        _print(format_args!("[{}] {}\n", level.label(), args));
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => { $crate::print!("\n") };
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

#[macro_export]
macro_rules! log_emerg {
    ($($arg:tt)*) => {
        $crate::serial::_log($crate::serial::LogLevel::Emergency, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_alert {
    ($($arg:tt)*) => {
        $crate::serial::_log($crate::serial::LogLevel::Alert, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_crit {
    ($($arg:tt)*) => {
        $crate::serial::_log($crate::serial::LogLevel::Critical, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::serial::_log($crate::serial::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::serial::_log($crate::serial::LogLevel::Warning, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_notice {
    ($($arg:tt)*) => {
        $crate::serial::_log($crate::serial::LogLevel::Notice, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::serial::_log($crate::serial::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::serial::_log($crate::serial::LogLevel::Debug, format_args!($($arg)*))
    };
}

pub fn init() {
    // Force the lazy static so the port is programmed before first use.
    let _ = CONSOLE.lock();
}
