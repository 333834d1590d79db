//! Raw-mode console input for interactive mode.
//!
//! Puts stdin into raw mode (input side only, so output newline handling
//! stays intact) and pumps bytes from a reader thread over a channel. The
//! original terminal attributes are restored on drop.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

pub struct Console {
    rx: mpsc::Receiver<u8>,
    original_termios: Option<libc::termios>,
    running: Arc<AtomicBool>,
}

impl Console {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let reader_running = running.clone();

        let mut original_termios = None;
        if unsafe { libc::isatty(libc::STDIN_FILENO) } == 1 {
            let mut termios: libc::termios = unsafe { std::mem::zeroed() };
            if unsafe { libc::tcgetattr(libc::STDIN_FILENO, &mut termios) } == 0 {
                original_termios = Some(termios);
                let mut raw = termios;
                // disable echo/canonical mode/signals on input; keep OPOST
                // so '\n' still moves the cursor to column 0 on output
                raw.c_iflag &=
                    !(libc::BRKINT | libc::ICRNL | libc::INPCK | libc::ISTRIP | libc::IXON);
                raw.c_lflag &= !(libc::ECHO | libc::ICANON | libc::ISIG | libc::IEXTEN);
                raw.c_cflag |= libc::CS8;
                raw.c_cc[libc::VMIN] = 0;
                raw.c_cc[libc::VTIME] = 0;
                unsafe {
                    libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw);
                }
            }
        }

        thread::spawn(move || {
            let stdin = io::stdin();
            let mut handle = stdin.lock();
            let mut buf = [0u8; 1];
            while reader_running.load(Ordering::Relaxed) {
                if handle.read_exact(&mut buf).is_ok() {
                    if tx.send(buf[0]).is_err() {
                        break;
                    }
                } else {
                    break;
                }
            }
        });

        Self {
            rx,
            original_termios,
            running,
        }
    }

    /// Non-blocking poll for one input byte.
    pub fn poll(&self) -> Option<u8> {
        self.rx.try_recv().ok()
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(termios) = self.original_termios {
            unsafe {
                libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &termios);
            }
        }
    }
}
