use clap::Parser;
use mcu_vm::console::Console;
use mcu_vm::emulator::{Emulator, TestStatus, CYCLES_PER_FRAME, CYCLES_PER_MS};
use std::cell::RefCell;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Duration;

/// Cycle budget when no explicit timeout is given.
const DEFAULT_MAX_CYCLES: u64 = 100_000_000;

#[derive(Parser, Debug)]
#[command(author, version, about = "RV32IMAC microcontroller platform emulator", long_about = None)]
struct Args {
    /// Firmware image for interactive mode
    firmware: Option<PathBuf>,

    /// Run without a window; the UART is wired to stdio
    #[arg(long, value_name = "FIRMWARE")]
    headless: Option<PathBuf>,

    /// Inject a single command line followed by "exit" (headless)
    #[arg(long, value_name = "LINE")]
    cmd: Option<String>,

    /// Read commands from stdin and append "exit" (headless)
    #[arg(long)]
    batch: bool,

    /// Timeout in milliseconds at the nominal 144 MHz clock (headless)
    #[arg(long, value_name = "MS")]
    timeout: Option<u64>,

    /// Write a PPM screenshot of the framebuffer on exit (headless)
    #[arg(long, value_name = "PATH")]
    screenshot: Option<PathBuf>,

    /// Recursively run every *.bin under a directory as a test
    #[arg(long, value_name = "DIR")]
    run_tests: Option<PathBuf>,

    /// Run a single test binary
    #[arg(long, value_name = "FILE")]
    test: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    if let Some(dir) = &args.run_tests {
        return run_tests(dir);
    }
    if let Some(file) = &args.test {
        return if run_test(file) {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }
    if let Some(firmware) = &args.headless {
        return run_headless(
            firmware,
            args.cmd.as_deref(),
            args.batch,
            args.timeout,
            args.screenshot.as_deref(),
        );
    }
    if let Some(firmware) = &args.firmware {
        return run_interactive(firmware);
    }

    eprintln!("error: no firmware given (see --help)");
    ExitCode::FAILURE
}

/// Execute one test binary against the riscv-tests ecall convention.
fn run_test(path: &Path) -> bool {
    let mut emu = Emulator::new();

    // capture UART traffic so failures can show guest diagnostics
    let output = Rc::new(RefCell::new(String::new()));
    {
        let sink = output.clone();
        emu.uart
            .borrow_mut()
            .set_output(move |byte| sink.borrow_mut().push(byte as char));
    }

    if let Err(err) = emu.load_firmware(path) {
        eprintln!("{err}");
        return false;
    }

    while emu.cpu.cycles < DEFAULT_MAX_CYCLES && !emu.cpu.halted {
        emu.step();

        match emu.test_probe() {
            TestStatus::Running => {}
            TestStatus::Pass => {
                println!("PASS: {}", path.display());
                return true;
            }
            TestStatus::Fail(test_num) => {
                println!("FAIL: {} (test #{test_num})", path.display());
                if !output.borrow().is_empty() {
                    println!("UART output: {}", output.borrow());
                }
                return false;
            }
            TestStatus::Unknown => {
                println!("UNKNOWN: {} (ecall outside the test protocol)", path.display());
                return false;
            }
        }
    }

    println!("TIMEOUT: {}", path.display());
    false
}

/// Recursively collect *.bin files, skipping disassembly dumps.
fn collect_test_binaries(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_test_binaries(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "bin") {
            let name = path.file_name().unwrap_or_default().to_string_lossy();
            if !name.contains(".dump") {
                out.push(path);
            }
        }
    }
}

fn run_tests(dir: &Path) -> ExitCode {
    let mut test_files = Vec::new();
    collect_test_binaries(dir, &mut test_files);

    if test_files.is_empty() {
        eprintln!("no test files found in: {}", dir.display());
        return ExitCode::FAILURE;
    }
    test_files.sort();

    let mut passed = 0;
    let mut failed = 0;
    for path in &test_files {
        if run_test(path) {
            passed += 1;
        } else {
            failed += 1;
        }
    }

    println!();
    println!("=== Results ===");
    println!("Passed: {passed}");
    println!("Failed: {failed}");
    println!("Total:  {}", passed + failed);

    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run_headless(
    firmware: &Path,
    cmd: Option<&str>,
    batch: bool,
    timeout_ms: Option<u64>,
    screenshot: Option<&Path>,
) -> ExitCode {
    let mut emu = Emulator::new();

    if let Err(err) = emu.load_firmware(firmware) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    if let Some(line) = cmd {
        let mut uart = emu.uart.borrow_mut();
        uart.queue_str(line);
        uart.queue_str("\nexit\n");
    } else if batch {
        let mut input = String::new();
        if std::io::stdin().read_to_string(&mut input).is_ok() && !input.is_empty() {
            let mut uart = emu.uart.borrow_mut();
            uart.queue_str(&input);
            uart.queue_str("exit\n");
        }
    }

    let max_cycles = timeout_ms.map_or(DEFAULT_MAX_CYCLES, |ms| ms * CYCLES_PER_MS);

    while emu.cpu.cycles < max_cycles && !emu.cpu.halted {
        emu.step();
        if emu.reached_ecall() {
            break;
        }
        if emu.cpu.wfi {
            // asleep: let the wall clock advance without burning the host
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    if emu.cpu.cycles >= max_cycles {
        if let Some(ms) = timeout_ms {
            eprintln!();
            eprintln!("timeout after {ms} ms");
        }
    }

    if let Some(path) = screenshot {
        if let Err(err) = emu.write_screenshot(path) {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}

fn run_interactive(firmware: &Path) -> ExitCode {
    let mut emu = Emulator::new();

    if let Err(err) = emu.load_firmware(firmware) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    println!("mcu-vm");
    println!("firmware: {}", firmware.display());
    println!("running (Ctrl-A x to quit)");

    let console = Console::new();
    let mut escaped = false;

    loop {
        // Ctrl-A is the escape prefix: "x" quits, Ctrl-A Ctrl-A sends a
        // literal Ctrl-A, anything else is passed through
        while let Some(byte) = console.poll() {
            if escaped {
                if byte == b'x' {
                    println!();
                    println!("terminated by user");
                    return ExitCode::SUCCESS;
                }
                emu.uart.borrow_mut().queue_input(byte);
                escaped = false;
            } else if byte == 0x01 {
                escaped = true;
            } else {
                emu.uart.borrow_mut().queue_input(byte);
            }
        }

        emu.run(CYCLES_PER_FRAME);

        if emu.reached_ecall() {
            println!();
            println!(
                "ecall at pc={:#010x}, a0={}",
                emu.cpu.mepc,
                emu.cpu.reg(10)
            );
            break;
        }
        if emu.cpu.halted {
            break;
        }

        std::thread::sleep(Duration::from_millis(16));
    }

    println!("stopped after {} cycles", emu.cpu.cycles);
    ExitCode::SUCCESS
}
