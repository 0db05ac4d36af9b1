// main.rs - Interactive shell for the Ember VM

use ember::host::{install_timing, SystemClock};
use ember::io::{BufferIos, Ios};
use ember::outer::InterpretError;
use ember::task::Task;
use ember::vm::{AppBuilder, Vm};
use rustyline::error::ReadlineError;
use rustyline::{DefaultEditor, Result};
use std::cell::RefCell;
use std::env;
use std::fs;
use std::io::Write;
use std::rc::Rc;

fn main() -> Result<()> {
    println!("Ember Forth v0.3.0");
    println!("Type words for a word list, bye to exit");
    println!();

    let mut app = AppBuilder::new();
    install_timing(&mut app, SystemClock::new());
    let mut vm = Vm::with_app(app);

    let ios = BufferIos::shared();
    let mut task = Task::new(ios.clone());

    // Load files from command line arguments
    for path in env::args().skip(1) {
        match fs::read_to_string(&path) {
            Ok(source) => {
                ios.borrow_mut().feed(&source);
                drain(&mut vm, &mut task, &ios);
                println!("Loaded: {}", path);
            }
            Err(e) => eprintln!("Error loading {}: {}", path, e),
        }
    }

    let mut rl = DefaultEditor::new()?;
    let history_file = dirs::home_dir().map(|mut p| {
        p.push(".ember_history");
        p
    });
    if let Some(ref path) = history_file {
        let _ = rl.load_history(path);
    }

    loop {
        let prompt = if vm.is_compiling() { "... " } else { "" };
        match rl.readline(prompt) {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(input);
                if input == "bye" {
                    println!();
                    break;
                }
                ios.borrow_mut().feed(input);
                ios.borrow_mut().feed("\n");
                drain(&mut vm, &mut task, &ios);
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!();
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    if let Some(ref path) = history_file {
        let _ = rl.save_history(path);
    }

    Ok(())
}

/// Run the interpreter until the buffered input is consumed, echoing
/// whatever the program printed. On an error the rest of the line is
/// discarded and any open definition dropped.
fn drain(vm: &mut Vm, task: &mut Task, ios: &Rc<RefCell<BufferIos>>) {
    loop {
        match vm.interpret(task) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                flush_output(ios);
                if !matches!(e, InterpretError::Unknown(_)) {
                    println!("{}", e);
                }
                vm.abort_compile();
                skip_line(ios);
            }
        }
    }
    flush_output(ios);
}

fn flush_output(ios: &Rc<RefCell<BufferIos>>) {
    let output = ios.borrow_mut().take_output();
    print!("{}", output);
    std::io::stdout().flush().ok();
}

fn skip_line(ios: &Rc<RefCell<BufferIos>>) {
    loop {
        match ios.borrow_mut().read() {
            None | Some(b'\n') => break,
            Some(_) => {}
        }
    }
}
