// outer.rs - The outer interpreter: scan, look up, dispatch

use crate::compiler::CompileError;
use crate::memory::Cell;
use crate::opcode::Op;
use crate::task::Task;
use crate::vm::{Exit, Vm};

/// Failures of a single interpret step. All failures surface as return
/// values; recovery is the host's responsibility.
#[derive(Debug)]
pub enum InterpretError {
    /// Name not found and not parseable as a number in the current base.
    Unknown(String),
    Compile(CompileError),
    /// The dispatched code tripped the VM.
    Trap(Exit),
}

impl std::fmt::Display for InterpretError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            InterpretError::Unknown(word) => write!(f, "{} ??", word),
            InterpretError::Compile(e) => write!(f, "{}", e),
            InterpretError::Trap(Exit::Fault(fault)) => write!(f, "{}", fault),
            InterpretError::Trap(_) => write!(f, "illegal instruction"),
        }
    }
}

impl std::error::Error for InterpretError {}

/// Scan the next whitespace-delimited word from the task's stream. Returns
/// the word and the terminating byte (None at end of input). Leading
/// whitespace, including newlines, is skipped.
pub(crate) fn scan_word(task: &mut Task) -> Option<(String, Option<u8>)> {
    let mut ios = task.ios.borrow_mut();
    let mut bytes = Vec::new();
    let terminator = loop {
        match ios.read() {
            Some(b) if b.is_ascii_whitespace() => {
                if !bytes.is_empty() {
                    break Some(b);
                }
            }
            Some(b) => bytes.push(b),
            None => {
                if bytes.is_empty() {
                    return None;
                }
                break None;
            }
        }
    };
    Some((String::from_utf8_lossy(&bytes).into_owned(), terminator))
}

/// Consume input up to and including the delimiter.
pub(crate) fn scan_until(task: &mut Task, delimiter: u8) -> String {
    let mut ios = task.ios.borrow_mut();
    let mut bytes = Vec::new();
    while let Some(b) = ios.read() {
        if b == delimiter {
            break;
        }
        bytes.push(b);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Signed number in the given base, wrapping to a cell like the original's
/// atoi did.
pub(crate) fn parse_number(word: &str, base: Cell) -> Option<Cell> {
    if word.is_empty() || !(2..=36).contains(&base) {
        return None;
    }
    i32::from_str_radix(word, base as u32).ok().map(|x| x as Cell)
}

fn is_control_opener(word: &str) -> bool {
    matches!(word, "if" | "begin" | "do")
}

impl Vm {
    /// One outer-interpreter step: scan a word from the task's stream,
    /// look it up, and dispatch compiled code or a numeric literal.
    /// Ok(true) when a word was processed, Ok(false) at end of input.
    pub fn interpret(&mut self, task: &mut Task) -> Result<bool, InterpretError> {
        let Some((word, terminator)) = scan_word(task) else {
            return Ok(false);
        };

        if word == "(" {
            scan_until(task, b')');
            return Ok(true);
        }
        if word == "\\" {
            scan_until(task, b'\n');
            return Ok(true);
        }

        if self.is_compiling() {
            self.compile_word(task, &word)
                .map_err(InterpretError::Compile)?;
            self.finish_anonymous(task)?;
        } else if is_control_opener(&word) {
            // Interactive control flow compiles into an anonymous
            // definition that runs once its structure closes.
            self.begin_anonymous();
            self.compile_word(task, &word)
                .map_err(InterpretError::Compile)?;
        } else if self
            .defining_word(task, &word)
            .map_err(InterpretError::Compile)?
        {
            // Handled by the compiler layer.
        } else {
            let token = self.lookup(&word);
            if token >= 0 {
                self.dispatch(token, task)?;
            } else if let Some(x) = parse_number(&word, task.base) {
                task.push(x)
                    .map_err(|fault| InterpretError::Trap(Exit::Fault(fault)))?;
                self.dispatch(Op::Nop.code() as Cell, task)?;
            } else {
                {
                    let mut ios = task.ios.borrow_mut();
                    ios.print(&word);
                    ios.print(" ??");
                    ios.println();
                }
                return Err(InterpretError::Unknown(word));
            }
        }

        // Courtesy stack report after an interactive line.
        if terminator == Some(b'\n') && !task.trace && !self.is_compiling() {
            self.dispatch(Op::DotS.code() as Cell, task)?;
        }
        Ok(true)
    }

    pub(crate) fn dispatch(&mut self, token: Cell, task: &mut Task) -> Result<(), InterpretError> {
        match self.execute(token, task) {
            Exit::Halt | Exit::Yield => Ok(()),
            exit => Err(InterpretError::Trap(exit)),
        }
    }
}
