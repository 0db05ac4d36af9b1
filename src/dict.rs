// dict.rs - Kernel, static and dynamic dictionaries

use crate::memory::{Fault, Memory};
use crate::opcode::{Op, Token};

/// Kernel token capacity: 0..127 encode directly, 128..255 through the
/// (kernel) prefix.
pub const KERNEL_MAX: u16 = 256;

/// End of the static application token range (128 entries, encoded as
/// negative bytes).
pub const APPLICATION_MAX: u16 = KERNEL_MAX + 128;

/// End of the dynamic application token range and of the token space.
pub const TOKEN_MAX: u16 = APPLICATION_MAX + WORD_MAX as u16;

/// Dynamic dictionary entry cap.
pub const WORD_MAX: usize = 128;

/// The process-wide dictionary. Kernel names come from the opcode table;
/// static application words are fixed at construction; dynamic words are
/// two parallel pointer arrays whose names and bodies are carved from the
/// data arena.
pub struct Dict {
    statics: Vec<(String, u16)>,
    names: Vec<u16>,
    bodies: Vec<u16>,
}

impl Dict {
    pub fn new(statics: Vec<(String, u16)>) -> Self {
        Dict {
            statics,
            names: Vec::new(),
            bodies: Vec::new(),
        }
    }

    /// Code address of a static application word.
    pub fn app_entry(&self, index: usize) -> Option<u16> {
        self.statics.get(index).map(|(_, addr)| *addr)
    }

    /// Body address of a dynamic word.
    pub fn word_body(&self, index: usize) -> Option<u16> {
        self.bodies.get(index).copied()
    }

    /// Number of dynamic words defined.
    pub fn word_count(&self) -> usize {
        self.names.len()
    }

    /// Index of the most recently defined dynamic word.
    pub fn latest(&self) -> Option<usize> {
        self.names.len().checked_sub(1)
    }

    /// Find a dynamic word by name, newest first.
    pub fn find_word(&self, name: &str, memory: &Memory) -> Option<usize> {
        for index in (0..self.names.len()).rev() {
            if let Ok(entry) = memory.str_at(self.names[index]) {
                if entry == name {
                    return Some(index);
                }
            }
        }
        None
    }

    /// Look a name up across all three dictionaries. User definitions
    /// shadow built-ins: dynamic first, then static, then kernel.
    /// Comparison is case-sensitive.
    pub fn lookup(&self, name: &str, memory: &Memory) -> Option<Token> {
        if let Some(index) = self.find_word(name, memory) {
            return Some(Token::Word(index as u8));
        }
        for (index, (entry, _)) in self.statics.iter().enumerate().rev() {
            if entry == name {
                return Some(Token::App(index as u8));
            }
        }
        Op::from_name(name).map(|op| Token::Kernel(op.code()))
    }

    /// Name of any token, for trace and .name.
    pub fn token_name(&self, token: Token, memory: &Memory) -> Option<String> {
        match token {
            Token::Kernel(t) => Op::from_code(t as u16).map(|op| op.name().to_string()),
            Token::App(i) => self.statics.get(i as usize).map(|(n, _)| n.clone()),
            Token::Word(i) => self
                .names
                .get(i as usize)
                .and_then(|addr| memory.str_at(*addr).ok()),
        }
    }

    /// All names in lookup order, for words.
    pub fn all_names(&self, memory: &Memory) -> Vec<String> {
        let mut out = Vec::new();
        for index in (0..self.names.len()).rev() {
            if let Ok(name) = memory.str_at(self.names[index]) {
                out.push(name);
            }
        }
        for (name, _) in self.statics.iter().rev() {
            out.push(name.clone());
        }
        for (name, _) in Op::all() {
            out.push(name.to_string());
        }
        out
    }

    /// Append a dynamic word: the name goes into the arena at the data
    /// pointer, the body starts right after its terminator. The caller
    /// checks WORD_MAX beforehand.
    pub fn define(&mut self, name: &str, memory: &mut Memory) -> Result<u8, Fault> {
        let index = self.names.len() as u8;
        let name_addr = memory.here();
        for b in name.bytes() {
            memory.c_comma(b)?;
        }
        memory.c_comma(0)?;
        self.names.push(name_addr);
        self.bodies.push(memory.here());
        Ok(index)
    }

    /// Truncate the dynamic dictionary from the given entry on and rewind
    /// the data pointer to reclaim its arena storage.
    pub fn forget(&mut self, index: usize, memory: &mut Memory) {
        if index < self.names.len() {
            memory.set_here(self.names[index]);
            self.names.truncate(index);
            self.bodies.truncate(index);
        }
    }
}
