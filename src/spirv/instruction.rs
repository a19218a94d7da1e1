// SPIR-V instruction representation
//
// An instruction is kept as its raw words plus the position it had in the
// original binary. Positions are what the GPU reports back, so instructions
// injected by instrumentation carry none.

use rspirv::grammar::{CoreInstructionTable, OperandKind};
use rspirv::spirv::Op;

pub const MAGIC_NUMBER: u32 = 0x0723_0203;
pub const HEADER_WORDS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    words: Vec<u32>,
    position: Option<u32>,
    has_type: bool,
    has_result: bool,
}

/// Returns (has result type, has result id) for an opcode
fn instruction_shape(opcode: u32) -> (bool, bool) {
    let Some(grammar) = CoreInstructionTable::lookup_opcode(opcode as u16) else {
        return (false, false);
    };
    let mut kinds = grammar.operands.iter();
    match kinds.next().map(|operand| &operand.kind) {
        Some(OperandKind::IdResultType) => {
            let has_result = matches!(
                kinds.next().map(|operand| &operand.kind),
                Some(OperandKind::IdResult)
            );
            (true, has_result)
        }
        Some(OperandKind::IdResult) => (false, true),
        _ => (false, false),
    }
}

impl Instruction {
    /// Wrap words read from a binary
    pub fn from_words(words: Vec<u32>, position: Option<u32>) -> Self {
        let (has_type, has_result) = instruction_shape(words[0] & 0xFFFF);
        Self {
            words,
            position,
            has_type,
            has_result,
        }
    }

    /// Build a new instruction; `result_type` / `result_id` of 0 mean absent
    pub fn new(op: Op, result_type: u32, result_id: u32, operands: &[u32]) -> Self {
        let mut words = Vec::with_capacity(3 + operands.len());
        words.push(op as u32);
        if result_type != 0 {
            words.push(result_type);
        }
        if result_id != 0 {
            words.push(result_id);
        }
        words.extend_from_slice(operands);
        words[0] |= (words.len() as u32) << 16;

        Self {
            words,
            position: None,
            has_type: result_type != 0,
            has_result: result_id != 0,
        }
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn position(&self) -> Option<u32> {
        self.position
    }

    pub fn opcode(&self) -> u32 {
        self.words[0] & 0xFFFF
    }

    pub fn op(&self) -> Option<Op> {
        Op::from_u32(self.opcode())
    }

    pub fn is(&self, op: Op) -> bool {
        self.opcode() == op as u32
    }

    pub fn type_id(&self) -> u32 {
        if self.has_type {
            self.words[1]
        } else {
            0
        }
    }

    pub fn result_id(&self) -> u32 {
        match (self.has_type, self.has_result) {
            (true, true) => self.words[2],
            (false, true) => self.words[1],
            _ => 0,
        }
    }

    pub fn set_result_id(&mut self, id: u32) {
        match (self.has_type, self.has_result) {
            (true, true) => self.words[2] = id,
            (false, true) => self.words[1] = id,
            _ => {}
        }
    }

    fn operand_start(&self) -> usize {
        1 + self.has_type as usize + self.has_result as usize
    }

    /// Operand words, excluding result type and result id
    pub fn operands(&self) -> &[u32] {
        &self.words[self.operand_start()..]
    }

    pub fn operand_count(&self) -> usize {
        self.words.len() - self.operand_start()
    }

    pub fn operand(&self, index: usize) -> u32 {
        self.words[self.operand_start() + index]
    }

    pub fn try_operand(&self, index: usize) -> Option<u32> {
        self.words.get(self.operand_start() + index).copied()
    }

    pub fn set_operand(&mut self, index: usize, value: u32) {
        let start = self.operand_start();
        self.words[start + index] = value;
    }

    pub fn push_operand(&mut self, value: u32) {
        self.words.push(value);
        self.words[0] = (self.words[0] & 0xFFFF) | ((self.words.len() as u32) << 16);
    }

    /// Decode a literal string starting at operand `index`
    pub fn string_operand(&self, index: usize) -> String {
        decode_string(&self.operands()[index..]).0
    }

    /// Number of words used by the literal string starting at operand `index`
    pub fn string_operand_words(&self, index: usize) -> usize {
        decode_string(&self.operands()[index..]).1
    }

    /// One line disassembly, e.g. `%23 = OpLoad %5 %22`
    pub fn describe(&self) -> String {
        let name = match self.op() {
            Some(op) => format!("Op{:?}", op),
            None => format!("Op<{}>", self.opcode()),
        };

        let mut text = String::new();
        if self.has_result {
            text.push_str(&format!("%{} = ", self.result_id()));
        }
        text.push_str(&name);
        if self.has_type {
            text.push_str(&format!(" %{}", self.type_id()));
        }

        let kinds: Vec<&OperandKind> = CoreInstructionTable::lookup_opcode(self.opcode() as u16)
            .map(|grammar| {
                grammar
                    .operands
                    .iter()
                    .map(|operand| &operand.kind)
                    .filter(|kind| {
                        !matches!(kind, OperandKind::IdResultType | OperandKind::IdResult)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let operands = self.operands();
        let mut index = 0;
        let mut kind_index = 0;
        while index < operands.len() {
            let kind = kinds.get(kind_index.min(kinds.len().saturating_sub(1)));
            kind_index += 1;
            match kind {
                Some(OperandKind::LiteralString) => {
                    let (string, used) = decode_string(&operands[index..]);
                    text.push_str(&format!(" \"{}\"", string));
                    index += used.max(1);
                }
                Some(kind) if format!("{:?}", kind).starts_with("Id") => {
                    text.push_str(&format!(" %{}", operands[index]));
                    index += 1;
                }
                _ => {
                    text.push_str(&format!(" {}", operands[index]));
                    index += 1;
                }
            }
        }
        text
    }
}

/// Decode a nul-terminated UTF-8 literal, returning it and the words it spans
pub fn decode_string(words: &[u32]) -> (String, usize) {
    let mut bytes = Vec::new();
    for (index, word) in words.iter().enumerate() {
        for byte in word.to_le_bytes() {
            if byte == 0 {
                return (String::from_utf8_lossy(&bytes).into_owned(), index + 1);
            }
            bytes.push(byte);
        }
    }
    (String::from_utf8_lossy(&bytes).into_owned(), words.len())
}

/// Encode a literal string, always including the terminating nul
pub fn encode_string(string: &str) -> Vec<u32> {
    let mut bytes = string.as_bytes().to_vec();
    bytes.push(0);
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Split a binary into instructions, numbering them from the first one after the header
pub fn parse_instructions(words: &[u32]) -> Option<Vec<Instruction>> {
    if words.len() < HEADER_WORDS || words[0] != MAGIC_NUMBER {
        return None;
    }

    let mut instructions = Vec::new();
    let mut offset = HEADER_WORDS;
    let mut position = 0;
    while offset < words.len() {
        let word_count = (words[offset] >> 16) as usize;
        if word_count == 0 || offset + word_count > words.len() {
            return None;
        }
        instructions.push(Instruction::from_words(
            words[offset..offset + word_count].to_vec(),
            Some(position),
        ));
        offset += word_count;
        position += 1;
    }
    Some(instructions)
}
