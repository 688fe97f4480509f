//! ATmega328P instruction catalog and opcode lookup table.
//!
//! Each instruction form is a [`Descriptor`]: a fixed-bit mask, the values
//! those bits must hold, the base cycle cost, the length in words and the
//! [`Handler`] that executes it. An opcode matches a descriptor iff
//! `opcode & mask == value`.
//!
//! The catalog is turned once into a [`LookupTable`] indexed by all 65 536
//! first words, so decoding is a single array load. Construction checks that
//! no opcode matches two descriptors.
//!
//! LD/ST through Y and Z without displacement are the `q = 0` cases of
//! LDD/STD. The SREG set/clear and conditional-branch mnemonics are listed
//! individually over the BSET/BCLR/BRBS/BRBC encodings.

use std::sync::OnceLock;

use crate::error::CatalogError;
use crate::memory::{AddressMode, Pointer};

/// Execution routine selected by a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Nop,
    // Arithmetic and logic
    Add,
    Adc,
    Adiw,
    Sub,
    Subi,
    Sbc,
    Sbci,
    Sbiw,
    And,
    Andi,
    Or,
    Ori,
    Eor,
    Com,
    Neg,
    Inc,
    Dec,
    Mul,
    Muls,
    Mulsu,
    Fmul,
    Fmuls,
    Fmulsu,
    // Compare
    Cp,
    Cpc,
    Cpi,
    // Data transfer
    Mov,
    Movw,
    Ldi,
    Lds,
    Sts,
    Ld(Pointer, AddressMode),
    St(Pointer, AddressMode),
    Ldd(Pointer),
    Std(Pointer),
    Lpm,
    LpmRd { post_increment: bool },
    Push,
    Pop,
    In,
    Out,
    // Bit and bit-test
    Lsr,
    Asr,
    Ror,
    Swap,
    Bset,
    Bclr,
    Bst,
    Bld,
    Sbi,
    Cbi,
    // Control flow
    Rjmp,
    Ijmp,
    Jmp,
    Rcall,
    Icall,
    Call,
    Ret,
    Reti,
    Cpse,
    Sbrc,
    Sbrs,
    Sbic,
    Sbis,
    Brbs,
    Brbc,
    // MCU control
    Sleep,
    Break,
    Wdr,
}

/// Static description of one instruction form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    /// Mnemonic, used by the disassembler and in trace output
    pub name: &'static str,
    pub handler: Handler,
    /// 1 for every fixed bit, 0 for operand bits
    pub mask: u16,
    /// Required value of the fixed bits
    pub value: u16,
    /// Base cycle cost (branch-taken and skip costs are added at run time)
    pub cycles: u8,
    /// Instruction length in 16-bit words (1 or 2)
    pub length: u8,
}

impl Descriptor {
    #[inline(always)]
    pub fn matches(&self, word: u16) -> bool {
        word & self.mask == self.value
    }
}

const fn op(name: &'static str, handler: Handler, mask: u16, value: u16, cycles: u8) -> Descriptor {
    Descriptor { name, handler, mask, value, cycles, length: 1 }
}

const fn op2(name: &'static str, handler: Handler, mask: u16, value: u16, cycles: u8) -> Descriptor {
    Descriptor { name, handler, mask, value, cycles, length: 2 }
}

use AddressMode::{Indirect, PostIncrement, PreDecrement};
use Handler as H;
use Pointer::{X, Y, Z};

/// Every instruction form implemented by the ATmega328P.
pub static CATALOG: &[Descriptor] = &[
    // 0000 00xx
    op("NOP", H::Nop, 0xFFFF, 0x0000, 1),
    op("MOVW", H::Movw, 0xFF00, 0x0100, 1),
    op("MULS", H::Muls, 0xFF00, 0x0200, 2),
    op("MULSU", H::Mulsu, 0xFF88, 0x0300, 2),
    op("FMUL", H::Fmul, 0xFF88, 0x0308, 2),
    op("FMULS", H::Fmuls, 0xFF88, 0x0380, 2),
    op("FMULSU", H::Fmulsu, 0xFF88, 0x0388, 2),
    // Two-register ALU ops: xxxx xxrd dddd rrrr
    op("CPC", H::Cpc, 0xFC00, 0x0400, 1),
    op("SBC", H::Sbc, 0xFC00, 0x0800, 1),
    op("ADD", H::Add, 0xFC00, 0x0C00, 1),
    op("CPSE", H::Cpse, 0xFC00, 0x1000, 1),
    op("CP", H::Cp, 0xFC00, 0x1400, 1),
    op("SUB", H::Sub, 0xFC00, 0x1800, 1),
    op("ADC", H::Adc, 0xFC00, 0x1C00, 1),
    op("AND", H::And, 0xFC00, 0x2000, 1),
    op("EOR", H::Eor, 0xFC00, 0x2400, 1),
    op("OR", H::Or, 0xFC00, 0x2800, 1),
    op("MOV", H::Mov, 0xFC00, 0x2C00, 1),
    // Register-immediate: xxxx KKKK dddd KKKK
    op("CPI", H::Cpi, 0xF000, 0x3000, 1),
    op("SBCI", H::Sbci, 0xF000, 0x4000, 1),
    op("SUBI", H::Subi, 0xF000, 0x5000, 1),
    op("ORI", H::Ori, 0xF000, 0x6000, 1),
    op("ANDI", H::Andi, 0xF000, 0x7000, 1),
    op("LDI", H::Ldi, 0xF000, 0xE000, 1),
    // Displacement load/store: 10q0 qqsd dddd yqqq
    op("LDD", H::Ldd(Z), 0xD208, 0x8000, 2),
    op("LDD", H::Ldd(Y), 0xD208, 0x8008, 2),
    op("STD", H::Std(Z), 0xD208, 0x8200, 2),
    op("STD", H::Std(Y), 0xD208, 0x8208, 2),
    // 1001 000d dddd xxxx
    op2("LDS", H::Lds, 0xFE0F, 0x9000, 2),
    op("LD", H::Ld(Z, PostIncrement), 0xFE0F, 0x9001, 2),
    op("LD", H::Ld(Z, PreDecrement), 0xFE0F, 0x9002, 2),
    op("LPM", H::LpmRd { post_increment: false }, 0xFE0F, 0x9004, 3),
    op("LPM", H::LpmRd { post_increment: true }, 0xFE0F, 0x9005, 3),
    op("LD", H::Ld(Y, PostIncrement), 0xFE0F, 0x9009, 2),
    op("LD", H::Ld(Y, PreDecrement), 0xFE0F, 0x900A, 2),
    op("LD", H::Ld(X, Indirect), 0xFE0F, 0x900C, 2),
    op("LD", H::Ld(X, PostIncrement), 0xFE0F, 0x900D, 2),
    op("LD", H::Ld(X, PreDecrement), 0xFE0F, 0x900E, 2),
    op("POP", H::Pop, 0xFE0F, 0x900F, 2),
    // 1001 001r rrrr xxxx
    op2("STS", H::Sts, 0xFE0F, 0x9200, 2),
    op("ST", H::St(Z, PostIncrement), 0xFE0F, 0x9201, 2),
    op("ST", H::St(Z, PreDecrement), 0xFE0F, 0x9202, 2),
    op("ST", H::St(Y, PostIncrement), 0xFE0F, 0x9209, 2),
    op("ST", H::St(Y, PreDecrement), 0xFE0F, 0x920A, 2),
    op("ST", H::St(X, Indirect), 0xFE0F, 0x920C, 2),
    op("ST", H::St(X, PostIncrement), 0xFE0F, 0x920D, 2),
    op("ST", H::St(X, PreDecrement), 0xFE0F, 0x920E, 2),
    op("PUSH", H::Push, 0xFE0F, 0x920F, 2),
    // One-register ops: 1001 010d dddd xxxx
    op("COM", H::Com, 0xFE0F, 0x9400, 1),
    op("NEG", H::Neg, 0xFE0F, 0x9401, 1),
    op("SWAP", H::Swap, 0xFE0F, 0x9402, 1),
    op("INC", H::Inc, 0xFE0F, 0x9403, 1),
    op("ASR", H::Asr, 0xFE0F, 0x9405, 1),
    op("LSR", H::Lsr, 0xFE0F, 0x9406, 1),
    op("ROR", H::Ror, 0xFE0F, 0x9407, 1),
    op("DEC", H::Dec, 0xFE0F, 0x940A, 1),
    op2("JMP", H::Jmp, 0xFE0E, 0x940C, 3),
    op2("CALL", H::Call, 0xFE0E, 0x940E, 4),
    // SREG bit set/clear: 1001 0100 Bsss 1000
    op("SEC", H::Bset, 0xFFFF, 0x9408, 1),
    op("SEZ", H::Bset, 0xFFFF, 0x9418, 1),
    op("SEN", H::Bset, 0xFFFF, 0x9428, 1),
    op("SEV", H::Bset, 0xFFFF, 0x9438, 1),
    op("SES", H::Bset, 0xFFFF, 0x9448, 1),
    op("SEH", H::Bset, 0xFFFF, 0x9458, 1),
    op("SET", H::Bset, 0xFFFF, 0x9468, 1),
    op("SEI", H::Bset, 0xFFFF, 0x9478, 1),
    op("CLC", H::Bclr, 0xFFFF, 0x9488, 1),
    op("CLZ", H::Bclr, 0xFFFF, 0x9498, 1),
    op("CLN", H::Bclr, 0xFFFF, 0x94A8, 1),
    op("CLV", H::Bclr, 0xFFFF, 0x94B8, 1),
    op("CLS", H::Bclr, 0xFFFF, 0x94C8, 1),
    op("CLH", H::Bclr, 0xFFFF, 0x94D8, 1),
    op("CLT", H::Bclr, 0xFFFF, 0x94E8, 1),
    op("CLI", H::Bclr, 0xFFFF, 0x94F8, 1),
    // Fixed encodings
    op("IJMP", H::Ijmp, 0xFFFF, 0x9409, 2),
    op("RET", H::Ret, 0xFFFF, 0x9508, 4),
    op("ICALL", H::Icall, 0xFFFF, 0x9509, 3),
    op("RETI", H::Reti, 0xFFFF, 0x9518, 4),
    op("SLEEP", H::Sleep, 0xFFFF, 0x9588, 1),
    op("BREAK", H::Break, 0xFFFF, 0x9598, 1),
    op("WDR", H::Wdr, 0xFFFF, 0x95A8, 1),
    op("LPM", H::Lpm, 0xFFFF, 0x95C8, 3),
    // 1001 011x KKdd KKKK
    op("ADIW", H::Adiw, 0xFF00, 0x9600, 2),
    op("SBIW", H::Sbiw, 0xFF00, 0x9700, 2),
    // 1001 10xx AAAA Abbb
    op("CBI", H::Cbi, 0xFF00, 0x9800, 2),
    op("SBIC", H::Sbic, 0xFF00, 0x9900, 1),
    op("SBI", H::Sbi, 0xFF00, 0x9A00, 2),
    op("SBIS", H::Sbis, 0xFF00, 0x9B00, 1),
    op("MUL", H::Mul, 0xFC00, 0x9C00, 2),
    // 1011 sAAd dddd AAAA
    op("IN", H::In, 0xF800, 0xB000, 1),
    op("OUT", H::Out, 0xF800, 0xB800, 1),
    op("RJMP", H::Rjmp, 0xF000, 0xC000, 2),
    op("RCALL", H::Rcall, 0xF000, 0xD000, 3),
    // Conditional branches: 1111 0Bkk kkkk ksss
    op("BRCS", H::Brbs, 0xFC07, 0xF000, 1),
    op("BREQ", H::Brbs, 0xFC07, 0xF001, 1),
    op("BRMI", H::Brbs, 0xFC07, 0xF002, 1),
    op("BRVS", H::Brbs, 0xFC07, 0xF003, 1),
    op("BRLT", H::Brbs, 0xFC07, 0xF004, 1),
    op("BRHS", H::Brbs, 0xFC07, 0xF005, 1),
    op("BRTS", H::Brbs, 0xFC07, 0xF006, 1),
    op("BRIE", H::Brbs, 0xFC07, 0xF007, 1),
    op("BRCC", H::Brbc, 0xFC07, 0xF400, 1),
    op("BRNE", H::Brbc, 0xFC07, 0xF401, 1),
    op("BRPL", H::Brbc, 0xFC07, 0xF402, 1),
    op("BRVC", H::Brbc, 0xFC07, 0xF403, 1),
    op("BRGE", H::Brbc, 0xFC07, 0xF404, 1),
    op("BRHC", H::Brbc, 0xFC07, 0xF405, 1),
    op("BRTC", H::Brbc, 0xFC07, 0xF406, 1),
    op("BRID", H::Brbc, 0xFC07, 0xF407, 1),
    // 1111 1xxd dddd 0bbb
    op("BLD", H::Bld, 0xFE08, 0xF800, 1),
    op("BST", H::Bst, 0xFE08, 0xFA00, 1),
    op("SBRC", H::Sbrc, 0xFE08, 0xFC00, 1),
    op("SBRS", H::Sbrs, 0xFE08, 0xFE00, 1),
];

const NO_MATCH: u16 = u16::MAX;

/// Dense opcode index: first word -> catalog index.
pub struct LookupTable {
    index: Box<[u16]>,
}

impl LookupTable {
    /// Build the index for every 16-bit first word, rejecting malformed or
    /// overlapping descriptors.
    pub fn build(catalog: &[Descriptor]) -> Result<Self, CatalogError> {
        for d in catalog {
            if d.value & !d.mask != 0 || !(1..=2).contains(&d.length) {
                return Err(CatalogError::InvalidDescriptor { name: d.name });
            }
        }

        let mut index = vec![NO_MATCH; 1 << 16].into_boxed_slice();
        for (i, d) in catalog.iter().enumerate() {
            // Walk only the opcodes this descriptor covers by counting through
            // its free bits.
            let free = !d.mask;
            let mut operand: u16 = 0;
            loop {
                let word = d.value | operand;
                let slot = &mut index[word as usize];
                if *slot != NO_MATCH {
                    return Err(CatalogError::Ambiguous {
                        opcode: word,
                        first: catalog[*slot as usize].name,
                        second: d.name,
                    });
                }
                *slot = i as u16;
                if operand == free {
                    break;
                }
                operand = (operand.wrapping_sub(free)) & free;
            }
        }

        Ok(LookupTable { index })
    }

    /// Catalog index of the descriptor matching `word`.
    #[inline(always)]
    pub fn lookup(&self, word: u16) -> Option<usize> {
        match self.index[word as usize] {
            NO_MATCH => None,
            i => Some(i as usize),
        }
    }

    /// Number of first words that decode to some descriptor.
    pub fn coverage(&self) -> usize {
        self.index.iter().filter(|&&i| i != NO_MATCH).count()
    }
}

/// Catalog plus its lookup table, built once and shared read-only.
pub struct InstructionTable {
    pub descriptors: &'static [Descriptor],
    lookup: LookupTable,
}

static GLOBAL: OnceLock<Result<InstructionTable, CatalogError>> = OnceLock::new();

impl InstructionTable {
    pub fn build(descriptors: &'static [Descriptor]) -> Result<Self, CatalogError> {
        Ok(InstructionTable { descriptors, lookup: LookupTable::build(descriptors)? })
    }

    /// The ATmega328P table, built on first use.
    pub fn global() -> Result<&'static InstructionTable, CatalogError> {
        GLOBAL
            .get_or_init(|| InstructionTable::build(CATALOG))
            .as_ref()
            .map_err(Clone::clone)
    }

    /// Descriptor for a first word, if any.
    #[inline(always)]
    pub fn resolve(&self, word: u16) -> Option<&'static Descriptor> {
        let descriptors = self.descriptors;
        self.lookup.lookup(word).map(|i| &descriptors[i])
    }

    pub fn lookup_table(&self) -> &LookupTable {
        &self.lookup
    }
}
