//! Operand bit-field extraction.
//!
//! Handlers receive the full opcode and pull out their own operands with
//! these helpers. One-word instructions pass the opcode word directly;
//! two-word instructions pass the first word and read the second word with
//! [`k16`] / [`k22`].

/// 5-bit destination register from `xxxx xxxd dddd xxxx`
#[inline(always)]
pub fn rd5(w: u16) -> u8 {
    ((w >> 4) & 0x1F) as u8
}

/// 5-bit source register from `xxxx xxrx xxxx rrrr`
#[inline(always)]
pub fn rr5(w: u16) -> u8 {
    ((w & 0x0F) | ((w >> 5) & 0x10)) as u8
}

/// Upper-half destination register R16–R31 from `xxxx xxxx dddd xxxx`
#[inline(always)]
pub fn rd4(w: u16) -> u8 {
    16 + ((w >> 4) & 0x0F) as u8
}

/// Upper-half source register R16–R31 from `xxxx xxxx xxxx rrrr`
#[inline(always)]
pub fn rr4(w: u16) -> u8 {
    16 + (w & 0x0F) as u8
}

/// R16–R23 destination from `xxxx xxxx xddd xxxx`
#[inline(always)]
pub fn rd3(w: u16) -> u8 {
    16 + ((w >> 4) & 0x07) as u8
}

/// R16–R23 source from `xxxx xxxx xxxx xrrr`
#[inline(always)]
pub fn rr3(w: u16) -> u8 {
    16 + (w & 0x07) as u8
}

/// MOVW register pair: (d, r), both even
#[inline(always)]
pub fn movw_pair(w: u16) -> (u8, u8) {
    ((((w >> 4) & 0x0F) * 2) as u8, ((w & 0x0F) * 2) as u8)
}

/// 8-bit immediate from `xxxx KKKK xxxx KKKK`
#[inline(always)]
pub fn k8(w: u16) -> u8 {
    (((w >> 4) & 0xF0) | (w & 0x0F)) as u8
}

/// ADIW/SBIW operands `xxxx xxxx KKdd KKKK`: (low register 24/26/28/30, K)
#[inline(always)]
pub fn adiw_operands(w: u16) -> (u8, u8) {
    let d = 24 + (((w >> 4) & 0x03) * 2) as u8;
    let k = (((w >> 2) & 0x30) | (w & 0x0F)) as u8;
    (d, k)
}

/// 6-bit I/O address (IN/OUT) from `xxxx xAAx xxxx AAAA`
#[inline(always)]
pub fn io6(w: u16) -> u8 {
    (((w >> 5) & 0x30) | (w & 0x0F)) as u8
}

/// 5-bit I/O address (SBI/CBI/SBIS/SBIC) from `xxxx xxxx AAAA Axxx`
#[inline(always)]
pub fn io5(w: u16) -> u8 {
    ((w >> 3) & 0x1F) as u8
}

/// Bit number in the low three bits
#[inline(always)]
pub fn bit3(w: u16) -> u8 {
    (w & 0x07) as u8
}

/// SREG bit for BSET/BCLR `xxxx xxxx xsss xxxx`
#[inline(always)]
pub fn sreg_bit(w: u16) -> u8 {
    ((w >> 4) & 0x07) as u8
}

/// 6-bit LDD/STD displacement from `xqxq qxxx xxxx xqqq`
#[inline(always)]
pub fn q6(w: u16) -> u8 {
    (((w >> 8) & 0x20) | ((w >> 7) & 0x18) | (w & 0x07)) as u8
}

/// Signed 12-bit RJMP/RCALL offset
#[inline(always)]
pub fn k12(w: u16) -> i16 {
    ((w << 4) as i16) >> 4
}

/// Signed 7-bit branch offset from `xxxx xxkk kkkk kxxx`
#[inline(always)]
pub fn k7(w: u16) -> i8 {
    (((w >> 3) & 0x7F) as u8 as i8) << 1 >> 1
}

/// First word of a 32-bit opcode
#[inline(always)]
pub fn first_word(op: u32) -> u16 {
    (op >> 16) as u16
}

/// Second word of a 32-bit opcode (LDS/STS address)
#[inline(always)]
pub fn k16(op: u32) -> u16 {
    op as u16
}

/// 22-bit JMP/CALL target from `1001 010k kkkk 11xk` + 16-bit word
#[inline(always)]
pub fn k22(op: u32) -> u32 {
    let w = first_word(op) as u32;
    ((((w >> 3) & 0x3E) | (w & 1)) << 16) | (op & 0xFFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_fields() {
        // ADD R31, R17: 0000 1111 1111 0001
        assert_eq!(rd5(0x0FF1), 31);
        assert_eq!(rr5(0x0FF1), 17);
        // LDI R16, 0xFF
        assert_eq!(rd4(0xEF0F), 16);
        assert_eq!(k8(0xEF0F), 0xFF);
        assert_eq!(movw_pair(0x01F1), (30, 2));
        assert_eq!(rd3(0x0370), 23);
        assert_eq!(rr3(0x0307), 23);
        assert_eq!(rr4(0x020F), 31);
    }

    #[test]
    fn test_adiw_fields() {
        // SBIW R24, 63
        assert_eq!(adiw_operands(0x97CF), (24, 63));
        // ADIW R30, 48
        assert_eq!(adiw_operands(0x96F0), (30, 48));
        // ADIW R26, 1
        assert_eq!(adiw_operands(0x9611), (26, 1));
    }

    #[test]
    fn test_displacement_field() {
        // STD Y+63, R31
        assert_eq!(q6(0xAFFF), 63);
        assert_eq!(q6(0x8209), 1);
        assert_eq!(q6(0x8C08), 0b011000);
    }

    #[test]
    fn test_io_fields() {
        // OUT 0x3F, R16: 1011 1111 0000 1111
        assert_eq!(io6(0xBF0F), 0x3F);
        assert_eq!(rd5(0xBF0F), 16);
        // SBI 0x1F, 7
        assert_eq!(io5(0x9AFF), 0x1F);
        assert_eq!(bit3(0x9AFF), 7);
    }

    #[test]
    fn test_signed_offsets() {
        assert_eq!(k12(0xC000), 0);
        assert_eq!(k12(0xCFFF), -1);
        assert_eq!(k12(0xC7FF), 2047);
        assert_eq!(k12(0xC800), -2048);
        // BREQ .-2 (k = -1): 1111 0011 1111 1001
        assert_eq!(k7(0xF3F9), -1);
        assert_eq!(k7(0xF1F9), 63);
        assert_eq!(k7(0xF201), -64);
    }

    #[test]
    fn test_long_address() {
        assert_eq!(k22(0x940C_0034), 0x0034);
        // JMP with k21 and k16 set: 1001 0101 1111 1101
        assert_eq!(k22(0x95FD_FFFF), 0x3F_FFFF);
        assert_eq!(k16(0x9000_0123), 0x0123);
    }
}
