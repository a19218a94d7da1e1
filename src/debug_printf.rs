// Host side of debug printf
//
// A printf record carries the id of the `OpString` holding the format and the
// argument values as raw 32-bit words. The format is looked up in the
// shader's original SPIR-V and expanded here with C printf conversions, plus
// `%vN` for vectors of N components and `l` for 64-bit values (two words,
// low word first).

use crate::debug_info::ShaderMessageInfo;
use crate::spirv::instruction::parse_instructions;
use crate::spirv::interface::{
    PRINTF_FORMAT_STRING_ID_OFFSET, PRINTF_HEADER_SIZE, RECORD_INSTRUCTION_POSITION_OFFSET, RECORD_SHADER_ID_OFFSET,
    RECORD_SIZE_OFFSET, RECORD_STAGE_ID_OFFSET, RECORD_STAGE_INFO_OFFSET,
};
use rspirv::spirv::Op;
use std::iter::Peekable;
use std::str::Chars;

/// One record of the debug printf buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintfRecord {
    pub size: u32,
    pub info: ShaderMessageInfo,
    pub format_string_id: u32,
    pub values: Vec<u32>,
}

impl PrintfRecord {
    /// Decode the record at the start of `words`; `None` if its size word is
    /// shorter than the header or longer than the data
    pub fn parse(words: &[u32]) -> Option<Self> {
        let size = *words.get(RECORD_SIZE_OFFSET)?;
        if size < PRINTF_HEADER_SIZE || size as usize > words.len() {
            return None;
        }
        let info = ShaderMessageInfo {
            shader_id: words[RECORD_SHADER_ID_OFFSET],
            stage_id: words[RECORD_STAGE_ID_OFFSET],
            stage_info: [
                words[RECORD_STAGE_INFO_OFFSET],
                words[RECORD_STAGE_INFO_OFFSET + 1],
                words[RECORD_STAGE_INFO_OFFSET + 2],
            ],
            instruction_position: words[RECORD_INSTRUCTION_POSITION_OFFSET],
        };
        Some(Self {
            size,
            info,
            format_string_id: words[PRINTF_FORMAT_STRING_ID_OFFSET],
            values: words[PRINTF_HEADER_SIZE as usize..size as usize].to_vec(),
        })
    }
}

/// Text of the `OpString` with result id `id`
pub fn find_string(spirv: &[u32], id: u32) -> Option<String> {
    parse_instructions(spirv)?
        .iter()
        .find(|inst| inst.is(Op::String) && inst.result_id() == id)
        .map(|inst| inst.string_operand(0))
}

#[derive(Debug, Clone, Copy, Default)]
struct Conversion {
    left_align: bool,
    plus: bool,
    space: bool,
    alternate: bool,
    zero_pad: bool,
    width: Option<usize>,
    precision: Option<usize>,
    components: usize,
    long: bool,
    kind: char,
}

fn digits(chars: &mut Peekable<Chars>, raw: &mut String) -> Option<usize> {
    let mut value = None;
    while let Some(digit) = chars.peek().and_then(|c| c.to_digit(10)) {
        raw.push(chars.next().unwrap_or('0'));
        value = Some(value.unwrap_or(0) * 10 + digit as usize);
    }
    value
}

impl Conversion {
    /// Parse what follows a `%`. Everything consumed is appended to `raw`.
    fn parse(chars: &mut Peekable<Chars>, raw: &mut String) -> Option<Self> {
        let mut conversion = Conversion {
            components: 1,
            ..Default::default()
        };
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => conversion.left_align = true,
                '+' => conversion.plus = true,
                ' ' => conversion.space = true,
                '#' => conversion.alternate = true,
                '0' => conversion.zero_pad = true,
                _ => break,
            }
            raw.push(flag);
            chars.next();
        }
        conversion.width = digits(chars, raw);
        if chars.peek() == Some(&'.') {
            raw.push('.');
            chars.next();
            conversion.precision = Some(digits(chars, raw).unwrap_or(0));
        }
        loop {
            match chars.peek() {
                Some('v') => {
                    raw.push('v');
                    chars.next();
                    let count = chars.peek().and_then(|c| c.to_digit(10))?;
                    if !(2..=4).contains(&count) {
                        return None;
                    }
                    raw.push(chars.next()?);
                    conversion.components = count as usize;
                }
                Some('l') => {
                    raw.push('l');
                    chars.next();
                    conversion.long = true;
                }
                _ => break,
            }
        }
        let kind = chars.next()?;
        raw.push(kind);
        if !"diuxXocfFeEgGaA".contains(kind) {
            return None;
        }
        conversion.kind = kind;
        Some(conversion)
    }

    /// Next value as 64 raw bits
    fn take(&self, values: &mut impl Iterator<Item = u32>) -> Option<u64> {
        let low = values.next()? as u64;
        if self.long {
            let high = values.next()? as u64;
            Some((high << 32) | low)
        } else {
            Some(low)
        }
    }

    fn format(&self, bits: u64) -> String {
        match self.kind {
            'd' | 'i' => {
                let value = if self.long { bits as i64 } else { bits as u32 as i32 as i64 };
                self.integer(value < 0, value.unsigned_abs().to_string(), "")
            }
            'u' => self.integer(false, bits.to_string(), ""),
            'x' | 'X' => {
                let digits = if self.kind == 'x' {
                    format!("{:x}", bits)
                } else {
                    format!("{:X}", bits)
                };
                let prefix = match (self.alternate && bits != 0, self.kind) {
                    (true, 'x') => "0x",
                    (true, _) => "0X",
                    _ => "",
                };
                self.integer(false, digits, prefix)
            }
            'o' => {
                let mut digits = format!("{:o}", bits);
                if self.alternate && !digits.starts_with('0') {
                    digits.insert(0, '0');
                }
                self.integer(false, digits, "")
            }
            'c' => {
                let c = char::from_u32(bits as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
                self.pad("", &c.to_string(), false)
            }
            _ => {
                let value = if self.long {
                    f64::from_bits(bits)
                } else {
                    f32::from_bits(bits as u32) as f64
                };
                self.float(value)
            }
        }
    }

    fn sign(&self, negative: bool) -> &'static str {
        if negative {
            "-"
        } else if self.plus {
            "+"
        } else if self.space {
            " "
        } else {
            ""
        }
    }

    fn integer(&self, negative: bool, mut digits: String, prefix: &str) -> String {
        let signed = matches!(self.kind, 'd' | 'i');
        if let Some(precision) = self.precision {
            if precision == 0 && digits == "0" {
                digits.clear();
            }
            while digits.len() < precision {
                digits.insert(0, '0');
            }
        }
        let sign = if signed { self.sign(negative) } else { "" };
        self.pad(&format!("{}{}", sign, prefix), &digits, self.precision.is_none())
    }

    fn float(&self, value: f64) -> String {
        let negative = value.is_sign_negative() && !value.is_nan();
        let magnitude = value.abs();
        let upper = self.kind.is_ascii_uppercase();

        if !magnitude.is_finite() {
            let text = if magnitude.is_nan() { "nan" } else { "inf" };
            let text = if upper { text.to_uppercase() } else { text.to_string() };
            return self.pad(self.sign(negative), &text, false);
        }
        let body = match self.kind.to_ascii_lowercase() {
            'f' => {
                let mut text = format!("{:.*}", self.precision.unwrap_or(6), magnitude);
                if self.alternate && self.precision == Some(0) {
                    text.push('.');
                }
                text
            }
            'e' => exponent_format(magnitude, self.precision.unwrap_or(6), self.alternate),
            'g' => general_format(magnitude, self.precision.unwrap_or(6).max(1), self.alternate),
            _ => hex_float_format(magnitude, self.precision, self.alternate),
        };
        let body = if upper { body.to_uppercase() } else { body };
        self.pad(self.sign(negative), &body, true)
    }

    fn pad(&self, head: &str, body: &str, zero_allowed: bool) -> String {
        let length = head.chars().count() + body.chars().count();
        let width = self.width.unwrap_or(0);
        if width <= length {
            return format!("{}{}", head, body);
        }
        let fill = width - length;
        if self.left_align {
            format!("{}{}{}", head, body, " ".repeat(fill))
        } else if self.zero_pad && zero_allowed {
            format!("{}{}{}", head, "0".repeat(fill), body)
        } else {
            format!("{}{}{}", " ".repeat(fill), head, body)
        }
    }
}

/// Decimal exponent as printed by `{:e}` with `precision` digits
fn decimal_exponent(value: f64, precision: usize) -> i32 {
    let text = format!("{:.*e}", precision, value);
    text.split_once('e')
        .and_then(|(_, exponent)| exponent.parse().ok())
        .unwrap_or(0)
}

fn exponent_format(value: f64, precision: usize, alternate: bool) -> String {
    let text = format!("{:.*e}", precision, value);
    let (mantissa, exponent) = text.split_once('e').unwrap_or((&text, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let point = if alternate && precision == 0 { "." } else { "" };
    format!(
        "{}{}e{}{:02}",
        mantissa,
        point,
        if exponent < 0 { '-' } else { '+' },
        exponent.abs()
    )
}

fn strip_trailing_zeros(text: &str) -> String {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text.to_string()
    }
}

/// `%g`: fixed or exponent form, whichever C would pick for `precision` significant digits
fn general_format(value: f64, precision: usize, alternate: bool) -> String {
    let exponent = if value == 0.0 {
        0
    } else {
        decimal_exponent(value, precision - 1)
    };
    if (precision as i32) > exponent && exponent >= -4 {
        let text = format!("{:.*}", (precision as i32 - 1 - exponent) as usize, value);
        if alternate {
            text
        } else {
            strip_trailing_zeros(&text)
        }
    } else {
        let text = exponent_format(value, precision - 1, alternate);
        if alternate {
            return text;
        }
        match text.split_once('e') {
            Some((mantissa, exponent)) => format!("{}e{}", strip_trailing_zeros(mantissa), exponent),
            None => text,
        }
    }
}

/// `%a`; a precision truncates the hex digits instead of rounding them
fn hex_float_format(value: f64, precision: Option<usize>, alternate: bool) -> String {
    if value == 0.0 {
        let digits = "0".repeat(precision.unwrap_or(0));
        let point = if !digits.is_empty() || alternate { "." } else { "" };
        return format!("0x0{}{}p+0", point, digits);
    }
    let bits = value.to_bits();
    let biased = ((bits >> 52) & 0x7ff) as i32;
    let fraction = bits & ((1 << 52) - 1);
    let (lead, exponent) = if biased == 0 { (0, -1022) } else { (1, biased - 1023) };

    let all = format!("{:013x}", fraction);
    let digits = match precision {
        Some(precision) => {
            let mut digits: String = all.chars().take(precision).collect();
            while digits.len() < precision {
                digits.push('0');
            }
            digits
        }
        None => all.trim_end_matches('0').to_string(),
    };
    let point = if !digits.is_empty() || alternate { "." } else { "" };
    format!(
        "0x{}{}{}p{}{}",
        lead,
        point,
        digits,
        if exponent < 0 { '-' } else { '+' },
        exponent.abs()
    )
}

/// Expand `format` with the raw argument words of a printf record.
/// Conversions without enough values left are copied through unchanged.
pub fn format_printf(format: &str, values: &[u32]) -> String {
    let mut output = String::with_capacity(format.len());
    let mut values = values.iter().copied();
    let mut chars = format.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            output.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            output.push('%');
            continue;
        }
        let mut raw = String::from("%");
        let Some(conversion) = Conversion::parse(&mut chars, &mut raw) else {
            output.push_str(&raw);
            continue;
        };
        let components: Option<Vec<String>> = (0..conversion.components)
            .map(|_| conversion.take(&mut values).map(|bits| conversion.format(bits)))
            .collect();
        match components {
            Some(components) => output.push_str(&components.join(", ")),
            None => output.push_str(&raw),
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ShaderBuilder;

    fn float(value: f32) -> u32 {
        value.to_bits()
    }

    #[test]
    fn integers_and_flags() {
        assert_eq!(format_printf("x = %d, y = %u", &[(-5i32) as u32, 7]), "x = -5, y = 7");
        assert_eq!(format_printf("%+d|%05d|%-4d|", &[5, (-42i32) as u32, 3]), "+5|-0042|3   |");
        assert_eq!(format_printf("%x %X %#x %#o %.3u", &[255, 255, 255, 8, 7]), "ff FF 0xff 010 007");
        assert_eq!(format_printf("%c%c", &[72, 105]), "Hi");
        assert_eq!(format_printf("100%%", &[]), "100%");
    }

    #[test]
    fn sixty_four_bit_values_take_two_words() {
        assert_eq!(format_printf("%lu", &[0, 1]), "4294967296");
        assert_eq!(format_printf("%lx", &[0xdead_beef, 1]), "1deadbeef");
        assert_eq!(format_printf("%ld", &[u32::MAX, u32::MAX]), "-1");
        assert_eq!(format_printf("%lf", &[0, 0x3ff8_0000]), "1.500000");
    }

    #[test]
    fn floating_point_conversions() {
        assert_eq!(format_printf("%5.2f|", &[float(1.5)]), " 1.50|");
        assert_eq!(format_printf("%e", &[float(1.5)]), "1.500000e+00");
        assert_eq!(format_printf("%.2E", &[float(-1250.0)]), "-1.25E+03");
        assert_eq!(format_printf("%g %g", &[float(0.0001), float(1_000_000.0)]), "0.0001 1e+06");
        assert_eq!(format_printf("%g", &[float(100.0)]), "100");
        assert_eq!(format_printf("%a %a", &[float(1.0), float(3.0)]), "0x1p+0 0x1.8p+1");
        assert_eq!(format_printf("%f %F", &[float(f32::INFINITY), float(f32::NAN)]), "inf NAN");
    }

    #[test]
    fn vectors_print_each_component() {
        assert_eq!(
            format_printf("pos = (%.1v3f)", &[float(1.0), float(2.5), float(-3.0)]),
            "pos = (1.0, 2.5, -3.0)"
        );
        assert_eq!(format_printf("%v2u", &[1, 2]), "1, 2");
    }

    #[test]
    fn unsupported_or_unfed_conversions_are_copied() {
        assert_eq!(format_printf("%s and %d", &[]), "%s and %d");
        assert_eq!(format_printf("%v3u", &[1, 2]), "%v3u");
    }

    #[test]
    fn record_and_format_string_lookup() {
        let spirv = ShaderBuilder::compute().with_debug_printf("value %u", &[3]).build();
        let id = parse_instructions(&spirv)
            .unwrap()
            .iter()
            .find(|inst| inst.is(Op::String))
            .unwrap()
            .result_id();
        assert_eq!(find_string(&spirv, id).as_deref(), Some("value %u"));
        assert_eq!(find_string(&spirv, 0xffff), None);

        let words = [PRINTF_HEADER_SIZE + 1, 2, 17, 5, 1, 0, 0, id, 3];
        let record = PrintfRecord::parse(&words).unwrap();
        assert_eq!(record.info.shader_id, 2);
        assert_eq!(record.info.instruction_position, 17);
        assert_eq!(record.values, vec![3]);
        assert!(PrintfRecord::parse(&words[..5]).is_none());
        assert!(PrintfRecord::parse(&[0; 8]).is_none());
    }
}
