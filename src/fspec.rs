// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::consts::MAX_ABSOLUTE_CYCLE;
use crate::facstatus::FacStatusCode;

pub fn is_valid_qualifier(name: &str) -> bool {
    is_valid_file_identifier(name)
}

pub fn is_valid_filename(name: &str) -> bool {
    is_valid_file_identifier(name)
}

fn is_valid_file_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 12
        && name
            .bytes()
            .all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit() || ch == b'-' || ch == b'$')
}

/// Pack and node names: up to six characters, alphabetic first.
pub fn is_valid_pack_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 6
        && bytes[0].is_ascii_uppercase()
        && bytes[1..]
            .iter()
            .all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit())
}

pub fn is_valid_node_name(name: &str) -> bool {
    is_valid_pack_name(name)
}

pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 6
        && key
            .bytes()
            .all(|ch| !matches!(ch, b' ' | b'/' | b'.' | b',' | b';'))
}

/// A file cycle as written in a control statement: absolute 1..999,
/// or relative -31..0 / +1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileCycleSpecification {
    Absolute(u32),
    Relative(i32),
}

/// A parsed file specification:
/// `[[qualifier] '*'] filename [(cycle)] [/rkey[/wkey]] [.]`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileSpecification {
    pub qualifier: Option<String>,
    pub filename: String,
    pub file_cycle: Option<FileCycleSpecification>,
    pub read_key: Option<String>,
    pub write_key: Option<String>,
}

impl FileSpecification {
    /// Effective qualifier: the explicit one, the implied qualifier when the
    /// image had a bare `*`, or the default qualifier otherwise.
    pub fn effective_qualifier(&self, implied: &str, default: &str) -> String {
        match &self.qualifier {
            Some(q) if q.is_empty() => implied.to_string(),
            Some(q) => q.clone(),
            None => default.to_string(),
        }
    }

    pub fn parse(input: &str) -> Result<FileSpecification, FacStatusCode> {
        let mut rest = input.trim();
        if let Some(stripped) = rest.strip_suffix('.') {
            rest = stripped;
        }
        if rest.is_empty() {
            return Err(FacStatusCode::FilenameIsRequired);
        }

        let mut spec = FileSpecification::default();

        if let Some(star) = rest.find('*') {
            let qualifier = &rest[..star];
            if !qualifier.is_empty() && !is_valid_qualifier(qualifier) {
                return Err(FacStatusCode::SyntaxErrorInImage);
            }
            spec.qualifier = Some(qualifier.to_string());
            rest = &rest[star + 1..];
        }

        // keys come after the first '/'
        if let Some(slash) = rest.find('/') {
            let keys = &rest[slash + 1..];
            rest = &rest[..slash];
            let (rkey, wkey) = match keys.find('/') {
                Some(kx) => (&keys[..kx], &keys[kx + 1..]),
                None => (keys, ""),
            };
            if !rkey.is_empty() {
                if !is_valid_key(rkey) {
                    return Err(FacStatusCode::SyntaxErrorInImage);
                }
                spec.read_key = Some(rkey.to_string());
            }
            if !wkey.is_empty() {
                if !is_valid_key(wkey) {
                    return Err(FacStatusCode::SyntaxErrorInImage);
                }
                spec.write_key = Some(wkey.to_string());
            }
        }

        // cycle in parentheses
        if let Some(open) = rest.find('(') {
            let close = rest.find(')').ok_or(FacStatusCode::SyntaxErrorInImage)?;
            if close < open || close != rest.len() - 1 {
                return Err(FacStatusCode::SyntaxErrorInImage);
            }
            spec.file_cycle = Some(parse_cycle(&rest[open + 1..close])?);
            rest = &rest[..open];
        }

        if !is_valid_filename(rest) {
            return Err(if rest.is_empty() {
                FacStatusCode::FilenameIsRequired
            } else {
                FacStatusCode::SyntaxErrorInImage
            });
        }
        spec.filename = rest.to_string();
        Ok(spec)
    }
}

fn parse_cycle(text: &str) -> Result<FileCycleSpecification, FacStatusCode> {
    if text.is_empty() {
        return Err(FacStatusCode::SyntaxErrorInImage);
    }

    if let Some(neg) = text.strip_prefix('-') {
        let value: u32 = neg
            .parse()
            .map_err(|_| FacStatusCode::SyntaxErrorInImage)?;
        if value == 0 || value > 31 {
            return Err(FacStatusCode::FileCycleOutOfRange);
        }
        return Ok(FileCycleSpecification::Relative(-(value as i32)));
    }

    if let Some(pos) = text.strip_prefix('+') {
        if pos != "1" {
            return Err(FacStatusCode::SyntaxErrorInImage);
        }
        return Ok(FileCycleSpecification::Relative(1));
    }

    let value: u32 = text
        .parse()
        .map_err(|_| FacStatusCode::SyntaxErrorInImage)?;
    if value == 0 {
        return Ok(FileCycleSpecification::Relative(0));
    }
    if value > MAX_ABSOLUTE_CYCLE {
        return Err(FacStatusCode::FileCycleOutOfRange);
    }
    Ok(FileCycleSpecification::Absolute(value))
}

// Option letters occupy one bit each in a 26-bit word, A highest.
pub const OPT_B: u32 = option_bit(b'B');
pub const OPT_G: u32 = option_bit(b'G');
pub const OPT_P: u32 = option_bit(b'P');
pub const OPT_R: u32 = option_bit(b'R');
pub const OPT_V: u32 = option_bit(b'V');
pub const OPT_W: u32 = option_bit(b'W');
pub const OPT_Z: u32 = option_bit(b'Z');

const fn option_bit(letter: u8) -> u32 {
    1 << (25 - (letter - b'A'))
}

/// Composes an option word from a run of letters; fails with the offending
/// character.
pub fn compose_options(letters: &str) -> Result<u32, char> {
    let mut word = 0u32;
    for ch in letters.bytes() {
        let upper = ch.to_ascii_uppercase();
        if !upper.is_ascii_uppercase() {
            return Err(ch as char);
        }
        word |= option_bit(upper);
    }
    Ok(word)
}

/// Letters present in an option word, in alphabetical order.
pub fn option_letters(word: u32) -> String {
    (b'A'..=b'Z')
        .filter(|&letter| word & option_bit(letter) != 0)
        .map(char::from)
        .collect()
}

/// Finds the first option set in `word` but absent from `allowed`.
pub fn first_illegal_option(word: u32, allowed: u32) -> Option<char> {
    option_letters(word & !allowed).chars().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_validation() {
        assert!(is_valid_qualifier("SYS$"));
        assert!(is_valid_filename("A-12$Z"));
        assert!(!is_valid_filename(""));
        assert!(!is_valid_filename("TOOLONGFILENAME"));
        assert!(!is_valid_filename("lower"));
        assert!(is_valid_pack_name("FIX000"));
        assert!(!is_valid_pack_name("0FIX"));
        assert!(!is_valid_pack_name("FIXED00"));
        assert!(is_valid_key("K3Y*"));
        assert!(!is_valid_key("BAD.K"));
    }

    #[test]
    fn full_specification_parses() {
        let spec = FileSpecification::parse("TEST*FILE(3)/RKEY/WKEY.").unwrap();
        assert_eq!(spec.qualifier.as_deref(), Some("TEST"));
        assert_eq!(spec.filename, "FILE");
        assert_eq!(spec.file_cycle, Some(FileCycleSpecification::Absolute(3)));
        assert_eq!(spec.read_key.as_deref(), Some("RKEY"));
        assert_eq!(spec.write_key.as_deref(), Some("WKEY"));
    }

    #[test]
    fn bare_star_keeps_empty_qualifier() {
        let spec = FileSpecification::parse("*FILE").unwrap();
        assert_eq!(spec.qualifier.as_deref(), Some(""));
        assert_eq!(spec.effective_qualifier("RUNQ", "DEFQ"), "RUNQ");

        let spec = FileSpecification::parse("FILE").unwrap();
        assert_eq!(spec.qualifier, None);
        assert_eq!(spec.effective_qualifier("RUNQ", "DEFQ"), "DEFQ");
    }

    #[test]
    fn relative_cycles_parse() {
        assert_eq!(
            FileSpecification::parse("F(+1)").unwrap().file_cycle,
            Some(FileCycleSpecification::Relative(1))
        );
        assert_eq!(
            FileSpecification::parse("F(0)").unwrap().file_cycle,
            Some(FileCycleSpecification::Relative(0))
        );
        assert_eq!(
            FileSpecification::parse("F(-31)").unwrap().file_cycle,
            Some(FileCycleSpecification::Relative(-31))
        );
        assert!(FileSpecification::parse("F(-32)").is_err());
        assert!(FileSpecification::parse("F(1000)").is_err());
        assert!(FileSpecification::parse("F(+2)").is_err());
    }

    #[test]
    fn malformed_images_are_rejected() {
        assert!(FileSpecification::parse("").is_err());
        assert!(FileSpecification::parse("Q*").is_err());
        assert!(FileSpecification::parse("F(").is_err());
        assert!(FileSpecification::parse("bad*file").is_err());
    }

    #[test]
    fn option_word_round_trip() {
        let word = compose_options("GZB").unwrap();
        assert_eq!(option_letters(word), "BGZ");
        assert_eq!(word & OPT_G, OPT_G);
        assert_eq!(first_illegal_option(word, OPT_B | OPT_G), Some('Z'));
        assert_eq!(first_illegal_option(word, OPT_B | OPT_G | OPT_Z), None);
    }
}
