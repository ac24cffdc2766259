use std::collections::HashSet;
use std::fmt;

use super::KANJI_MARKER;

/// A DOS 8.3 name: 8 name bytes plus 3 extension bytes, space padded,
/// uppercase. "." and ".." are the dot-entry sentinels.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortName {
    bytes: [u8; 11],
}

impl ShortName {
    pub fn from_bytes(bytes: [u8; 11]) -> Self {
        Self { bytes }
    }

    pub fn from_name_and_extension(name: &str, extension: &str) -> Self {
        let mut bytes = [b' '; 11];
        for (out, byte) in bytes[..8].iter_mut().zip(name.bytes()) {
            *out = byte;
        }
        for (out, byte) in bytes[8..].iter_mut().zip(extension.bytes()) {
            *out = byte;
        }
        Self { bytes }
    }

    pub fn dot() -> Self {
        Self::from_name_and_extension(".", "")
    }

    pub fn dotdot() -> Self {
        Self::from_name_and_extension("..", "")
    }

    pub fn bytes(&self) -> [u8; 11] {
        self.bytes
    }

    /// The one-byte rotate-and-add checksum binding LFN entries to their
    /// short entry.
    pub fn checksum(&self) -> u8 {
        self.bytes
            .iter()
            .fold(0u8, |sum, &byte| sum.rotate_right(1).wrapping_add(byte))
    }
}

impl fmt::Display for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unescape = |index: usize, byte: u8| {
            if index == 0 && byte == KANJI_MARKER {
                0xE5 as char
            } else {
                byte as char
            }
        };

        if let Some(end) = self.bytes[..8].iter().rposition(|&b| b != b' ') {
            for index in 0..=end {
                write!(f, "{}", unescape(index, self.bytes[index]))?;
            }
        }

        let extension_end = self.bytes[8..].iter().rposition(|&b| b != b' ');
        if let Some(end) = extension_end {
            write!(f, ".")?;
            for &byte in &self.bytes[8..8 + end + 1] {
                write!(f, "{}", byte as char)?;
            }
        }

        Ok(())
    }
}

impl fmt::Debug for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortName({self})")
    }
}

/// Derives a free 8.3 name for `long_name` against the directory's set of
/// names already taken: sanitize and truncate first, then probe `~N` tails,
/// switching the stem to a hash of the original name when plain tails run
/// out.
pub fn generate_short_name(long_name: &str, existing: &HashSet<ShortName>) -> ShortName {
    let (stem, extension) = match long_name.rfind('.') {
        Some(position) if position > 0 => (&long_name[..position], &long_name[position + 1..]),
        _ => (long_name, ""),
    };

    let stem = sanitize(stem);
    let extension = sanitize(extension);
    let stem: String = stem.chars().take(8).collect();
    let extension: String = extension.chars().take(3).collect();

    let candidate = ShortName::from_name_and_extension(&stem, &extension);
    if !existing.contains(&candidate) {
        return candidate;
    }

    for tail_number in 1u32.. {
        let tail = format!("~{tail_number}");
        let prefix: String = if tail_number < 5 {
            stem.chars().take(8 - tail.len()).collect()
        } else {
            format!("{:04X}", name_hash(long_name))
        };

        let candidate = ShortName::from_name_and_extension(&format!("{prefix}{tail}"), &extension);
        if !existing.contains(&candidate) {
            return candidate;
        }
    }

    unreachable!()
}

fn sanitize(part: &str) -> String {
    part.chars()
        .filter(|c| *c != '.' && !c.is_whitespace())
        .map(strip_accent)
        .map(|c| {
            let upper = c.to_ascii_uppercase();
            if upper.is_ascii_alphanumeric() || "$%'-_@~`!(){}^#&".contains(upper) {
                upper
            } else {
                '_'
            }
        })
        .collect()
}

/// Folds Latin-1 accented letters to their base ASCII letter; everything
/// else falls through to the allowlist above.
fn strip_accent(c: char) -> char {
    match c {
        'à'..='å' | 'À'..='Å' => 'a',
        'è'..='ë' | 'È'..='Ë' => 'e',
        'ì'..='ï' | 'Ì'..='Ï' => 'i',
        'ò'..='ö' | 'Ò'..='Ö' => 'o',
        'ù'..='ü' | 'Ù'..='Ü' => 'u',
        'ý' | 'ÿ' | 'Ý' => 'y',
        'ç' | 'Ç' => 'c',
        'ñ' | 'Ñ' => 'n',
        _ => c,
    }
}

fn name_hash(name: &str) -> u16 {
    name.bytes()
        .fold(0u16, |hash, byte| {
            hash.rotate_left(5).wrapping_add(u16::from(byte))
        })
}
