//! Sequential stack name suffixes drawn from the phonetic alphabet.
//!
//! A suffix is one or more hyphen-joined alphabet words (`ALPHA`,
//! `ZULU`, `ALPHA-BRAVO`). Suffixes order first by segment count and then
//! word by word by alphabet position, so the successor of `ZULU` is
//! `ALPHA-ALPHA` and sorts after it. The ordering is carried by [`Suffix`]
//! itself rather than by string comparison of resource names.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use error_stack::Report;

use super::error::NamingError;

/// Phonetic alphabet, in suffix order.
pub const ALPHABET: [&str; 26] = [
    "ALPHA", "BRAVO", "CHARLIE", "DELTA", "ECHO", "FOXTROT", "GOLF", "HOTEL", "INDIA", "JULIETT",
    "KILO", "LIMA", "MIKE", "NOVEMBER", "OSCAR", "PAPA", "QUEBEC", "ROMEO", "SIERRA", "TANGO",
    "UNIFORM", "VICTOR", "WHISKEY", "XRAY", "YANKEE", "ZULU",
];

const SEPARATOR: char = '-';

/// A parsed stack name suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Suffix {
    /// Alphabet indices, most significant segment first. Never empty.
    segments: Vec<usize>,
}

impl Suffix {
    /// The suffix given to the very first stack.
    pub fn first() -> Self {
        Self { segments: vec![0] }
    }

    pub fn parse(value: &str) -> Result<Self, Report<NamingError>> {
        let segments = value
            .split(SEPARATOR)
            .map(|word| {
                ALPHABET.iter().position(|known| *known == word).ok_or_else(|| {
                    Report::new(NamingError::UnknownWord {
                        word: word.to_string(),
                        suffix: value.to_string(),
                    })
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { segments })
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Returns the next suffix in order.
    ///
    /// The last segment is incremented; on overflow it wraps to `ALPHA` and
    /// carries into the previous segment. A carry out of the first segment
    /// prepends a new `ALPHA` segment, which fails once the result would
    /// exceed `max_segments`.
    pub fn successor(&self, max_segments: usize) -> Result<Self, Report<NamingError>> {
        if max_segments == 0 {
            return Err(Report::new(NamingError::InvalidLimit));
        }
        if self.segments.len() > max_segments {
            return Err(self.segment_limit(max_segments).attach_printable(format!(
                "suffix already has {} segment(s)",
                self.segments.len()
            )));
        }

        let mut segments = self.segments.clone();
        for slot in segments.iter_mut().rev() {
            if *slot + 1 < ALPHABET.len() {
                *slot += 1;
                return Ok(Self { segments });
            }
            *slot = 0;
        }

        if segments.len() + 1 > max_segments {
            return Err(self.segment_limit(max_segments));
        }
        segments.insert(0, 0);
        Ok(Self { segments })
    }

    fn segment_limit(&self, max_segments: usize) -> Report<NamingError> {
        Report::new(NamingError::SegmentLimit {
            suffix: self.to_string(),
            max_segments,
        })
    }
}

impl fmt::Display for Suffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, index) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, "{SEPARATOR}")?;
            }
            f.write_str(ALPHABET[*index])?;
        }
        Ok(())
    }
}

impl FromStr for Suffix {
    type Err = Report<NamingError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Ord for Suffix {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments
            .len()
            .cmp(&other.segments.len())
            .then_with(|| self.segments.cmp(&other.segments))
    }
}

impl PartialOrd for Suffix {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Computes the suffix that follows `current`.
///
/// An empty `current` means no stack exists yet and yields `ALPHA`.
pub fn next(current: &str, max_segments: usize) -> Result<Suffix, Report<NamingError>> {
    if max_segments == 0 {
        return Err(Report::new(NamingError::InvalidLimit));
    }
    if current.is_empty() {
        return Ok(Suffix::first());
    }
    Suffix::parse(current)?.successor(max_segments)
}
