use crate::error::StrataError;

/// Parses a byte count with an optional `KB`/`MB`/`GB` suffix (powers of
/// 1024, case-insensitive). Bare integers are taken as bytes.
pub fn parse_byte_size(raw: &str) -> Result<u64, StrataError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(StrataError::config("empty byte size"));
    }

    let (digits, multiplier) = match s.len().checked_sub(2).map(|i| s.split_at(i)) {
        Some((head, tail)) if tail.eq_ignore_ascii_case("kb") => (head, 1024u64),
        Some((head, tail)) if tail.eq_ignore_ascii_case("mb") => (head, 1024 * 1024),
        Some((head, tail)) if tail.eq_ignore_ascii_case("gb") => (head, 1024 * 1024 * 1024),
        _ => (s, 1),
    };

    let digits = digits.trim();
    let value: u64 = digits
        .parse()
        .map_err(|_| StrataError::config(format!("invalid byte size {raw:?}")))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| StrataError::config(format!("byte size overflow: {raw:?}")))
}

/// Chunk close condition for the writer: either a payload byte budget or a
/// sample count budget, exactly one of which must be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkBudget {
    Bytes(u64),
    Samples(u32),
}

impl ChunkBudget {
    pub fn validate(&self) -> Result<(), StrataError> {
        match self {
            ChunkBudget::Bytes(0) => Err(StrataError::config("chunk_bytes must be > 0")),
            ChunkBudget::Samples(0) => Err(StrataError::config("chunk_size must be > 0")),
            _ => Ok(()),
        }
    }

    /// Resolves the writer options `chunk_bytes` / `chunk_size`, enforcing
    /// that exactly one is present.
    pub fn from_options(
        chunk_bytes: Option<u64>,
        chunk_size: Option<u32>,
    ) -> Result<Self, StrataError> {
        let budget = match (chunk_bytes, chunk_size) {
            (Some(bytes), None) => ChunkBudget::Bytes(bytes),
            (None, Some(samples)) => ChunkBudget::Samples(samples),
            (None, None) => {
                return Err(StrataError::config(
                    "one of chunk_bytes or chunk_size is required",
                ))
            }
            (Some(_), Some(_)) => {
                return Err(StrataError::config(
                    "chunk_bytes and chunk_size are mutually exclusive",
                ))
            }
        };
        budget.validate()?;
        Ok(budget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_suffixed_sizes() {
        assert_eq!(parse_byte_size("1024").unwrap(), 1024);
        assert_eq!(parse_byte_size("64KB").unwrap(), 64 * 1024);
        assert_eq!(parse_byte_size("100mb").unwrap(), 100 * 1024 * 1024);
        assert_eq!(parse_byte_size(" 2GB ").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size("MB").is_err());
        assert!(parse_byte_size("12TB").is_err());
        assert!(parse_byte_size("-5MB").is_err());
    }

    #[test]
    fn budget_requires_exactly_one_bound() {
        assert!(ChunkBudget::from_options(None, None).is_err());
        assert!(ChunkBudget::from_options(Some(1), Some(1)).is_err());
        assert_eq!(
            ChunkBudget::from_options(Some(64), None).unwrap(),
            ChunkBudget::Bytes(64)
        );
        assert_eq!(
            ChunkBudget::from_options(None, Some(8)).unwrap(),
            ChunkBudget::Samples(8)
        );
    }
}
