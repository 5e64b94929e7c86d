//! Memory-size parsing: the `p`/`M`/`G`/`k` suffix grammar shared by the
//! daemon's preload flags and the CLI tool's amount arguments.
//!
//! Grounded on the original `parse_memsize`, which scaled mebibyte/gibibyte
//! suffixes against the kernel's page size rather than a fixed constant;
//! this port does the same via [`page_size`] instead of a compile-time
//! `EXEC_PAGESIZE`.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemSizeError {
    #[error("'{0}' is not a number")]
    NotANumber(String),
    #[error("memory size must be positive")]
    Negative,
    #[error("'{0}' has no unit modifier")]
    NoModifier(String),
    #[error("bad memory size modifier")]
    BadModifier,
    #[error("value out of range for a page count")]
    OutOfRange,
}

/// Parses an amount string such as `"4p"`, `"512M"`, `"2G"`, or `"64k"` into
/// a page count. `k`/`M`/`G` are binary (kibi/mebi/gibi) and scaled against
/// `page_size_bytes`; `p` is a literal page count. `k` is an
/// `original_source`-derived extension beyond the core `p`/`M`/`G` grammar.
pub fn parse_amount(input: &str, page_size_bytes: i64) -> Result<i32, MemSizeError> {
    let (digits, suffix) = split_suffix(input)?;
    let value: i64 = digits
        .parse()
        .map_err(|_| MemSizeError::NotANumber(input.to_owned()))?;
    if value < 0 {
        return Err(MemSizeError::Negative);
    }
    let multiplier = match suffix {
        'p' => 1,
        'k' => 1024 / page_size_bytes.max(1),
        'M' => (1024 * 1024) / page_size_bytes.max(1),
        'G' => (1024 * 1024 * 1024) / page_size_bytes.max(1),
        _ => return Err(MemSizeError::BadModifier),
    };
    let pages = value.checked_mul(multiplier).ok_or(MemSizeError::OutOfRange)?;
    i32::try_from(pages).map_err(|_| MemSizeError::OutOfRange)
}

fn split_suffix(input: &str) -> Result<(&str, char), MemSizeError> {
    let suffix = input
        .chars()
        .last()
        .ok_or_else(|| MemSizeError::NoModifier(input.to_owned()))?;
    if suffix.is_ascii_digit() {
        return Err(MemSizeError::NoModifier(input.to_owned()));
    }
    let digits = &input[..input.len() - suffix.len_utf8()];
    if digits.is_empty() {
        return Err(MemSizeError::NotANumber(input.to_owned()));
    }
    Ok((digits, suffix))
}

/// Computes "all pages except `except`", i.e. `kernel_total_pages - except`,
/// given the kernel-reported `MemTotal` in kibibytes.
pub fn all_except_pages(mem_total_kb: u64, except_pages: i32, page_size_bytes: i64) -> i32 {
    let total_pages = (mem_total_kb as i64) * 1024 / page_size_bytes.max(1);
    (total_pages - i64::from(except_pages)) as i32
}

/// The running kernel's page size, queried via `sysconf(_SC_PAGESIZE)` on
/// Unix. Falls back to 4096 (the overwhelmingly common value, and what the
/// original's `EXEC_PAGESIZE` resolved to on its target platforms) if the
/// platform doesn't support the query.
#[cfg(unix)]
pub fn page_size() -> i64 {
    // SAFETY: sysconf with a well-known name is infallible in the sense
    // that matters here; a negative return just means "unknown", handled
    // below.
    let got = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if got > 0 {
        got
    } else {
        4096
    }
}

#[cfg(not(unix))]
pub fn page_size() -> i64 {
    4096
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const PAGE: i64 = 4096;

    #[rstest]
    #[case("4p", 4)]
    #[case("1M", 256)]
    #[case("1G", 262144)]
    #[case("64k", 16)]
    #[case("0p", 0)]
    fn parses_valid_amounts(#[case] input: &str, #[case] expected: i32) {
        assert_eq!(parse_amount(input, PAGE), Ok(expected));
    }

    #[test]
    fn rejects_missing_modifier() {
        assert_eq!(
            parse_amount("42", PAGE),
            Err(MemSizeError::NoModifier("42".to_string()))
        );
    }

    #[test]
    fn rejects_negative() {
        assert_eq!(parse_amount("-4p", PAGE), Err(MemSizeError::Negative));
    }

    #[test]
    fn rejects_unknown_modifier() {
        assert_eq!(parse_amount("4Q", PAGE), Err(MemSizeError::BadModifier));
    }

    #[test]
    fn rejects_non_numeric() {
        assert_eq!(
            parse_amount("abcM", PAGE),
            Err(MemSizeError::NotANumber("abcM".to_string()))
        );
    }

    #[test]
    fn all_except_subtracts_from_kernel_total() {
        // 1048576 kB total (1 GiB), reserve all but 1024 pages.
        assert_eq!(all_except_pages(1_048_576, 1024, PAGE), 261_120);
    }
}
