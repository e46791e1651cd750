//! Server version parsing and comparison.
//!
//! Versions use the `MAJOR * 10000 + MINOR * 100 + PATCH` layout of `server_version_num`.

use std::num::NonZeroI32;

pub const POSTGRES_13: i32 = 130000;
pub const POSTGRES_15: i32 = 150000;

/// Parses the `server_version` startup parameter, e.g. `16.2 (Debian 16.2-1.pgdg120+2)`.
///
/// Releases from 10 onwards have two components (`major.minor`), older ones three.
pub fn extract_server_version(server_version: impl AsRef<str>) -> Option<NonZeroI32> {
    let version = server_version.as_ref().split_whitespace().next()?;
    let mut parts = version.split('.').map(leading_number);

    let major = parts.next()??;
    let version = if major >= 10 {
        major * 10000 + parts.next().flatten().unwrap_or(0)
    } else {
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);
        major * 10000 + minor * 100 + patch
    };

    NonZeroI32::new(version)
}

fn leading_number(part: &str) -> Option<i32> {
    let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Returns `true` when the version is known and at least `required`.
pub fn meets_version(server_version: Option<NonZeroI32>, required: i32) -> bool {
    server_version.is_some_and(|version| version.get() >= required)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_version_strings() {
        assert_eq!(
            extract_server_version("16.2 (Debian 16.2-1.pgdg120+2)").map(NonZeroI32::get),
            Some(160002)
        );
        assert_eq!(extract_server_version("15beta1").map(NonZeroI32::get), Some(150000));
        assert_eq!(extract_server_version("14.11").map(NonZeroI32::get), Some(140011));
        assert_eq!(extract_server_version("devel").map(NonZeroI32::get), None);
        assert_eq!(extract_server_version("9.6.24").map(NonZeroI32::get), Some(90624));
    }

    #[test]
    fn unknown_version_never_meets_requirement() {
        assert!(!meets_version(None, POSTGRES_13));
        assert!(meets_version(NonZeroI32::new(160000), POSTGRES_15));
    }
}
