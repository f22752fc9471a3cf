//! `AuthorizedKeysAgent` invocation-argument handling.
//!
//! The argument surface is two optional positional strings, not a
//! multi-flag CLI, so this reads `std::env::args()` directly rather than
//! pulling in `clap`. The one piece worth a combinator grammar — validating
//! the shape of an optional fingerprint argument — reuses `pom`, the same
//! parser-combinator crate [`crate::attested_key`] deliberately avoids for
//! its own line-oriented grammar.

use pom::utf8::{end, one_of, seq, Parser};

use crate::error::Error;

/// The parsed invocation arguments.
pub struct Args {
    pub user: String,
    pub expected_fingerprint: Option<String>,
}

/// Parses `std::env::args()` (excluding argv[0]) into [`Args`].
///
/// A missing user argument is `Error::InputError`. A present-but-malformed
/// fingerprint argument is also `Error::InputError` — rejected outright
/// rather than treated as a filter that will simply never match.
pub fn parse_args(args: impl Iterator<Item = String>) -> Result<Args, Error> {
    let mut args = args.skip(1);

    let user = args.next().ok_or_else(|| Error::input("missing required user argument"))?;
    if user.is_empty() {
        return Err(Error::input("empty user argument"));
    }

    let expected_fingerprint = match args.next() {
        Some(raw) => {
            validate_fingerprint(&raw)?;
            Some(raw)
        }
        None => None,
    };

    Ok(Args {
        user,
        expected_fingerprint,
    })
}

fn base64_char<'a>() -> Parser<'a, char> {
    one_of("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/=")
}

/// Parser for the standard SSH fingerprint shape: `SHA256:` followed by one
/// or more base64 characters.
fn fingerprint<'a>() -> Parser<'a, &'a str> {
    ((seq("SHA256:") * base64_char().repeat(1..).collect()) - end()).name("ssh fingerprint")
}

fn validate_fingerprint(raw: &str) -> Result<(), Error> {
    fingerprint()
        .parse_str(raw)
        .map(|_| ())
        .map_err(|e| Error::input(format!("malformed fingerprint argument: {e}")))
}
