//! Parses the attested-key wire format delivered in a user's active-keys
//! blob into individual records, preserving the exact signed-data bytes
//! each record's signature covers.
//!
//! The grammar is line-delimited, not token-delimited, so this is a
//! hand-written state machine rather than a `pom` combinator grammar —
//! `pom` stays reserved for the agent's own invocation-argument validation
//! in [`crate::cli`], where a combinator grammar is the better fit.

use base64::Engine;

/// One parsed attested-key record.
///
/// `signed_data` is the exact byte-for-byte concatenation of the record's
/// metadata lines followed by its key line, each terminated by a single
/// `\n`, in on-wire order — this, not any re-serialization, is what the
/// signature covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestedKeyRecord {
    pub timestamp: Option<i64>,
    pub instance_id: Option<String>,
    pub caller: Option<String>,
    pub request_id: Option<String>,
    pub key_line: String,
    pub signed_data: Vec<u8>,
    signature_b64: String,
}

impl AttestedKeyRecord {
    /// Base64-decodes the accumulated signature text.
    pub fn decode_signature(&self) -> Option<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.signature_b64)
            .ok()
    }
}

/// Parses a blob of one or more attested-key records.
///
/// Returns a `Vec` rather than a true lazy iterator in this revision —
/// active-keys blobs are bounded by the metadata service's own response
/// size limits, so buffering the parsed records costs nothing the raw
/// bytes didn't already cost, and callers (`KeyAuthorizer`) consume the
/// whole set in order regardless.
pub fn parse(blob: &[u8]) -> Vec<AttestedKeyRecord> {
    let text = String::from_utf8_lossy(blob);
    let mut records = Vec::new();
    let mut lines = text.lines().peekable();

    while lines.peek().is_some() {
        match parse_one_record(&mut lines) {
            Some(record) => records.push(record),
            None => continue, // discarded up to the next blank line or EOF
        }
    }

    records
}

/// Parses one record starting at the iterator's current position, leaving
/// it positioned just after the blank-line separator (or at EOF).
///
/// Returns `None` if the lines consumed didn't form a valid
/// metadata-then-key-then-signature sequence; in that case the lines up to
/// the next blank line (or EOF) have already been discarded.
fn parse_one_record<'a>(
    lines: &mut std::iter::Peekable<std::str::Lines<'a>>,
) -> Option<AttestedKeyRecord> {
    let mut timestamp = None;
    let mut instance_id = None;
    let mut caller = None;
    let mut request_id = None;
    let mut signed_data = Vec::new();

    while let Some(line) = lines.peek() {
        if line.is_empty() {
            lines.next();
            return None; // metadata with no key line: malformed
        }

        if line.starts_with('#') {
            let line = lines.next().unwrap();
            if let Some(rest) = line.strip_prefix("#Timestamp=") {
                timestamp = rest.trim().parse().ok();
            } else if let Some(rest) = line.strip_prefix("#Instance=") {
                instance_id = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("#Caller=") {
                caller = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("#Request=") {
                request_id = Some(rest.trim().to_string());
            }
            signed_data.extend_from_slice(line.as_bytes());
            signed_data.push(b'\n');
            continue;
        }

        if line.starts_with("ssh") {
            let key_line = lines.next().unwrap().to_string();
            signed_data.extend_from_slice(key_line.as_bytes());
            signed_data.push(b'\n');

            let signature_b64 = collect_signature(lines);

            return Some(AttestedKeyRecord {
                timestamp,
                instance_id,
                caller,
                request_id,
                key_line,
                signed_data,
                signature_b64,
            });
        }

        // Garbage before a key line was found: discard up to the next
        // blank line or EOF and report no record.
        for line in lines.by_ref() {
            if line.is_empty() {
                break;
            }
        }
        return None;
    }

    None
}

/// Consumes continuation lines as signature text until a blank line or EOF,
/// concatenating them with no interior whitespace.
fn collect_signature<'a>(lines: &mut std::iter::Peekable<std::str::Lines<'a>>) -> String {
    let mut signature = String::new();
    while let Some(line) = lines.peek() {
        if line.is_empty() {
            lines.next();
            break;
        }
        signature.push_str(lines.next().unwrap().trim());
    }
    signature
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_well_formed_record() {
        let blob = "#Timestamp=1999999999\n#Instance=i-0123456789abcdef0\n#Caller=ops\nssh-ed25519 AAAAC3 comment\nc2lnbmF0dXJl\n";
        let records = parse(blob.as_bytes());
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.timestamp, Some(1999999999));
        assert_eq!(record.instance_id.as_deref(), Some("i-0123456789abcdef0"));
        assert_eq!(record.caller.as_deref(), Some("ops"));
        assert_eq!(record.key_line, "ssh-ed25519 AAAAC3 comment");
        assert_eq!(
            record.signed_data,
            b"#Timestamp=1999999999\n#Instance=i-0123456789abcdef0\n#Caller=ops\nssh-ed25519 AAAAC3 comment\n".to_vec()
        );
    }

    #[test]
    fn preserves_unrecognized_metadata_lines_in_signed_data() {
        let blob = "#Timestamp=1999999999\n#Weird=whatever\nssh-ed25519 AAAAC3\nc2ln\n";
        let records = parse(blob.as_bytes());
        assert_eq!(records.len(), 1);
        assert!(records[0]
            .signed_data
            .windows(b"#Weird=whatever\n".len())
            .any(|w| w == b"#Weird=whatever\n"));
    }

    #[test]
    fn discards_garbage_until_next_blank_line() {
        let blob = "garbage line one\ngarbage line two\n\n#Timestamp=1999999999\n#Instance=i-0123456789abcdef0\nssh-ed25519 AAAAC3\nc2ln\n";
        let records = parse(blob.as_bytes());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].instance_id.as_deref(), Some("i-0123456789abcdef0"));
    }

    #[test]
    fn multiple_records_preserve_order() {
        let blob = "\
#Timestamp=1999999999
#Instance=i-aaaaaaaaaaaaaaaaa
ssh-ed25519 FIRST
c2ln

#Timestamp=1999999999
#Instance=i-bbbbbbbbbbbbbbbbb
ssh-ed25519 SECOND
c2ln
";
        let records = parse(blob.as_bytes());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key_line, "ssh-ed25519 FIRST");
        assert_eq!(records[1].key_line, "ssh-ed25519 SECOND");
    }

    #[test]
    fn multiline_signature_concatenates_without_whitespace() {
        let blob = "#Timestamp=1999999999\n#Instance=i-0123456789abcdef0\nssh-ed25519 AAAAC3\nc2ln\nbmF0dXJl\n";
        let records = parse(blob.as_bytes());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].signature_b64, "c2lnbmF0dXJl");
    }
}
