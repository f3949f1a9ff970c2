//! Output verification against a case's expected fragments.

/// Result of checking one captured buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification<'a> {
    /// First fragment that was not found, if any.
    pub missing: Option<&'a str>,
    /// The buffer that was checked, kept for diagnostics.
    pub output: &'a [u8],
}

impl Verification<'_> {
    pub fn passed(&self) -> bool {
        self.missing.is_none()
    }

    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(self.output).into_owned()
    }
}

/// Check `fragments` against `output` in list order.
///
/// Each fragment is searched for in the whole buffer; relative position is
/// not enforced. The scan stops at the first miss, so fragments after it are
/// never looked at.
pub fn verify<'a, S>(output: &'a [u8], fragments: &'a [S]) -> Verification<'a>
where
    S: AsRef<str>,
{
    let missing = fragments
        .iter()
        .map(|fragment| fragment.as_ref())
        .find(|fragment| !contains(output, fragment.as_bytes()));

    Verification { missing, output }
}

/// Exact byte-substring search.
pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}
