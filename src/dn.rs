//! Distinguished name splitting.
//!
//! Only what rename needs: separating the leading RDN from its parent while
//! honoring backslash escapes and quoted values.

use crate::error::{LdapError, LdapResult};

/// Byte offsets of the unescaped, unquoted RDN separators in `dn`.
fn separators(dn: &str) -> LdapResult<Vec<usize>> {
    let mut out = Vec::new();
    let mut escaped = false;
    let mut quoted = false;
    for (i, c) in dn.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => quoted = !quoted,
            ',' | ';' if !quoted => out.push(i),
            _ => {}
        }
    }
    if escaped || quoted {
        return Err(LdapError::config(format!("Malformed DN: {}", dn)));
    }
    Ok(out)
}

fn check_rdn(rdn: &str, dn: &str) -> LdapResult<()> {
    match rdn.split_once('=') {
        Some((attr, _)) if !attr.trim().is_empty() => Ok(()),
        _ => Err(LdapError::config(format!(
            "Malformed DN {}: component '{}' is not attr=value",
            dn, rdn
        ))),
    }
}

/// Splits `dn` into its leading RDN and parent DN. The parent is `None` for a
/// single-component DN.
pub fn split_rdn(dn: &str) -> LdapResult<(String, Option<String>)> {
    let dn = dn.trim();
    if dn.is_empty() {
        return Err(LdapError::config("DN is empty"));
    }
    let seps = separators(dn)?;
    let mut start = 0;
    for &end in seps.iter().chain(std::iter::once(&dn.len())) {
        check_rdn(dn[start..end].trim(), dn)?;
        start = end + 1;
    }
    match seps.first() {
        Some(&first) => Ok((
            dn[..first].trim().to_string(),
            Some(dn[first + 1..].trim().to_string()),
        )),
        None => Ok((dn.to_string(), None)),
    }
}

/// Leading RDN of `dn`.
pub fn rdn(dn: &str) -> LdapResult<String> {
    split_rdn(dn).map(|(rdn, _)| rdn)
}

/// Parent of `dn`, `None` for a single-component DN.
pub fn parent(dn: &str) -> LdapResult<Option<String>> {
    split_rdn(dn).map(|(_, parent)| parent)
}
