//! The request-header sieve: a case-insensitive allow-list with rename
//! support, applied to each header line as the request head is rewritten.

use std::cmp::Ordering;
use std::fmt;

/// What to do with one header line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Disposition<'a> {
    /// The name is not allowed; the line is not forwarded.
    Drop,
    /// The name is allowed; forward the line unchanged.
    Forward,
    /// The name is allowed but renamed; forward with the replacement name
    /// and the value untouched.
    Rename(&'a [u8]),
}

/// Compares two header names.
///
/// Names are compared byte-wise after ASCII lowercasing. When one name is a
/// prefix of the other they are only equal if the longer side continues with
/// a colon, so an allow-list entry admits exact names (possibly still
/// carrying their trailing `:` from the wire) and never mere prefixes.
pub(crate) fn name_cmp(a: &[u8], b: &[u8]) -> Ordering {
    let mut i = 0;
    loop {
        match (a.get(i), b.get(i)) {
            (Some(&x), Some(&y)) => {
                let x = x.to_ascii_lowercase();
                let y = y.to_ascii_lowercase();
                if x != y {
                    return x.cmp(&y);
                }
            }
            (None, None) => return Ordering::Equal,
            (None, Some(&y)) => {
                return if y == b':' {
                    Ordering::Equal
                } else {
                    Ordering::Less
                };
            }
            (Some(&x), None) => {
                return if x == b':' {
                    Ordering::Equal
                } else {
                    Ordering::Greater
                };
            }
        }
        i += 1;
    }
}

/// The allow/rename map, built once at startup and immutable afterwards.
pub struct HeaderSieve {
    // sorted by `name_cmp` on the name; empty replacement = forward as-is
    rules: Vec<(Box<[u8]>, Box<[u8]>)>,
}

impl HeaderSieve {
    /// Builds the sieve from the configured allow-list and rename rules.
    ///
    /// A rename rule `Original:Replacement` implies that `Original` is
    /// allowed; explicit allow-list entries never override a rename.
    pub fn build(allowed: &[String], renames: &[String]) -> crate::Result<HeaderSieve> {
        let mut rules: Vec<(Box<[u8]>, Box<[u8]>)> = Vec::new();

        for rule in renames {
            let (original, replacement) = rule
                .split_once(':')
                .ok_or_else(|| crate::Error::new_config(format!("rename rule {:?} is missing a colon", rule)))?;
            if original.is_empty() || replacement.is_empty() {
                return Err(crate::Error::new_config(format!(
                    "rename rule {:?} has an empty side",
                    rule
                )));
            }
            rules.push((
                original.as_bytes().into(),
                replacement.as_bytes().into(),
            ));
        }

        for name in allowed {
            if name.is_empty() {
                return Err(crate::Error::new_config("empty allow-list entry"));
            }
            rules.push((name.as_bytes().into(), Box::default()));
        }

        // rename rules come first, so an allowed duplicate of a renamed
        // header collapses onto the rename
        rules.sort_by(|a, b| name_cmp(&a.0, &b.0));
        rules.dedup_by(|next, first| name_cmp(&first.0, &next.0) == Ordering::Equal);

        Ok(HeaderSieve { rules })
    }

    /// Decides the fate of one header, given its name as it appeared on the
    /// wire (with or without the trailing colon).
    pub(crate) fn disposition(&self, name: &[u8]) -> Disposition<'_> {
        match self.rules.binary_search_by(|(key, _)| name_cmp(key, name)) {
            Ok(i) => {
                let replacement = &self.rules[i].1;
                if replacement.is_empty() {
                    Disposition::Forward
                } else {
                    Disposition::Rename(replacement)
                }
            }
            Err(_) => Disposition::Drop,
        }
    }

    /// Whether `name` would be forwarded at all.
    pub fn admits(&self, name: &str) -> bool {
        self.disposition(name.as_bytes()) != Disposition::Drop
    }

    pub(crate) fn len(&self) -> usize {
        self.rules.len()
    }
}

impl fmt::Debug for HeaderSieve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderSieve")
            .field("rules", &self.rules.len())
            .finish()
    }
}
