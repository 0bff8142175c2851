//! Dotted key paths into documents (`metadata.resourceVersion`, `spec.template.spec.containers`).

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    segments: SmallVec<[String; 4]>,
}

impl FieldPath {
    /// Parse `a.b.c` (a leading `.` is accepted). Bare keys hold ASCII alphanumerics, `_` and `-`;
    /// other keys go in double quotes: `metadata.annotations."deployment.kubernetes.io/revision"`.
    pub fn parse(raw: &str) -> Result<Self> {
        let s = raw.strip_prefix('.').unwrap_or(raw);
        if s.is_empty() {
            return Err(Error::InvalidDocument("empty field path".into()));
        }
        let invalid = || Error::InvalidDocument(format!("invalid field path {:?}", raw));
        let mut segments = SmallVec::new();
        let mut rest = s;
        loop {
            let (seg, tail) = match rest.strip_prefix('"') {
                Some(quoted) => {
                    let end = quoted.find('"').ok_or_else(invalid)?;
                    (&quoted[..end], &quoted[end + 1..])
                }
                None => {
                    let end = rest.find('.').unwrap_or(rest.len());
                    let seg = &rest[..end];
                    if !seg.chars().all(is_bare) {
                        return Err(invalid());
                    }
                    (seg, &rest[end..])
                }
            };
            if seg.is_empty() {
                return Err(invalid());
            }
            segments.push(seg.to_string());
            if tail.is_empty() {
                break;
            }
            rest = tail.strip_prefix('.').ok_or_else(invalid)?;
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True when `keys` spells exactly this path.
    pub fn matches<S: AsRef<str>>(&self, keys: &[S]) -> bool {
        self.segments.len() == keys.len() && self.segments.iter().zip(keys).all(|(a, b)| a == b.as_ref())
    }

    pub fn get<'a>(&self, root: &'a serde_json::Value) -> Option<&'a serde_json::Value> {
        let mut cur = root;
        for seg in self.segments.iter() {
            cur = cur.as_object()?.get(seg)?;
        }
        Some(cur)
    }

    /// Remove the addressed key; returns the removed value if it was there.
    pub fn remove(&self, root: &mut serde_json::Value) -> Option<serde_json::Value> {
        let (last, parents) = self.segments.split_last()?;
        let mut cur = root;
        for seg in parents {
            cur = cur.as_object_mut()?.get_mut(seg)?;
        }
        cur.as_object_mut()?.remove(last)
    }
}

fn is_bare(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            if seg.chars().all(is_bare) {
                f.write_str(seg)?;
            } else {
                write!(f, "\"{}\"", seg)?;
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for FieldPath {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> { Self::parse(s) }
}

impl TryFrom<String> for FieldPath {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> { Self::parse(&s) }
}

impl From<FieldPath> for String {
    fn from(p: FieldPath) -> Self { p.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_simple_paths() {
        assert_eq!(FieldPath::parse(".metadata.uid").unwrap().to_string(), "metadata.uid");
        assert_eq!(FieldPath::parse("spec.template-hash").unwrap().segments().len(), 2);
        assert!(FieldPath::parse("").is_err());
        assert!(FieldPath::parse("spec..x").is_err());
        assert!(FieldPath::parse("spec.*").is_err());
        assert!(FieldPath::parse("spec.items[0]").is_err());
    }

    #[test]
    fn quoted_segments_hold_dotted_keys() {
        let p = FieldPath::parse(r#"metadata.annotations."deployment.kubernetes.io/revision""#).unwrap();
        assert!(p.matches(&["metadata", "annotations", "deployment.kubernetes.io/revision"]));
        assert_eq!(p.to_string(), r#"metadata.annotations."deployment.kubernetes.io/revision""#);
        assert_eq!(FieldPath::parse(&p.to_string()).unwrap(), p);

        let doc = serde_json::json!({ "metadata": { "annotations": { "deployment.kubernetes.io/revision": "3" } } });
        assert_eq!(p.get(&doc), Some(&serde_json::json!("3")));

        assert!(FieldPath::parse(r#"metadata."unterminated"#).is_err());
        assert!(FieldPath::parse(r#"metadata."""#).is_err());
        assert!(FieldPath::parse(r#"metadata."a"b"#).is_err());
        assert!(FieldPath::parse("metadata.").is_err());
    }

    #[test]
    fn get_and_remove_follow_objects_only() {
        let mut doc = serde_json::json!({
            "metadata": { "name": "x", "resourceVersion": "7" },
            "spec": { "list": [ { "a": 1 } ] }
        });
        let rv = FieldPath::parse("metadata.resourceVersion").unwrap();
        assert_eq!(rv.get(&doc), Some(&serde_json::json!("7")));
        assert_eq!(rv.remove(&mut doc), Some(serde_json::json!("7")));
        assert!(rv.get(&doc).is_none());
        assert!(FieldPath::parse("spec.list.a").unwrap().get(&doc).is_none());
    }

    #[test]
    fn matches_compares_whole_path() {
        let p = FieldPath::parse("metadata.uid").unwrap();
        assert!(p.matches(&["metadata", "uid"]));
        assert!(!p.matches(&["metadata"]));
        assert!(!p.matches(&["metadata", "uid", "x"]));
    }
}
