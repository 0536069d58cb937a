//! Stable operation identity used as the dedup and cache key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use xxhash_rust::xxh3::xxh3_64;

use crate::operation::OperationKind;
use crate::payload::Payload;
use crate::target::Target;

/// xxh3 hash of an operation's canonical form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Hash the parts that determine an operation's upstream effect.
    ///
    /// The canonical input includes:
    /// - kind and resource id
    /// - the credential scope, so results never cross credentials
    /// - the target
    /// - args, in key order
    /// - the payload, for writes only
    pub fn compute(
        kind: OperationKind,
        resource_id: &str,
        scope: &str,
        target: &Target,
        args: &BTreeMap<String, String>,
        payload: &Payload,
    ) -> Self {
        let mut input = String::new();

        input.push_str(kind.as_str());
        input.push('\0');
        input.push_str(resource_id);
        input.push('\0');
        input.push_str(scope);
        input.push('\0');
        input.push_str(&target.canonical());
        input.push('\0');

        for (key, value) in args {
            input.push_str(key);
            input.push('=');
            input.push_str(value);
            input.push('\n');
        }

        if kind == OperationKind::Write {
            input.push('\0');
            input.push_str(&payload.canonical());
        }

        Fingerprint(xxh3_64(input.as_bytes()))
    }

    pub fn from_raw(raw: u64) -> Self {
        Fingerprint(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::GridRange;
    use serde_json::json;

    fn fp(kind: OperationKind, target: Target, payload: Payload) -> Fingerprint {
        Fingerprint::compute(kind, "sheet-1", "default", &target, &BTreeMap::new(), &payload)
    }

    #[test]
    fn test_identical_reads_share_fingerprint() {
        let t = Target::Range(GridRange::rows("S", 0, 10));
        assert_eq!(
            fp(OperationKind::Read, t.clone(), Payload::Empty),
            fp(OperationKind::Read, t, Payload::Empty)
        );
    }

    #[test]
    fn test_kind_target_and_args_affect_fingerprint() {
        let t = Target::Range(GridRange::rows("S", 0, 10));
        let read = fp(OperationKind::Read, t.clone(), Payload::Empty);

        assert_ne!(read, fp(OperationKind::Write, t.clone(), Payload::Empty));
        assert_ne!(
            read,
            fp(OperationKind::Read, Target::Range(GridRange::rows("S", 0, 11)), Payload::Empty)
        );

        let mut args = BTreeMap::new();
        args.insert("render".to_string(), "formula".to_string());
        assert_ne!(
            read,
            Fingerprint::compute(OperationKind::Read, "sheet-1", "default", &t, &args, &Payload::Empty)
        );
    }

    #[test]
    fn test_scope_affects_fingerprint() {
        let t = Target::Range(GridRange::rows("S", 0, 10));
        let args = BTreeMap::new();
        assert_ne!(
            Fingerprint::compute(OperationKind::Read, "sheet-1", "user-1", &t, &args, &Payload::Empty),
            Fingerprint::compute(OperationKind::Read, "sheet-1", "user-2", &t, &args, &Payload::Empty)
        );
    }

    #[test]
    fn test_write_payload_affects_fingerprint() {
        let t = Target::Range(GridRange::rows("S", 0, 1));
        let a = fp(OperationKind::Write, t.clone(), Payload::Values(vec![vec![json!(1)]]));
        let b = fp(OperationKind::Write, t, Payload::Values(vec![vec![json!(2)]]));
        assert_ne!(a, b);
    }
}
