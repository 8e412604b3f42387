//! Caller identity extraction and hashing.
//!
//! Identity is derived from the first present credential in a configured
//! source chain (api-key header, bearer token, query parameter, then caller
//! address) and hashed into a short stable key so raw credentials never become
//! storage keys. The hash is prefixed with the source tag to keep credentials
//! from different sources in separate buckets.

use std::hash::Hasher;

/// Where a credential may be found on a request, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// Explicit `x-api-key` style header.
    ApiKeyHeader,
    /// `Authorization: Bearer <token>` header.
    BearerToken,
    /// `?api_key=` query parameter.
    QueryParam,
    /// Peer address, the last resort.
    RemoteAddr,
}

impl IdentitySource {
    fn tag(&self) -> &'static str {
        match self {
            IdentitySource::ApiKeyHeader => "key",
            IdentitySource::BearerToken => "bearer",
            IdentitySource::QueryParam => "query",
            IdentitySource::RemoteAddr => "addr",
        }
    }
}

/// Hash used to turn credentials into storage keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// std SipHash via `DefaultHasher`; stable within a process.
    Sip,
    /// FNV-1a; stable across processes sharing a store.
    Fnv1a,
}

/// Hashed caller identity used as a rate-limit storage key component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct Identity(String);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shared identity for requests carrying no credential at all. All such
    /// callers drain one bucket, which is the point: anonymous traffic gets
    /// the strictest effective limit.
    pub fn anonymous() -> Self {
        Identity("anonymous".to_string())
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered credential extraction chain.
#[derive(Debug, Clone)]
pub struct IdentityExtractor {
    priority: Vec<IdentitySource>,
    algorithm: HashAlgorithm,
}

impl IdentityExtractor {
    pub fn new(priority: Vec<IdentitySource>, algorithm: HashAlgorithm) -> Self {
        Self { priority, algorithm }
    }

    /// Derive an identity from the first source for which `lookup` yields a
    /// non-empty credential. Returns `None` when no source matches.
    pub fn extract<F>(&self, lookup: F) -> Option<Identity>
    where
        F: Fn(IdentitySource) -> Option<String>,
    {
        for source in &self.priority {
            if let Some(raw) = lookup(*source) {
                if !raw.is_empty() {
                    return Some(self.hash(*source, &raw));
                }
            }
        }
        None
    }

    fn hash(&self, source: IdentitySource, raw: &str) -> Identity {
        let material = format!("{}:{}", source.tag(), raw);
        let digest = match self.algorithm {
            HashAlgorithm::Sip => {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                hasher.write(material.as_bytes());
                hasher.finish()
            }
            HashAlgorithm::Fnv1a => fnv1a(material.as_bytes()),
        };
        Identity(format!("{:016x}", digest))
    }
}

impl Default for IdentityExtractor {
    /// Default chain: api key, bearer token, query parameter, caller address.
    fn default() -> Self {
        Self {
            priority: vec![
                IdentitySource::ApiKeyHeader,
                IdentitySource::BearerToken,
                IdentitySource::QueryParam,
                IdentitySource::RemoteAddr,
            ],
            algorithm: HashAlgorithm::Sip,
        }
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(
        map: HashMap<IdentitySource, &'static str>,
    ) -> impl Fn(IdentitySource) -> Option<String> {
        move |source| map.get(&source).map(|s| s.to_string())
    }

    #[test]
    fn first_present_source_wins() {
        let extractor = IdentityExtractor::default();
        let mut creds = HashMap::new();
        creds.insert(IdentitySource::BearerToken, "tok-123");
        creds.insert(IdentitySource::RemoteAddr, "10.0.0.1");

        let from_bearer = extractor.extract(lookup_from(creds)).unwrap();

        let mut only_addr = HashMap::new();
        only_addr.insert(IdentitySource::RemoteAddr, "10.0.0.1");
        let from_addr = extractor.extract(lookup_from(only_addr)).unwrap();

        assert_ne!(from_bearer, from_addr, "bearer token takes priority over address");
    }

    #[test]
    fn same_credential_hashes_stably() {
        let extractor = IdentityExtractor::default();
        let mut creds = HashMap::new();
        creds.insert(IdentitySource::ApiKeyHeader, "sk-abc");

        let a = extractor.extract(lookup_from(creds.clone())).unwrap();
        let b = extractor.extract(lookup_from(creds)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16, "16 hex digits");
    }

    #[test]
    fn raw_credential_never_appears_in_identity() {
        let extractor = IdentityExtractor::default();
        let mut creds = HashMap::new();
        creds.insert(IdentitySource::ApiKeyHeader, "sk-secret-credential");

        let identity = extractor.extract(lookup_from(creds)).unwrap();
        assert!(!identity.as_str().contains("secret"));
    }

    #[test]
    fn same_value_in_different_sources_differs() {
        let extractor = IdentityExtractor::new(
            vec![IdentitySource::ApiKeyHeader],
            HashAlgorithm::Fnv1a,
        );
        let addr_extractor =
            IdentityExtractor::new(vec![IdentitySource::RemoteAddr], HashAlgorithm::Fnv1a);

        let mut as_key = HashMap::new();
        as_key.insert(IdentitySource::ApiKeyHeader, "10.0.0.1");
        let mut as_addr = HashMap::new();
        as_addr.insert(IdentitySource::RemoteAddr, "10.0.0.1");

        let a = extractor.extract(lookup_from(as_key)).unwrap();
        let b = addr_extractor.extract(lookup_from(as_addr)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_credentials_are_skipped() {
        let extractor = IdentityExtractor::default();
        let mut creds = HashMap::new();
        creds.insert(IdentitySource::ApiKeyHeader, "");
        creds.insert(IdentitySource::RemoteAddr, "10.0.0.1");

        let identity = extractor.extract(lookup_from(creds)).unwrap();
        let mut only_addr = HashMap::new();
        only_addr.insert(IdentitySource::RemoteAddr, "10.0.0.1");
        let expected = extractor.extract(lookup_from(only_addr)).unwrap();
        assert_eq!(identity, expected);
    }

    #[test]
    fn no_credentials_yields_none() {
        let extractor = IdentityExtractor::default();
        assert!(extractor.extract(|_| None).is_none());
    }

    #[test]
    fn fnv1a_matches_known_vector() {
        // FNV-1a of empty input is the offset basis
        assert_eq!(fnv1a(b""), FNV_OFFSET);
        // Published test vector for "a"
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }
}
