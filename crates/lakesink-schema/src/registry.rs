//! Schema Resolver (§4.2): fetches and caches per-topic writer schemas
//! from a Confluent-compatible schema registry.
//!
//! The `SchemaClient` trait and its `RestSchemaRegistry` implementation
//! mirror the registry-access shape used elsewhere in the corpus; the
//! `SchemaCache` adds the single-flight-fill behavior the concurrency
//! model (§5) requires so concurrent partition workers resolving the
//! same subject don't issue duplicate registry calls.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use schema_registry_client::rest::schema_registry_client::{Client, SchemaRegistryClient};
use tokio::sync::OnceCell;
use tracing::warn;

use lakesink_core::ConnectorError;

/// How long a subject stays on the permissive fallback schema before the
/// next resolution attempt is allowed to hit the registry again (§4.2:
/// "subsequent calls do not retry the registry until the next configured
/// refresh interval").
const FALLBACK_REFRESH_MS: i64 = 5 * 60 * 1000;

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The wire format a resolved schema is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Avro,
    Json,
}

impl SchemaKind {
    fn from_registry_type(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "JSON" => SchemaKind::Json,
            _ => SchemaKind::Avro,
        }
    }
}

/// A schema resolved from the registry, along with enough identity to
/// detect a version change on the next poll (§4.2 cache invalidation).
#[derive(Debug, Clone)]
pub struct ResolvedSchema {
    pub subject: String,
    pub registry_id: i32,
    pub version: i32,
    pub kind: SchemaKind,
    pub raw_schema: String,
}

/// Narrow trait over the subset of registry operations the connector
/// needs, so tests can substitute an in-memory fake without a running
/// registry.
#[async_trait]
pub trait SchemaClient: Send + Sync {
    async fn get_latest(&self, subject: &str) -> anyhow::Result<ResolvedSchema>;
    async fn get_version(&self, subject: &str, version: i32) -> anyhow::Result<ResolvedSchema>;
    /// Fetches the writer schema a Confluent-framed message's embedded
    /// numeric id refers to (§4.1), independent of the reader-side
    /// subject lookup `get_latest`/`get_version` serve.
    async fn get_by_id(&self, id: i32) -> anyhow::Result<ResolvedSchema>;
    /// Registers a new schema version under `subject`, returning its
    /// assigned registry id (§4.2, §6).
    async fn register(&self, subject: &str, schema: &str) -> anyhow::Result<i32>;
    /// Checks `schema` against `subject`'s current compatibility policy
    /// (§4.10 step 7) without registering it.
    async fn test_compatibility(&self, subject: &str, schema: &str) -> anyhow::Result<bool>;
}

/// `SchemaClient` backed by an HTTP-speaking registry client.
#[derive(Clone)]
pub struct RestSchemaRegistry {
    client: SchemaRegistryClient,
}

impl RestSchemaRegistry {
    pub fn new(client: SchemaRegistryClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SchemaClient for RestSchemaRegistry {
    async fn get_latest(&self, subject: &str) -> anyhow::Result<ResolvedSchema> {
        let registered = self.client.get_latest_version(subject, None).await?;
        Ok(to_resolved(subject, registered))
    }

    async fn get_version(&self, subject: &str, version: i32) -> anyhow::Result<ResolvedSchema> {
        let registered = self.client.get_version(subject, version, false, None).await?;
        Ok(to_resolved(subject, registered))
    }

    async fn get_by_id(&self, id: i32) -> anyhow::Result<ResolvedSchema> {
        let registered = self.client.get_by_id(id, None).await?;
        Ok(to_resolved_by_id(id, registered))
    }

    async fn register(&self, subject: &str, schema: &str) -> anyhow::Result<i32> {
        let unregistered = schema_registry_client::rest::models::Schema {
            schema: Some(schema.to_string()),
            schema_type: Some("JSON".to_string()),
            references: None,
        };
        let registered = self.client.register_schema(subject, unregistered, false, None).await?;
        Ok(registered.id.unwrap_or_default())
    }

    async fn test_compatibility(&self, subject: &str, schema: &str) -> anyhow::Result<bool> {
        let candidate = schema_registry_client::rest::models::Schema {
            schema: Some(schema.to_string()),
            schema_type: Some("JSON".to_string()),
            references: None,
        };
        let result = self
            .client
            .test_compatibility(subject, "latest", candidate, false, None)
            .await?;
        Ok(result)
    }
}

fn to_resolved(
    subject: &str,
    registered: schema_registry_client::rest::models::RegisteredSchema,
) -> ResolvedSchema {
    ResolvedSchema {
        subject: subject.to_string(),
        registry_id: registered.id.unwrap_or_default(),
        version: registered.version.unwrap_or_default(),
        kind: SchemaKind::from_registry_type(
            registered.schema_type.as_deref().unwrap_or("AVRO"),
        ),
        raw_schema: registered.schema.unwrap_or_default(),
    }
}

/// A by-id lookup carries no subject/version of its own in Confluent's
/// `GET /schemas/ids/{id}` response; the numeric id is the only stable
/// identity, so it's recorded in both `subject` and `registry_id`.
fn to_resolved_by_id(
    id: i32,
    registered: schema_registry_client::rest::models::RegisteredSchema,
) -> ResolvedSchema {
    ResolvedSchema {
        subject: format!("id:{id}"),
        registry_id: id,
        version: registered.version.unwrap_or_default(),
        kind: SchemaKind::from_registry_type(
            registered.schema_type.as_deref().unwrap_or("AVRO"),
        ),
        raw_schema: registered.schema.unwrap_or_default(),
    }
}

/// Caches resolved schemas per subject with single-flight fill: the
/// first caller to miss populates the `OnceCell`, concurrent callers
/// for the same subject await the same fill rather than issuing their
/// own registry request.
pub struct SchemaCache {
    client: Arc<dyn SchemaClient>,
    entries: DashMap<String, Arc<OnceCell<ResolvedSchema>>>,
    fallback_until_ms: DashMap<String, AtomicI64>,
    by_id: DashMap<i32, Arc<OnceCell<ResolvedSchema>>>,
    by_id_failures: DashMap<i32, u32>,
}

/// Bounded fetch-failure count before an unknown writer-schema id is
/// reclassified Terminal rather than retried (§4.1: "Unknown schema id
/// -> Retriable first ... Terminal after N bounded fetch failures").
const MAX_BY_ID_FETCH_FAILURES: u32 = 3;

impl SchemaCache {
    pub fn new(client: Arc<dyn SchemaClient>) -> Self {
        Self {
            client,
            entries: DashMap::new(),
            fallback_until_ms: DashMap::new(),
            by_id: DashMap::new(),
            by_id_failures: DashMap::new(),
        }
    }

    /// Resolves the writer schema a Confluent-framed message's embedded
    /// id refers to, with single-flight fill per id (§4.1, §4.2). The
    /// first `MAX_BY_ID_FETCH_FAILURES` misses surface a Retriable
    /// registry error; beyond that the id is treated as permanently
    /// unknown and the failure is reclassified Terminal.
    pub async fn resolve_by_id(&self, id: i32) -> Result<ResolvedSchema, ConnectorError> {
        let cell = self.by_id.entry(id).or_insert_with(|| Arc::new(OnceCell::new())).clone();
        let result = cell
            .get_or_try_init(|| async { self.client.get_by_id(id).await.map_err(|e| e.to_string()) })
            .await;
        match result {
            Ok(resolved) => {
                self.by_id_failures.remove(&id);
                Ok(resolved.clone())
            }
            Err(e) => {
                let failures = {
                    let mut entry = self.by_id_failures.entry(id).or_insert(0);
                    *entry += 1;
                    *entry
                };
                // A cached failed OnceCell never re-attempts; drop it so the
                // next resolve for this id retries rather than replaying the
                // same stale error forever.
                self.by_id.remove(&id);
                if failures >= MAX_BY_ID_FETCH_FAILURES {
                    Err(ConnectorError::Parse(format!(
                        "schema id {id} unresolvable after {failures} attempts: {e}"
                    )))
                } else {
                    Err(ConnectorError::Registry(format!("resolving schema id {id}: {e}")))
                }
            }
        }
    }

    pub async fn resolve(&self, subject: &str) -> Result<ResolvedSchema, ConnectorError> {
        let cell = self
            .entries
            .entry(subject.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let resolved = cell
            .get_or_try_init(|| async {
                self.client
                    .get_latest(subject)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await
            .map_err(|e| ConnectorError::Registry(format!("resolving subject {subject}: {e}")))?;
        Ok(resolved.clone())
    }

    /// Resolves `subject`, degrading to a permissive open-record schema
    /// (B4) when the registry is unreachable or disabled, rather than
    /// surfacing a Retriable error to the caller. Once a subject has
    /// fallen back, further registry attempts for it are suppressed
    /// until [`FALLBACK_REFRESH_MS`] elapses (§4.2).
    pub async fn resolve_or_fallback(&self, subject: &str) -> ResolvedSchema {
        if let Some(deadline) = self.fallback_until_ms.get(subject) {
            if now_epoch_ms() < deadline.load(Ordering::SeqCst) {
                return permissive_fallback(subject);
            }
        }
        match self.resolve(subject).await {
            Ok(resolved) => {
                self.fallback_until_ms.remove(subject);
                resolved
            }
            Err(e) => {
                warn!(subject, error = %e, "schema registry unavailable, substituting permissive fallback schema");
                self.fallback_until_ms
                    .entry(subject.to_string())
                    .or_insert_with(|| AtomicI64::new(0))
                    .store(now_epoch_ms() + FALLBACK_REFRESH_MS, Ordering::SeqCst);
                permissive_fallback(subject)
            }
        }
    }

    /// Forces a re-fetch the next time `subject` is resolved, used when
    /// the Parser detects a writer-schema id it hasn't seen before.
    pub fn invalidate(&self, subject: &str) {
        self.entries.remove(subject);
    }
}

/// An open-record JSON schema that accepts any well-formed JSON object,
/// substituted when the registry is disabled or unreachable (§4.2, B4).
fn permissive_fallback(subject: &str) -> ResolvedSchema {
    ResolvedSchema {
        subject: subject.to_string(),
        registry_id: -1,
        version: 0,
        kind: SchemaKind::Json,
        raw_schema: "{}".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingClient {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SchemaClient for CountingClient {
        async fn get_latest(&self, subject: &str) -> anyhow::Result<ResolvedSchema> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ResolvedSchema {
                subject: subject.to_string(),
                registry_id: 1,
                version: 1,
                kind: SchemaKind::Avro,
                raw_schema: "{}".to_string(),
            })
        }

        async fn get_version(&self, subject: &str, version: i32) -> anyhow::Result<ResolvedSchema> {
            self.get_latest(subject).await.map(|mut s| {
                s.version = version;
                s
            })
        }

        async fn get_by_id(&self, id: i32) -> anyhow::Result<ResolvedSchema> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ResolvedSchema {
                subject: format!("id:{id}"),
                registry_id: id,
                version: 1,
                kind: SchemaKind::Avro,
                raw_schema: "{}".to_string(),
            })
        }

        async fn register(&self, _subject: &str, _schema: &str) -> anyhow::Result<i32> {
            Ok(1)
        }

        async fn test_compatibility(&self, _subject: &str, _schema: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn concurrent_resolves_for_same_subject_single_flight() {
        let client = Arc::new(CountingClient {
            calls: AtomicU32::new(0),
        });
        let cache = Arc::new(SchemaCache::new(client.clone()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.resolve("orders-value").await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let client = Arc::new(CountingClient {
            calls: AtomicU32::new(0),
        });
        let cache = SchemaCache::new(client.clone());
        cache.resolve("orders-value").await.unwrap();
        cache.invalidate("orders-value");
        cache.resolve("orders-value").await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    struct AlwaysFailsClient;

    #[async_trait]
    impl SchemaClient for AlwaysFailsClient {
        async fn get_latest(&self, _subject: &str) -> anyhow::Result<ResolvedSchema> {
            Err(anyhow::anyhow!("registry unreachable"))
        }
        async fn get_version(&self, _subject: &str, _version: i32) -> anyhow::Result<ResolvedSchema> {
            Err(anyhow::anyhow!("registry unreachable"))
        }
        async fn get_by_id(&self, _id: i32) -> anyhow::Result<ResolvedSchema> {
            Err(anyhow::anyhow!("registry unreachable"))
        }

        async fn register(&self, _subject: &str, _schema: &str) -> anyhow::Result<i32> {
            Err(anyhow::anyhow!("registry unreachable"))
        }

        async fn test_compatibility(&self, _subject: &str, _schema: &str) -> anyhow::Result<bool> {
            Err(anyhow::anyhow!("registry unreachable"))
        }
    }

    #[tokio::test]
    async fn resolve_or_fallback_degrades_to_permissive_schema_on_registry_failure() {
        let cache = SchemaCache::new(Arc::new(AlwaysFailsClient));
        let resolved = cache.resolve_or_fallback("unknown-value").await;
        assert_eq!(resolved.kind, SchemaKind::Json);
        assert_eq!(resolved.raw_schema, "{}");
    }

    #[tokio::test]
    async fn resolve_or_fallback_suppresses_registry_retries_until_refresh_window() {
        let client = Arc::new(CountingClient {
            calls: AtomicU32::new(0),
        });
        // Wrap so the first call fails and later calls would succeed,
        // to prove the fallback window, not client success, gates retry.
        struct FlakyThenGood(Arc<CountingClient>);
        #[async_trait]
        impl SchemaClient for FlakyThenGood {
            async fn get_latest(&self, subject: &str) -> anyhow::Result<ResolvedSchema> {
                if self.0.calls.load(Ordering::SeqCst) == 0 {
                    self.0.calls.fetch_add(1, Ordering::SeqCst);
                    return Err(anyhow::anyhow!("registry unreachable"));
                }
                self.0.get_latest(subject).await
            }
            async fn get_version(&self, subject: &str, version: i32) -> anyhow::Result<ResolvedSchema> {
                self.get_latest(subject).await.map(|mut s| {
                    s.version = version;
                    s
                })
            }
            async fn get_by_id(&self, id: i32) -> anyhow::Result<ResolvedSchema> {
                self.0.get_by_id(id).await
            }
            async fn register(&self, subject: &str, schema: &str) -> anyhow::Result<i32> {
                self.0.register(subject, schema).await
            }
            async fn test_compatibility(&self, subject: &str, schema: &str) -> anyhow::Result<bool> {
                self.0.test_compatibility(subject, schema).await
            }
        }
        let cache = SchemaCache::new(Arc::new(FlakyThenGood(client.clone())));
        let first = cache.resolve_or_fallback("orders-value").await;
        assert_eq!(first.raw_schema, "{}");
        let second = cache.resolve_or_fallback("orders-value").await;
        assert_eq!(second.raw_schema, "{}", "second call within refresh window should stay on fallback");
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resolve_by_id_succeeds_on_first_good_fetch() {
        let cache = SchemaCache::new(Arc::new(CountingClient {
            calls: AtomicU32::new(0),
        }));
        let resolved = cache.resolve_by_id(7).await.unwrap();
        assert_eq!(resolved.registry_id, 7);
    }

    #[tokio::test]
    async fn resolve_by_id_is_retriable_before_the_failure_threshold() {
        let cache = SchemaCache::new(Arc::new(AlwaysFailsClient));
        let err = cache.resolve_by_id(99).await.unwrap_err();
        assert!(err.is_retriable(), "first failures should stay retriable");
    }

    #[tokio::test]
    async fn resolve_by_id_becomes_terminal_after_bounded_failures() {
        let cache = SchemaCache::new(Arc::new(AlwaysFailsClient));
        let mut last = None;
        for _ in 0..MAX_BY_ID_FETCH_FAILURES {
            last = Some(cache.resolve_by_id(99).await.unwrap_err());
        }
        assert!(!last.unwrap().is_retriable(), "exhausted id lookups should be terminal");
    }
}
