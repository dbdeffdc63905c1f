//! Vault orchestration
//!
//! The [`Vault`] ties the governed stores together and implements the
//! bundle lifecycle: create, meditate, purge, status, export and import,
//! plus consent changes, retention sweeps and key rotation. Every
//! operation takes an explicit [`Context`]; nothing is ambient.
//!
//! A persistent vault keeps its state under `storage.base_dir`:
//! ```text
//! <base_dir>/
//! ├── keyring.json          data keys sealed under the master secret
//! ├── index.json            span embeddings, keyword tags, pending deletes
//! ├── audit.jsonl           audit log
//! ├── bundles/<name>.json
//! └── records/<id>.json     encrypted records
//! ```

use super::archive::{Archive, KeysFile, Manifest, SCHEMA_VERSION};
use super::types::{
    source_for, validate_name, Bundle, BundlePolicy, BundleStatus, IngestReport, MeditateInput,
    MeditateReport, PurgeReport, RecordReadout, RetentionReport,
};
use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::chunk::{Chunker, StructuralChunker};
use crate::config::MemoriaConfig;
use crate::consent::{ConfirmationToken, ConsentGate, ConsentLevel, RecordView};
use crate::context::Context;
use crate::corpus::{Corpus, CONTENT_FIELD};
use crate::crypto::{derive_wrapping_key, generate_key, open_with, EncryptionService, KeyRing, SealedKeyRing};
use crate::error::{Error, Result};
use crate::index::{embedder_from_config, Embedder, VectorEntry};
use crate::persist::{prune_json_dir, read_json, read_json_dir, write_json};
use crate::retrieval::{HybridRetriever, Passage, RetrievalFilter};
use crate::store::{normalize_text, IngestRequest, Provenance, Record, RecordBuilder, RecordId, RecordValidator};
use chrono::{DateTime, Duration, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

const KEYRING_FILE: &str = "keyring.json";
const INDEX_FILE: &str = "index.json";
const AUDIT_FILE: &str = "audit.jsonl";
const BUNDLES_DIR: &str = "bundles";
const RECORDS_DIR: &str = "records";

/// Spans embedded concurrently per record
const EMBED_CONCURRENCY: usize = 8;

/// Persisted index state
#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexSnapshot {
    entries: Vec<VectorEntry>,
    #[serde(default)]
    marked: Vec<RecordId>,
}

/// One archived record ready to be written
struct ImportPlan {
    record: Record,
    /// Local record with the same id, if any
    local: Option<Record>,
    /// Index entries to write; `None` leaves the index alone
    entries: Option<Vec<VectorEntry>>,
}

/// Where and how a persistent vault saves itself
struct Storage {
    base_dir: PathBuf,
    master_secret: Zeroizing<String>,
}

/// Consent-governed personal record vault
pub struct Vault {
    config: MemoriaConfig,
    corpus: Corpus,
    embedder: Arc<dyn Embedder>,
    chunker: Arc<dyn Chunker>,
    retriever: HybridRetriever,
    validator: RecordValidator,
    bundles: Arc<RwLock<BTreeMap<String, Bundle>>>,
    audit: AuditLog,
    storage: Option<Storage>,
}

impl Vault {
    /// Create a vault that lives only in memory
    pub async fn in_memory(config: MemoriaConfig) -> Result<Self> {
        let keyring = KeyRing::generate(config.crypto.rotation_retention_days);
        Self::assemble(config, keyring, None).await
    }

    /// Open (or initialize) the vault under `config.storage.base_dir`.
    ///
    /// The keyring is sealed under `master_secret`; opening an existing
    /// vault with a different secret fails with an encryption error.
    pub async fn open(config: MemoriaConfig, master_secret: &str) -> Result<Self> {
        if master_secret.is_empty() {
            return Err(Error::Config("master secret must not be empty".to_string()));
        }
        let base_dir = config.storage.base_dir.clone();
        tokio::fs::create_dir_all(&base_dir).await?;

        let sealed: Option<SealedKeyRing> = read_json(&base_dir.join(KEYRING_FILE)).await?;
        let keyring = match sealed {
            Some(sealed) => KeyRing::unseal(&sealed, master_secret, config.crypto.kdf_iterations)?,
            None => {
                tracing::info!("Initializing new vault at {}", base_dir.display());
                KeyRing::generate(config.crypto.rotation_retention_days)
            }
        };

        let storage = Storage {
            base_dir,
            master_secret: Zeroizing::new(master_secret.to_string()),
        };
        let mut vault = Self::assemble(config, keyring, Some(storage)).await?;
        vault.load().await?;
        vault.reconcile().await;
        Ok(vault)
    }

    async fn assemble(config: MemoriaConfig, keyring: KeyRing, storage: Option<Storage>) -> Result<Self> {
        config.validate()?;

        let mut gate = ConsentGate::new(config.consent.default_level);
        for policy in &config.consent.sources {
            gate.register(policy.clone());
        }
        let crypto = EncryptionService::new(keyring);
        let corpus = Corpus::new(crypto, gate, config.index.dimension, config.index.segments).await?;
        let embedder = embedder_from_config(&config.embedder, config.index.dimension);
        let chunker: Arc<dyn Chunker> = Arc::new(StructuralChunker::from_config(&config.chunking)?);
        let retriever = HybridRetriever::new(corpus.clone(), embedder.clone(), config.retrieval.clone());

        Ok(Self {
            validator: RecordValidator::new(config.storage.max_record_bytes),
            audit: if storage.is_some() {
                AuditLog::persistent(config.storage.audit_memory_limit)
            } else {
                AuditLog::with_limit(config.storage.audit_memory_limit)
            },
            config,
            corpus,
            embedder,
            chunker,
            retriever,
            bundles: Arc::new(RwLock::new(BTreeMap::new())),
            storage,
        })
    }

    /// Replace the embedding backend. The dimension must match the index.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Result<Self> {
        if embedder.dimension() != self.config.index.dimension {
            return Err(Error::Config(format!(
                "embedder '{}' produces {} dimensions, index expects {}",
                embedder.name(),
                embedder.dimension(),
                self.config.index.dimension
            )));
        }
        self.retriever = HybridRetriever::new(
            self.corpus.clone(),
            embedder.clone(),
            self.config.retrieval.clone(),
        );
        self.embedder = embedder;
        Ok(self)
    }

    /// Active configuration
    pub fn config(&self) -> &MemoriaConfig {
        &self.config
    }

    async fn load(&mut self) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let base = storage.base_dir.clone();

        let records: Vec<Record> = read_json_dir(&base.join(RECORDS_DIR)).await?;
        let bundles: Vec<Bundle> = read_json_dir(&base.join(BUNDLES_DIR)).await?;
        let snapshot: IndexSnapshot = read_json(&base.join(INDEX_FILE)).await?.unwrap_or_default();

        let record_count = records.len();
        self.corpus.store.load(records).await;
        self.corpus.index.restore(snapshot.entries, snapshot.marked).await?;
        {
            let mut gate = self.corpus.gate.write().await;
            let mut map = self.bundles.write().await;
            for bundle in bundles {
                gate.register(bundle.policy.source_policy(&bundle.source()));
                map.insert(bundle.name.clone(), bundle);
            }
        }

        match tokio::fs::read_to_string(base.join(AUDIT_FILE)).await {
            Ok(text) => self.audit = AuditLog::from_jsonl(&text, self.config.storage.audit_memory_limit),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            records = record_count,
            bundles = self.bundles.read().await.len(),
            "Loaded vault from {}",
            base.display()
        );
        Ok(())
    }

    /// Write the vault state to disk. A no-op for in-memory vaults.
    pub async fn save(&self) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let base = &storage.base_dir;

        // Keys first: a record on disk must never outlive its key file
        let sealed = self
            .corpus
            .crypto
            .seal(&storage.master_secret, self.config.crypto.kdf_iterations)
            .await?;
        write_json(&base.join(KEYRING_FILE), &sealed).await?;

        let records = self.corpus.store.all().await;
        let records_dir = base.join(RECORDS_DIR);
        let mut keep = HashSet::new();
        for record in &records {
            write_json(&records_dir.join(format!("{}.json", record.id)), record).await?;
            keep.insert(record.id.to_string());
        }
        prune_json_dir(&records_dir, &keep).await?;

        let bundles: Vec<Bundle> = self.bundles.read().await.values().cloned().collect();
        let bundles_dir = base.join(BUNDLES_DIR);
        let mut keep = HashSet::new();
        for bundle in &bundles {
            write_json(&bundles_dir.join(format!("{}.json", bundle.name)), bundle).await?;
            keep.insert(bundle.name.clone());
        }
        prune_json_dir(&bundles_dir, &keep).await?;

        let snapshot = IndexSnapshot {
            entries: self.corpus.index.snapshot().await,
            marked: self.corpus.index.marked().await,
        };
        write_json(&base.join(INDEX_FILE), &snapshot).await?;
        self.audit.flush(&base.join(AUDIT_FILE)).await?;

        tracing::debug!(records = records.len(), bundles = bundles.len(), "Saved vault");
        Ok(())
    }

    // ---- bundles ----

    /// Create an empty bundle owned by the caller
    pub async fn create_bundle(&self, ctx: &Context, name: &str, policy: BundlePolicy) -> Result<Bundle> {
        let result = self.try_create_bundle(ctx, name, policy).await;
        self.audit_outcome(&ctx.owner_id, AuditAction::CreateBundle, name, &result, |b| {
            format!("default_level={}", b.policy.default_level)
        })
        .await;
        result
    }

    async fn try_create_bundle(&self, ctx: &Context, name: &str, policy: BundlePolicy) -> Result<Bundle> {
        if policy.default_level == ConsentLevel::None {
            return Err(Error::ConsentDenied(format!(
                "bundle '{}' would admit no content",
                name
            )));
        }
        let bundle = Bundle::new(name, &ctx.owner_id, policy)?;

        let mut bundles = self.bundles.write().await;
        if bundles.contains_key(name) {
            return Err(Error::Conflict(format!("bundle '{}' already exists", name)));
        }
        self.corpus
            .gate
            .write()
            .await
            .register(policy.source_policy(&bundle.source()));
        bundles.insert(name.to_string(), bundle.clone());

        tracing::info!(bundle = name, owner = %ctx.owner_id, "Created bundle");
        Ok(bundle)
    }

    /// Bundles owned by the caller
    pub async fn list_bundles(&self, ctx: &Context) -> Vec<Bundle> {
        self.bundles
            .read()
            .await
            .values()
            .filter(|b| b.owner_id == ctx.owner_id)
            .cloned()
            .collect()
    }

    async fn bundle_for(&self, ctx: &Context, name: &str) -> Result<Bundle> {
        let bundles = self.bundles.read().await;
        let bundle = bundles
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("bundle '{}'", name)))?;
        if bundle.owner_id != ctx.owner_id {
            return Err(Error::AccessDenied(format!(
                "bundle '{}' belongs to another owner",
                name
            )));
        }
        Ok(bundle.clone())
    }

    /// Ingest text or a file into a bundle at the bundle's default level
    /// and attach the resulting record
    pub async fn meditate(&self, ctx: &Context, name: &str, input: MeditateInput) -> Result<MeditateReport> {
        self.meditate_inner(ctx, name, input, None).await
    }

    /// Like [`meditate`](Self::meditate) but requesting `level`; the
    /// bundle policy still caps it
    pub async fn meditate_at(
        &self,
        ctx: &Context,
        name: &str,
        input: MeditateInput,
        level: ConsentLevel,
    ) -> Result<MeditateReport> {
        self.meditate_inner(ctx, name, input, Some(level)).await
    }

    async fn meditate_inner(
        &self,
        ctx: &Context,
        name: &str,
        input: MeditateInput,
        level: Option<ConsentLevel>,
    ) -> Result<MeditateReport> {
        let bundle = self.bundle_for(ctx, name).await?;

        let request = match input {
            MeditateInput::Text(text) => IngestRequest::new(bundle.source(), Utc::now(), text),
            MeditateInput::File(path) => read_input_file(&path, bundle.source()).await?,
        };
        let requested = level.unwrap_or(bundle.policy.default_level);
        let ingest = self.ingest_with(ctx, request, requested, Some(name)).await?;

        let attached = {
            let mut bundles = self.bundles.write().await;
            let bundle = bundles
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("bundle '{}'", name)))?;
            bundle.attach(ingest.record_id.clone())
        };

        tracing::info!(
            bundle = name,
            record_id = %ingest.record_id,
            passages = ingest.passages,
            duplicate = ingest.duplicate,
            "Meditated into bundle"
        );
        Ok(MeditateReport {
            bundle: name.to_string(),
            ingest,
            attached,
        })
    }

    /// Attach an existing record owned by the caller to a bundle
    pub async fn attach(&self, ctx: &Context, name: &str, record_id: &RecordId) -> Result<bool> {
        self.owned_record(ctx, record_id).await?;
        let mut bundles = self.bundles.write().await;
        let bundle = bundles
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("bundle '{}'", name)))?;
        if bundle.owner_id != ctx.owner_id {
            return Err(Error::AccessDenied(format!(
                "bundle '{}' belongs to another owner",
                name
            )));
        }
        Ok(bundle.attach(record_id.clone()))
    }

    /// Delete or strip everything in a bundle matching `pattern`.
    ///
    /// The pattern is a case-insensitive regex matched against each
    /// record's source and `key=value` metadata, and against span labels.
    /// A record-level match deletes the record with all its index entries,
    /// unless another bundle still references it, in which case it is only
    /// detached. A label match removes just those spans and keeps them out
    /// of later reindexing.
    pub async fn purge(&self, ctx: &Context, name: &str, pattern: &str) -> Result<PurgeReport> {
        let result = self.try_purge(ctx, name, pattern).await;
        self.audit_outcome(&ctx.owner_id, AuditAction::Purge, name, &result, |r| {
            format!(
                "pattern={} matched={} removed_records={} removed_passages={}",
                r.pattern, r.matched, r.removed_records, r.removed_passages
            )
        })
        .await;
        result
    }

    async fn try_purge(&self, ctx: &Context, name: &str, pattern: &str) -> Result<PurgeReport> {
        let re = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::Validation(format!("invalid purge pattern: {}", e)))?;

        let mut bundles = self.bundles.write().await;
        let bundle = bundles
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("bundle '{}'", name)))?;
        if bundle.owner_id != ctx.owner_id {
            return Err(Error::AccessDenied(format!(
                "bundle '{}' belongs to another owner",
                name
            )));
        }
        let ids: Vec<RecordId> = bundle.record_ids.iter().cloned().collect();

        let mut report = PurgeReport {
            pattern: pattern.to_string(),
            ..Default::default()
        };
        let mut detach = Vec::new();

        for id in ids {
            let shared = bundles
                .iter()
                .any(|(other, b)| other != name && b.record_ids.contains(&id));
            let Some(record) = self.corpus.store.get_unchecked(&id).await else {
                tracing::warn!(record_id = %id, "Detaching missing record from bundle {}", name);
                detach.push(id);
                continue;
            };

            if record.metadata_strings().iter().any(|s| re.is_match(s)) {
                report.matched += 1;
                if shared {
                    report.detached_records += 1;
                } else {
                    report.removed_passages += self.corpus.store.delete(&id, &self.corpus.index).await?;
                    report.removed_records += 1;
                }
                detach.push(id);
                continue;
            }

            report.retained += 1;
            if shared {
                continue;
            }
            let removed = self
                .corpus
                .index
                .remove_where(&id, |e| e.label.as_deref().is_some_and(|l| re.is_match(l)))
                .await;
            if removed.is_empty() {
                continue;
            }
            let labels: BTreeSet<String> = removed.iter().filter_map(|e| e.label.clone()).collect();
            self.corpus
                .store
                .update(&id, |r| {
                    r.purged_labels.extend(labels);
                    Ok(())
                })
                .await?;
            report.matched += 1;
            report.removed_passages += removed.len();
        }

        if let Some(bundle) = bundles.get_mut(name) {
            for id in &detach {
                bundle.detach(id);
            }
        }

        tracing::info!(
            bundle = name,
            matched = report.matched,
            removed_records = report.removed_records,
            removed_passages = report.removed_passages,
            "Purged bundle"
        );
        Ok(report)
    }

    /// Document and passage counts for a bundle
    pub async fn status(&self, ctx: &Context, name: &str) -> Result<BundleStatus> {
        let bundle = self.bundle_for(ctx, name).await?;
        let mut passages = 0;
        for id in &bundle.record_ids {
            passages += self.corpus.index.count_for(id).await;
        }
        Ok(BundleStatus {
            name: bundle.name,
            documents: bundle.record_ids.len(),
            passages,
            policy: bundle.policy,
            version: bundle.version,
            created_at: bundle.created_at,
            updated_at: bundle.updated_at,
        })
    }

    // ---- ingestion ----

    /// Ingest a record outside any bundle
    pub async fn ingest(&self, ctx: &Context, request: IngestRequest, requested: ConsentLevel) -> Result<IngestReport> {
        self.ingest_with(ctx, request, requested, None).await
    }

    async fn ingest_with(
        &self,
        ctx: &Context,
        request: IngestRequest,
        requested: ConsentLevel,
        bundle: Option<&str>,
    ) -> Result<IngestReport> {
        let source = request.source.clone();
        let result = self.try_ingest(ctx, request, requested, bundle).await;
        self.audit_outcome(&ctx.owner_id, AuditAction::Ingest, &source, &result, |r| {
            format!(
                "record={} level={} duplicate={}",
                r.record_id, r.applied_level, r.duplicate
            )
        })
        .await;
        result
    }

    async fn try_ingest(
        &self,
        ctx: &Context,
        request: IngestRequest,
        requested: ConsentLevel,
        bundle: Option<&str>,
    ) -> Result<IngestReport> {
        let now = Utc::now();
        let normalized = normalize_text(&request.text);
        self.validator
            .validate_request(&ctx.owner_id, &request, &normalized, now)?;

        let decision = self.corpus.gate.read().await.evaluate(&request.source, requested);
        if decision.allowed_level == ConsentLevel::None {
            return Err(Error::ConsentDenied(format!(
                "source '{}' does not accept content",
                request.source
            )));
        }
        if decision.downgraded {
            tracing::info!(
                source = %request.source,
                requested = %requested,
                applied = %decision.allowed_level,
                "Consent level lowered by source policy"
            );
        }

        let id = RecordId::compute(&ctx.owner_id, &request.source, &normalized);
        let provenance = Provenance::now(request.timestamp, bundle.map(str::to_string));

        let put = match self.corpus.store.append_provenance(&id, provenance.clone()).await {
            Ok(provenance_len) => crate::store::PutResult {
                id: id.clone(),
                duplicate: true,
                provenance_len,
            },
            Err(Error::NotFound(_)) => {
                let envelope = self
                    .corpus
                    .crypto
                    .encrypt(normalized.as_bytes(), &ctx.owner_id, CONTENT_FIELD)
                    .await?;
                let record = RecordBuilder::new(id.clone())
                    .owner_id(ctx.owner_id.clone())
                    .source(request.source.clone())
                    .timestamp(request.timestamp)
                    .consent_level(decision.allowed_level)
                    .envelope(envelope, normalized.chars().count())
                    .metadata(request.metadata)
                    .provenance(provenance)
                    .build()?;
                self.corpus.store.put(record).await?
            }
            Err(e) => return Err(e),
        };

        let mut record = self
            .corpus
            .store
            .get_unchecked(&id)
            .await
            .ok_or_else(|| Error::NotFound(format!("record {}", id)))?;

        let mut newly_indexed = false;
        if put.duplicate && !self.corpus.crypto.has_key(&record.envelope.key_id).await {
            // The stored copy was crypto-erased; this ingestion restores it
            let level = record.consent_level.ratchet(decision.allowed_level);
            let envelope = self
                .corpus
                .crypto
                .encrypt(normalized.as_bytes(), &ctx.owner_id, CONTENT_FIELD)
                .await?;
            record = self
                .corpus
                .store
                .update(&id, move |r| {
                    r.envelope = envelope;
                    r.consent_level = level;
                    Ok(())
                })
                .await?;
            self.corpus.index.remove(&id).await;
            tracing::info!(record_id = %id, level = %level, "Restored erased record content");
        } else if put.duplicate && decision.allowed_level < record.consent_level {
            self.set_level(&record, decision.allowed_level).await?;
            tracing::info!(
                record_id = %id,
                from = %record.consent_level,
                to = %decision.allowed_level,
                "Lowered consent level on re-ingestion"
            );
            record = self
                .corpus
                .store
                .get_unchecked(&id)
                .await
                .ok_or_else(|| Error::NotFound(format!("record {}", id)))?;
            newly_indexed = record.consent_level.is_indexable();
        }

        // Resumes indexing interrupted by an earlier failure
        let mut passages = self.corpus.index.count_for(&id).await;
        if passages == 0 && record.consent_level.is_indexable() {
            passages = self.index_record(&record).await?;
            newly_indexed = passages > 0;
        }

        Ok(IngestReport {
            record_id: put.id,
            requested_level: requested,
            applied_level: record.consent_level,
            duplicate: put.duplicate,
            provenance_len: put.provenance_len,
            passages,
            newly_indexed,
        })
    }

    /// Chunk, embed and index a record at its stored consent level,
    /// replacing any previous entries
    async fn index_record(&self, record: &Record) -> Result<usize> {
        let entries = self.build_entries(record).await?;
        if entries.is_empty() {
            self.corpus.index.remove(&record.id).await;
            return Ok(0);
        }
        let count = self.corpus.index.replace(&record.id, entries).await?;
        tracing::debug!(record_id = %record.id, passages = count, "Indexed record");
        Ok(count)
    }

    /// Index entries for a record at its stored consent level, without
    /// touching the index. Labels purged earlier stay out.
    async fn build_entries(&self, record: &Record) -> Result<Vec<VectorEntry>> {
        let level = record.consent_level;
        let Some(text) = self.corpus.view_text(record, level).await? else {
            return Ok(Vec::new());
        };

        let chunks: Vec<_> = self
            .chunker
            .chunk(&text)
            .into_iter()
            .filter(|c| {
                c.label
                    .as_ref()
                    .map_or(true, |l| !record.purged_labels.contains(l))
            })
            .collect();
        let pieces: Vec<String> = chunks
            .iter()
            .map(|c| text[c.span.start..c.span.end].to_string())
            .collect();

        // Owned inputs keep the future Send
        let embedder = self.embedder.clone();
        let embeddings: Vec<Vec<f32>> = stream::iter(pieces.clone())
            .map(move |piece| {
                let embedder = embedder.clone();
                async move { embedder.embed(&piece).await }
            })
            .buffered(EMBED_CONCURRENCY)
            .try_collect()
            .await?;

        Ok(chunks
            .into_iter()
            .zip(pieces)
            .zip(embeddings)
            .map(|((chunk, piece), embedding)| VectorEntry {
                record_id: record.id.clone(),
                owner_id: record.owner_id.clone(),
                source: record.source.clone(),
                tokens: self.tokens_for(&piece, chunk.label.as_deref()),
                span: chunk.span,
                label: chunk.label,
                event_time: record.timestamp,
                consent_level: level,
                embedding,
            })
            .collect())
    }

    /// Keyword tags for a span: its tokens plus its label
    fn tokens_for(&self, text: &str, label: Option<&str>) -> Vec<u64> {
        let mut tokens: Vec<u64> = self.corpus.hasher.token_set(text).into_iter().collect();
        if let Some(label) = label {
            tokens.push(self.corpus.hasher.hash_token(label));
        }
        tokens
    }

    // ---- reads ----

    /// Retrieve passages readable by the caller
    pub async fn retrieve(&self, ctx: &Context, query: &str, k: usize, filter: &RetrievalFilter) -> Vec<Passage> {
        let scope = match &filter.bundle {
            Some(name) => match self.bundle_for(ctx, name).await {
                Ok(bundle) => Some(bundle.record_ids.into_iter().collect::<HashSet<_>>()),
                Err(e) => {
                    tracing::warn!(bundle = %name, error = %e, "Retrieval scope unavailable");
                    return Vec::new();
                }
            },
            None => None,
        };

        let passages = self
            .retriever
            .retrieve(&ctx.owner_id, query, k, filter, scope.as_ref())
            .await;

        let target = filter.bundle.as_deref().unwrap_or("*");
        self.audit
            .record(
                AuditEntry::new(&ctx.owner_id, AuditAction::Retrieve, target)
                    .detail(format!("passages={}", passages.len())),
            )
            .await;
        passages
    }

    /// Read one record in the view the caller may currently see
    pub async fn read_record(&self, ctx: &Context, id: &RecordId) -> Result<RecordReadout> {
        let result = self.try_read_record(ctx, id).await;
        self.audit_outcome(&ctx.owner_id, AuditAction::Read, id.as_str(), &result, |r| {
            format!("view={:?}", r.view)
        })
        .await;
        result
    }

    async fn try_read_record(&self, ctx: &Context, id: &RecordId) -> Result<RecordReadout> {
        let record = self.corpus.store.get(id, &ctx.owner_id).await?;
        let view = self.corpus.current_view(&record).await;
        let level = match view {
            RecordView::Full => ConsentLevel::Full,
            RecordView::Anonymized => ConsentLevel::Anonymized,
            RecordView::MetadataOnly => ConsentLevel::MetadataOnly,
            RecordView::Deny => {
                return Err(Error::ConsentDenied(format!(
                    "source '{}' no longer permits reading record {}",
                    record.source, id
                )))
            }
        };
        let text = self.corpus.view_text(&record, level).await?;
        Ok(RecordReadout {
            record_id: record.id,
            source: record.source,
            timestamp: record.timestamp,
            consent_level: record.consent_level,
            view,
            metadata: record.metadata,
            provenance: record.provenance,
            text,
        })
    }

    async fn owned_record(&self, ctx: &Context, id: &RecordId) -> Result<Record> {
        let record = self.corpus.store.get(id, &ctx.owner_id).await?;
        if record.owner_id != ctx.owner_id {
            return Err(Error::AccessDenied(format!(
                "only the owner may change record {}",
                id
            )));
        }
        Ok(record)
    }

    // ---- consent ----

    /// Issue a confirmation token for raising a record to `level`
    pub async fn request_confirmation(&self, ctx: &Context, id: &RecordId, level: ConsentLevel) -> Result<ConfirmationToken> {
        self.owned_record(ctx, id).await?;
        Ok(self.corpus.gate.write().await.issue_confirmation(id, level))
    }

    /// Change a record's consent level.
    ///
    /// Lowering always succeeds; raising needs a token from
    /// [`request_confirmation`](Self::request_confirmation) and stays
    /// capped by the source policy. The record is re-encrypted under the
    /// active key and reindexed at its new level.
    pub async fn update_consent(
        &self,
        ctx: &Context,
        id: &RecordId,
        level: ConsentLevel,
        confirmation: Option<ConfirmationToken>,
    ) -> Result<ConsentLevel> {
        let result = self.try_update_consent(ctx, id, level, confirmation).await;
        self.audit_outcome(&ctx.owner_id, AuditAction::ConsentChange, id.as_str(), &result, |l| {
            format!("level={}", l)
        })
        .await;
        result
    }

    async fn try_update_consent(
        &self,
        ctx: &Context,
        id: &RecordId,
        level: ConsentLevel,
        confirmation: Option<ConfirmationToken>,
    ) -> Result<ConsentLevel> {
        let record = self.owned_record(ctx, id).await?;
        let applied = self.corpus.gate.write().await.authorize_change(
            id,
            &record.source,
            record.consent_level,
            level,
            confirmation,
        )?;
        if applied == record.consent_level {
            return Ok(applied);
        }
        self.set_level(&record, applied).await?;
        tracing::info!(record_id = %id, from = %record.consent_level, to = %applied, "Changed consent level");
        Ok(applied)
    }

    /// Re-encrypt a record at `level` and rebuild its index entries
    async fn set_level(&self, record: &Record, level: ConsentLevel) -> Result<()> {
        let text = self
            .corpus
            .crypto
            .decrypt_text(&record.envelope, &record.owner_id)
            .await?;
        let envelope = self
            .corpus
            .crypto
            .encrypt(text.as_bytes(), &record.owner_id, CONTENT_FIELD)
            .await?;
        let updated = self
            .corpus
            .store
            .update(&record.id, move |r| {
                r.consent_level = level;
                r.envelope = envelope;
                Ok(())
            })
            .await?;

        if level.is_indexable() {
            self.index_record(&updated).await?;
        } else {
            self.corpus.index.remove(&record.id).await;
        }
        Ok(())
    }

    /// Grant another owner read access to a record
    pub async fn share(&self, ctx: &Context, id: &RecordId, grantee: &str) -> Result<()> {
        let result = self.corpus.store.share(id, &ctx.owner_id, grantee).await;
        self.audit_outcome(&ctx.owner_id, AuditAction::Share, id.as_str(), &result, |_| {
            format!("grantee={}", grantee)
        })
        .await;
        result
    }

    // ---- export / import ----

    /// Export a bundle into `dir`, wrapping its data keys under
    /// `passphrase`
    pub async fn export(&self, ctx: &Context, name: &str, dir: &Path, passphrase: &str) -> Result<Manifest> {
        let result = self.try_export(ctx, name, dir, passphrase).await;
        self.audit_outcome(&ctx.owner_id, AuditAction::Export, name, &result, |m| {
            format!("records={} passages={}", m.record_count, m.passage_count)
        })
        .await;
        result
    }

    async fn try_export(&self, ctx: &Context, name: &str, dir: &Path, passphrase: &str) -> Result<Manifest> {
        let bundle = self.bundle_for(ctx, name).await?;

        let mut records = Vec::new();
        let mut entries = Vec::new();
        let mut key_ids = BTreeSet::new();
        let mut skipped = 0;
        for id in &bundle.record_ids {
            let Some(mut record) = self.corpus.store.get_unchecked(id).await else {
                tracing::warn!(record_id = %id, "Skipping missing record during export");
                continue;
            };
            if !self.corpus.crypto.has_key(&record.envelope.key_id).await {
                tracing::warn!(record_id = %id, key_id = %record.envelope.key_id, "Skipping erased record during export");
                skipped += 1;
                continue;
            }
            record.shared_with.clear();
            key_ids.insert(record.envelope.key_id.clone());
            for mut entry in self.corpus.index.entries_for(id).await {
                entry.tokens.clear();
                entries.push(entry);
            }
            records.push(record);
        }

        let salt = generate_key().to_vec();
        let iterations = self.config.crypto.kdf_iterations;
        let wrapping = derive_wrapping_key(passphrase, &salt, iterations)?;
        let key_ids: Vec<String> = key_ids.into_iter().collect();
        let keys = self.corpus.crypto.export_keys(&key_ids, &wrapping).await?;

        let manifest = Manifest {
            schema_version: SCHEMA_VERSION,
            bundle_name: bundle.name.clone(),
            owner_id: bundle.owner_id.clone(),
            created_at: bundle.created_at,
            exported_at: Utc::now(),
            bundle_version: bundle.version,
            record_count: records.len(),
            passage_count: entries.len(),
            skipped_records: skipped,
            embedder: self.embedder.name().to_string(),
            dimension: self.config.index.dimension,
        };
        let archive = Archive {
            manifest: manifest.clone(),
            policy: bundle.policy,
            records,
            entries,
            keys: KeysFile {
                salt,
                kdf_iterations: iterations,
                keys,
            },
        };
        archive.write(dir).await?;

        tracing::info!(
            bundle = name,
            records = manifest.record_count,
            passages = manifest.passage_count,
            "Exported bundle to {}",
            dir.display()
        );
        Ok(manifest)
    }

    /// Import an archive as a bundle owned by the caller.
    ///
    /// Everything is decrypted, checked and embedded before any state
    /// changes: an unknown schema version, a wrong passphrase, a content
    /// hash mismatch, an embedding failure or an existing bundle of the
    /// same name leaves the vault untouched. A failure while writing rolls
    /// back what was written. Records are re-encrypted under the local
    /// keyring.
    pub async fn import(&self, ctx: &Context, dir: &Path, passphrase: &str) -> Result<Bundle> {
        let result = self.try_import(ctx, dir, passphrase).await;
        let target = match &result {
            Ok(bundle) => bundle.name.clone(),
            Err(_) => dir.display().to_string(),
        };
        self.audit_outcome(&ctx.owner_id, AuditAction::Import, &target, &result, |b| {
            format!("records={}", b.record_ids.len())
        })
        .await;
        result
    }

    async fn try_import(&self, ctx: &Context, dir: &Path, passphrase: &str) -> Result<Bundle> {
        let archive = Archive::read(dir).await?;
        let name = archive.manifest.bundle_name.clone();
        validate_name(&name)?;
        if archive.manifest.dimension != self.config.index.dimension {
            return Err(Error::Validation(format!(
                "archive embeddings have {} dimensions, index expects {}",
                archive.manifest.dimension, self.config.index.dimension
            )));
        }
        if archive.policy.default_level == ConsentLevel::None {
            return Err(Error::ConsentDenied(format!(
                "bundle '{}' would admit no content",
                name
            )));
        }
        if self.bundles.read().await.contains_key(&name) {
            return Err(Error::Conflict(format!("bundle '{}' already exists", name)));
        }

        let wrapping = derive_wrapping_key(passphrase, &archive.keys.salt, archive.keys.kdf_iterations)?;
        let archive_ring = KeyRing::from_wrapped(&archive.keys.keys, &wrapping)?;

        // Open and check every record
        let mut prepared = Vec::new();
        let mut texts: HashMap<RecordId, (String, RecordId)> = HashMap::new();
        for record in &archive.records {
            self.validator.validate_record(record)?;
            let plaintext = open_with(&archive_ring, &record.envelope, &record.owner_id)?;
            let text = String::from_utf8(plaintext)
                .map_err(|_| Error::Validation(format!("record {} is not UTF-8 text", record.id)))?;
            if RecordId::compute(&record.owner_id, &record.source, &text) != record.id {
                return Err(Error::Validation(format!(
                    "record {} does not match its content",
                    record.id
                )));
            }
            let new_id = RecordId::compute(&ctx.owner_id, &record.source, &text);
            let level = record.consent_level.ratchet(archive.policy.default_level);
            texts.insert(record.id.clone(), (text.clone(), new_id.clone()));
            prepared.push((record, text, new_id, level));
        }

        // Rebind index entries to the new ids and recompute keyword tags
        let mut views: HashMap<(RecordId, ConsentLevel), String> = HashMap::new();
        let mut grouped: HashMap<RecordId, Vec<VectorEntry>> = HashMap::new();
        for mut entry in archive.entries {
            let (text, new_id) = texts.get(&entry.record_id).ok_or_else(|| {
                Error::Validation(format!("index entry for unknown record {}", entry.record_id))
            })?;
            if entry.embedding.len() != self.config.index.dimension || !entry.consent_level.is_indexable() {
                return Err(Error::Validation(format!(
                    "invalid index entry for record {}",
                    entry.record_id
                )));
            }
            let view = views
                .entry((entry.record_id.clone(), entry.consent_level))
                .or_insert_with(|| self.corpus.render(text.clone(), entry.consent_level));
            let piece = view.get(entry.span.start..entry.span.end).ok_or_else(|| {
                Error::Validation(format!("span out of range in record {}", entry.record_id))
            })?;
            entry.tokens = self.tokens_for(piece, entry.label.as_deref());
            entry.record_id = new_id.clone();
            entry.owner_id = ctx.owner_id.clone();
            grouped.entry(new_id.clone()).or_default().push(entry);
        }

        // Encrypt and embed everything before touching the vault
        let mut plans = Vec::with_capacity(prepared.len());
        for (record, text, new_id, level) in prepared {
            let envelope = self
                .corpus
                .crypto
                .encrypt(text.as_bytes(), &ctx.owner_id, CONTENT_FIELD)
                .await?;
            let mut imported = record.clone();
            imported.id = new_id.clone();
            imported.owner_id = ctx.owner_id.clone();
            imported.envelope = envelope;
            imported.consent_level = level;
            imported.shared_with.clear();

            let archived = grouped.remove(&new_id).unwrap_or_default();
            let local = self.corpus.store.get_unchecked(&new_id).await;
            let entries = match &local {
                // A local copy keeps its level; only missing entries are built
                Some(local) => {
                    if local.consent_level.is_indexable() && self.corpus.index.count_for(&new_id).await == 0 {
                        Some(self.build_entries(local).await?)
                    } else {
                        None
                    }
                }
                None if level == record.consent_level && !archived.is_empty() => Some(archived),
                None if level.is_indexable() => Some(self.build_entries(&imported).await?),
                None => None,
            };
            plans.push(ImportPlan {
                record: imported,
                local,
                entries,
            });
        }

        // Apply
        let mut bundles = self.bundles.write().await;
        if bundles.contains_key(&name) {
            return Err(Error::Conflict(format!("bundle '{}' already exists", name)));
        }
        let source = source_for(&name);
        let replaced_policy = {
            let mut gate = self.corpus.gate.write().await;
            let replaced = gate.unregister(&source);
            gate.register(archive.policy.source_policy(&source));
            replaced
        };

        let mut record_ids = BTreeSet::new();
        for (i, plan) in plans.iter().enumerate() {
            if let Err(e) = self.apply_import_plan(plan).await {
                self.rollback_import(&plans[..=i]).await;
                let mut gate = self.corpus.gate.write().await;
                gate.unregister(&source);
                if let Some(policy) = replaced_policy {
                    gate.register(policy);
                }
                return Err(e);
            }
            record_ids.insert(plan.record.id.clone());
        }

        let bundle = Bundle {
            name: name.clone(),
            owner_id: ctx.owner_id.clone(),
            policy: archive.policy,
            record_ids,
            created_at: archive.manifest.created_at,
            updated_at: Utc::now(),
            version: archive.manifest.bundle_version,
        };
        bundles.insert(name.clone(), bundle.clone());

        tracing::info!(
            bundle = %name,
            records = bundle.record_ids.len(),
            "Imported bundle from {}",
            dir.display()
        );
        Ok(bundle)
    }

    async fn apply_import_plan(&self, plan: &ImportPlan) -> Result<()> {
        let put = self.corpus.store.put(plan.record.clone()).await?;
        if put.duplicate != plan.local.is_some() {
            tracing::warn!(record_id = %put.id, "Record changed during import; keeping its index entries");
            return Ok(());
        }
        if let Some(entries) = plan.entries.clone().filter(|e| !e.is_empty()) {
            self.corpus.index.replace(&put.id, entries).await?;
        }
        Ok(())
    }

    /// Undo applied import plans: new records are deleted, existing ones
    /// get their provenance and index state back
    async fn rollback_import(&self, plans: &[ImportPlan]) {
        for plan in plans {
            let id = &plan.record.id;
            let restored = match &plan.local {
                Some(local) => {
                    if plan.entries.is_some() {
                        self.corpus.index.remove(id).await;
                    }
                    let provenance = local.provenance.clone();
                    self.corpus
                        .store
                        .update(id, move |r| {
                            r.provenance = provenance;
                            Ok(())
                        })
                        .await
                        .map(|_| ())
                }
                None if self.corpus.store.contains(id).await => {
                    self.corpus.store.delete(id, &self.corpus.index).await.map(|_| ())
                }
                None => Ok(()),
            };
            if let Err(e) = restored {
                tracing::warn!(record_id = %id, error = %e, "Import rollback incomplete");
            }
        }
    }

    // ---- maintenance ----

    /// Apply retention and downgrade windows as of `now`, then destroy
    /// retired keys past their retention together with the records they
    /// protected
    pub async fn apply_retention(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();

        for record in self.corpus.store.all().await {
            let policy = self.corpus.gate.read().await.policy_for(&record.source).cloned();
            let Some(policy) = policy else {
                continue;
            };
            if !self.corpus.crypto.has_key(&record.envelope.key_id).await {
                continue;
            }
            let age = now - record.first_ingested_at();

            if let Some(days) = policy.retention_days {
                if age > Duration::days(i64::from(days)) {
                    self.corpus.store.delete(&record.id, &self.corpus.index).await?;
                    self.detach_everywhere(&record.id).await;
                    self.audit
                        .record(
                            AuditEntry::new(&record.owner_id, AuditAction::Retention, record.id.as_str())
                                .detail("expired"),
                        )
                        .await;
                    report.expired.push(record.id);
                    continue;
                }
            }

            if let Some(days) = policy.downgrade_after_days {
                if record.consent_level == ConsentLevel::Full && age > Duration::days(i64::from(days)) {
                    self.set_level(&record, ConsentLevel::Anonymized).await?;
                    self.audit
                        .record(
                            AuditEntry::new(&record.owner_id, AuditAction::Retention, record.id.as_str())
                                .detail("downgraded to anonymized"),
                        )
                        .await;
                    report.downgraded.push(record.id);
                }
            }
        }

        report.pruned_keys = self.corpus.crypto.prune_expired(now).await;
        report.erased = self.drop_unreadable().await?;
        if !report.expired.is_empty() || !report.downgraded.is_empty() || !report.erased.is_empty() {
            tracing::info!(
                expired = report.expired.len(),
                downgraded = report.downgraded.len(),
                erased = report.erased.len(),
                "Applied retention"
            );
        }
        Ok(report)
    }

    /// Crypto-erase a retired data key and delete every record it
    /// protected, index entries included. Returns the deleted ids.
    pub async fn erase_key(&self, ctx: &Context, key_id: &str) -> Result<Vec<RecordId>> {
        let result = match self.corpus.crypto.erase(key_id).await {
            Ok(true) => self.drop_unreadable().await,
            Ok(false) => Err(Error::NotFound(format!("data key {}", key_id))),
            Err(e) => Err(e),
        };
        self.audit_outcome(&ctx.owner_id, AuditAction::KeyErasure, key_id, &result, |ids| {
            format!("records={}", ids.len())
        })
        .await;
        result
    }

    /// Delete records whose data key no longer exists
    async fn drop_unreadable(&self) -> Result<Vec<RecordId>> {
        let mut dropped = Vec::new();
        for record in self.corpus.store.all().await {
            if self.corpus.crypto.has_key(&record.envelope.key_id).await {
                continue;
            }
            self.corpus.store.delete(&record.id, &self.corpus.index).await?;
            self.detach_everywhere(&record.id).await;
            self.audit
                .record(
                    AuditEntry::new(&record.owner_id, AuditAction::KeyErasure, record.id.as_str())
                        .detail(format!("key {} erased", record.envelope.key_id)),
                )
                .await;
            dropped.push(record.id);
        }
        if !dropped.is_empty() {
            tracing::info!(count = dropped.len(), "Deleted records of erased keys");
        }
        Ok(dropped)
    }

    /// Finish deletes interrupted between index and store
    pub async fn reconcile(&self) -> Vec<RecordId> {
        let finalized = self.corpus.store.reconcile(&self.corpus.index).await;
        for id in &finalized {
            self.detach_everywhere(id).await;
        }
        finalized
    }

    async fn detach_everywhere(&self, id: &RecordId) {
        for bundle in self.bundles.write().await.values_mut() {
            bundle.detach(id);
        }
    }

    /// Rotate to a fresh data key. Existing records stay readable until
    /// the retired key is pruned.
    pub async fn rotate_keys(&self, ctx: &Context) -> String {
        let key_id = self.corpus.crypto.rotate().await;
        self.audit
            .record(AuditEntry::new(&ctx.owner_id, AuditAction::KeyRotation, &key_id))
            .await;
        key_id
    }

    /// Audit entries recorded for the caller
    pub async fn audit_entries(&self, ctx: &Context) -> Vec<AuditEntry> {
        self.audit.entries_for(&ctx.owner_id).await
    }

    async fn audit_outcome<T>(
        &self,
        owner_id: &str,
        action: AuditAction,
        target: &str,
        result: &Result<T>,
        detail: impl FnOnce(&T) -> String,
    ) {
        let entry = AuditEntry::new(owner_id, action, target);
        let entry = match result {
            Ok(value) => entry.detail(detail(value)),
            Err(e) => entry.failed(e.to_string()),
        };
        self.audit.record(entry).await;
    }
}

/// Build an ingestion request from a UTF-8 file; the event time is the
/// file's modification time
async fn read_input_file(path: &Path, source: String) -> Result<IngestRequest> {
    let text = tokio::fs::read_to_string(path).await?;
    let modified = tokio::fs::metadata(path)
        .await?
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    let timestamp = modified.min(Utc::now());

    let mut request = IngestRequest::new(source, timestamp, text);
    if let Some(file_name) = path.file_name().and_then(|n| n.to_str()) {
        request = request.metadata("file", serde_json::Value::String(file_name.to_string()));
    }
    Ok(request)
}
