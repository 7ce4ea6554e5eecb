//! Content repository: CRUD over namespaced buckets.
//!
//! Every mutation is one sled transaction spanning the target bucket and, when
//! needed, the slug index and the id sequence tree; either all of it commits or
//! nothing does. Derived state is refreshed afterwards, outside the
//! transaction: the sorted index through the [`RefreshScheduler`] and the
//! search index through the [`SearchDispatcher`].

use crate::codec::{
    slugify, FieldMap, NamespaceDescriptor, Record, TypeRegistry, ID_FIELD, SLUG_FIELD,
    UPDATED_FIELD, UUID_FIELD,
};
use crate::error::{ContentError, ContentResult};
use crate::index::{RefreshScheduler, SlugIndex};
use crate::search::SearchDispatcher;
use crate::storage::backend::decode_sequence;
use crate::storage::{id_key, Backend, Namespace};
use serde_json::{Map, Value};
use sled::transaction::{
    ConflictableTransactionError, TransactionResult, TransactionalTree,
};
use sled::Transactional;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use uuid::Uuid;

/// Id that asks for a new record to be allocated.
pub const NEW_ID: &str = "-1";

type TxResult<T> = Result<T, ConflictableTransactionError<ContentError>>;

/// How fresh the derived indexes must be when a mutation returns.
///
/// Inserts and updates normally run [`Consistency::Eventual`]; deletes run
/// [`Consistency::Immediate`] so list views never show a removed record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Consistency {
    /// Rebuild the sorted index before returning.
    Immediate,
    /// Schedule a debounced rebuild.
    #[default]
    Eventual,
}

/// A parsed `namespace:id` address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub namespace: String,
    pub id: String,
}

impl Target {
    pub fn parse(raw: &str) -> ContentResult<Self> {
        let (namespace, id) = raw
            .split_once(':')
            .ok_or_else(|| ContentError::InvalidArgument(format!("bad target {:?}", raw)))?;
        Ok(Self {
            namespace: namespace.to_string(),
            id: id.to_string(),
        })
    }

    pub fn is_new(&self) -> bool {
        self.id == NEW_ID
    }
}

/// Reads and writes records in namespaced buckets.
pub struct ContentRepository {
    backend: Arc<Backend>,
    registry: Arc<TypeRegistry>,
    slugs: SlugIndex,
    scheduler: Arc<RefreshScheduler>,
    search: SearchDispatcher,
}

impl ContentRepository {
    pub fn new(
        backend: Arc<Backend>,
        registry: Arc<TypeRegistry>,
        scheduler: Arc<RefreshScheduler>,
        search: SearchDispatcher,
    ) -> Self {
        Self {
            slugs: SlugIndex::new(backend.clone()),
            backend,
            registry,
            scheduler,
            search,
        }
    }

    /// Inserts (`id == -1`) or fully replaces the record at `target`.
    ///
    /// Replacing an id that does not exist fails with `NotFound`; `set` never
    /// creates a record at a caller-chosen id. Use [`ContentRepository::import`]
    /// for that.
    pub fn set(&self, target: &str, fields: FieldMap, consistency: Consistency) -> ContentResult<u64> {
        let target = Target::parse(target)?;
        if target.is_new() {
            self.insert(&target.namespace, fields, consistency)
        } else {
            self.update(&target.namespace, &target.id, fields, false, consistency)
        }
    }

    /// Inserts a new record and returns its id.
    ///
    /// Primary records without a submitted slug get one derived by the
    /// namespace's slug hook; either way the slug is made unique with a `-N`
    /// suffix and claimed in the same transaction.
    pub fn insert(&self, namespace: &str, fields: FieldMap, consistency: Consistency) -> ContentResult<u64> {
        let ns = parse_writable_namespace(namespace)?;
        let descriptor = self.registry.get(ns.kind())?;

        let mut fields = fields.reassemble();
        fields.remove(ID_FIELD);
        fields.remove(UUID_FIELD);
        let requested_slug = fields
            .remove(SLUG_FIELD)
            .and_then(|values| values.into_iter().next())
            .map(|s| slugify(&s))
            .filter(|s| !s.is_empty());

        let mut record = descriptor.zero();
        descriptor.decode(&mut record, &fields)?;

        let now = now_millis();
        if record.timestamp() == 0 {
            record.set_timestamp(now);
        }
        if !fields.contains(UPDATED_FIELD) {
            record.set_updated(now);
        }
        record.set_uuid(&Uuid::new_v4().to_string());

        let slug_candidate = if ns.is_primary() {
            requested_slug.or_else(|| descriptor.slug_of(&record))
        } else {
            if let Some(slug) = &requested_slug {
                record.set_slug(slug);
            }
            None
        };

        let bucket_name = ns.bucket();
        let bucket = self.backend.bucket_or_create(&bucket_name)?;
        let result: TransactionResult<(u64, Vec<u8>), ContentError> = (
            &bucket,
            self.backend.content_index(),
            self.backend.sequences(),
        )
            .transaction(|(tx_bucket, tx_slugs, tx_seq)| {
                let id = next_sequence(tx_seq, &bucket_name)?;
                let mut record = record.clone();
                record.set_id(id);

                if let Some(candidate) = &slug_candidate {
                    let slug = SlugIndex::claim(tx_slugs, candidate, &index_target(&ns, id))?;
                    record.set_slug(&slug);
                }

                let raw = record.to_bytes().map_err(abort)?;
                tx_bucket.insert(&id_key(id)[..], raw.clone())?;
                Ok((id, raw))
            });
        let (id, raw) = result?;

        debug!(namespace = %ns, id, "Inserted record");
        self.after_write(&ns, id, raw, consistency);
        Ok(id)
    }

    /// Updates the record `namespace:id`.
    ///
    /// With `merge_existing` the fields are decoded onto the stored record and
    /// untouched fields survive; without it they are decoded onto a zero record
    /// and every omitted field resets. `id`, `uuid` and `slug` never change.
    ///
    /// The record must already exist in either mode: a missing id fails with
    /// `NotFound` instead of being created.
    pub fn update(
        &self,
        namespace: &str,
        id: &str,
        fields: FieldMap,
        merge_existing: bool,
        consistency: Consistency,
    ) -> ContentResult<u64> {
        let ns = parse_writable_namespace(namespace)?;
        let id = parse_id(id)?;
        let descriptor = self.registry.get(ns.kind())?;

        let mut fields = fields.reassemble();
        for field in [ID_FIELD, UUID_FIELD, SLUG_FIELD] {
            fields.remove(field);
        }
        let stamp_updated = !fields.contains(UPDATED_FIELD);
        let now = now_millis();

        let bucket = self
            .backend
            .bucket(&ns.bucket())?
            .ok_or_else(|| ContentError::NotFound(format!("bucket {}", ns)))?;
        let result: TransactionResult<Vec<u8>, ContentError> = bucket.transaction(|tx| {
            let stored = tx
                .get(&id_key(id)[..])?
                .ok_or_else(|| abort(ContentError::NotFound(format!("{}:{}", ns, id))))?;
            let existing = descriptor.decode_bytes(&stored).map_err(abort)?;

            let record = merge_onto(descriptor, &existing, &fields, merge_existing, stamp_updated.then_some(now))
                .map_err(abort)?;
            let raw = record.to_bytes().map_err(abort)?;
            tx.insert(&id_key(id)[..], raw.clone())?;
            Ok(raw)
        });
        let raw = result?;

        debug!(namespace = %ns, id, merge_existing, "Updated record");
        self.after_write(&ns, id, raw, consistency);
        Ok(id)
    }

    /// Deletes `namespace:id` together with its slug index entry.
    pub fn delete(&self, namespace: &str, id: &str, consistency: Consistency) -> ContentResult<()> {
        let ns = parse_writable_namespace(namespace)?;
        let id = parse_id(id)?;
        let target = index_target(&ns, id);

        let bucket = self
            .backend
            .bucket(&ns.bucket())?
            .ok_or_else(|| ContentError::NotFound(format!("bucket {}", ns)))?;
        let result: TransactionResult<(), ContentError> = (&bucket, self.backend.content_index())
            .transaction(|(tx_bucket, tx_slugs)| {
                let stored = tx_bucket
                    .get(&id_key(id)[..])?
                    .ok_or_else(|| abort(ContentError::NotFound(format!("{}:{}", ns, id))))?;
                let record = Record::from_bytes(&stored).map_err(abort)?;

                tx_bucket.remove(&id_key(id)[..])?;
                if ns.is_primary() {
                    if let Some(slug) = record.slug() {
                        SlugIndex::release(tx_slugs, slug, &target)?;
                    }
                }
                Ok(())
            });
        result?;

        debug!(namespace = %ns, id, "Deleted record");
        if ns.is_primary() {
            self.search.notify_delete(target);
            self.refresh(&ns, consistency);
        }
        Ok(())
    }

    /// Raw bytes of `namespace:id`.
    pub fn get(&self, namespace: &str, id: &str) -> ContentResult<Vec<u8>> {
        let ns = parse_namespace(namespace)?;
        let id = parse_id(id)?;
        self.get_raw(&ns.bucket(), id)
    }

    /// Every record of a bucket in id order. A missing bucket is empty.
    pub fn get_all(&self, namespace: &str) -> ContentResult<Vec<Vec<u8>>> {
        let ns = parse_namespace(namespace)?;
        let Some(bucket) = self.backend.bucket(&ns.bucket())? else {
            return Ok(Vec::new());
        };

        let mut records = Vec::with_capacity(bucket.len());
        for value in bucket.iter().values() {
            records.push(value?.to_vec());
        }
        Ok(records)
    }

    /// Fetches every `namespace:id` target, failing if any is missing.
    pub fn get_multi<S: AsRef<str>>(&self, targets: &[S]) -> ContentResult<Vec<Vec<u8>>> {
        targets
            .iter()
            .map(|raw| {
                let target = Target::parse(raw.as_ref())?;
                self.get(&target.namespace, &target.id)
            })
            .collect()
    }

    /// Looks a slug up and returns the owning namespace and the record.
    pub fn get_by_slug(&self, slug: &str) -> ContentResult<(String, Vec<u8>)> {
        let (namespace, id) = self.slugs.resolve(slug)?;
        let raw = self.get_raw(&namespace, id)?;
        Ok((namespace, raw))
    }

    /// Stores the `field` rows attached to `namespace:id`. Each row gets a
    /// back-reference `field: "<id>"`.
    pub fn set_subcollection(
        &self,
        namespace: &str,
        id: &str,
        field: &str,
        rows: Vec<Map<String, Value>>,
    ) -> ContentResult<()> {
        let ns = parse_writable_namespace(namespace)?;
        let id = parse_id(id)?;
        if field.is_empty() {
            return Err(ContentError::InvalidArgument("empty sub-collection field".to_string()));
        }

        let rows: Vec<Map<String, Value>> = rows
            .into_iter()
            .map(|mut row| {
                row.insert(field.to_string(), Value::from(id.to_string()));
                row
            })
            .collect();
        let raw = serde_json::to_vec(&rows)?;

        let tree = self.backend.bucket_or_create(&ns.subcollection_bucket(field))?;
        tree.insert(&id_key(id)[..], raw)?;
        debug!(namespace = %ns, id, field, rows = rows.len(), "Stored sub-collection");
        Ok(())
    }

    /// Raw JSON array stored by [`ContentRepository::set_subcollection`].
    pub fn get_subcollection(&self, namespace: &str, id: &str, field: &str) -> ContentResult<Vec<u8>> {
        let ns = parse_namespace(namespace)?;
        let id = parse_id(id)?;
        self.get_raw(&ns.subcollection_bucket(field), id)
    }

    /// Writes a previously dumped record back at its own id.
    ///
    /// The namespace sequence is advanced past the id so later inserts never
    /// collide with it, and the record's slug is claimed again (suffixed if
    /// another record took it in the meantime).
    pub fn import(&self, namespace: &str, raw: &[u8]) -> ContentResult<u64> {
        let ns = parse_writable_namespace(namespace)?;
        let descriptor = self.registry.get(ns.kind())?;
        let mut record = descriptor.decode_bytes(raw)?;
        let id = u64::try_from(record.id())
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| ContentError::InvalidId(record.id().to_string()))?;
        if record.uuid().is_none() {
            record.set_uuid(&Uuid::new_v4().to_string());
        }

        let bucket_name = ns.bucket();
        let bucket = self.backend.bucket_or_create(&bucket_name)?;
        let target = index_target(&ns, id);
        let result: TransactionResult<Vec<u8>, ContentError> = (
            &bucket,
            self.backend.content_index(),
            self.backend.sequences(),
        )
            .transaction(|(tx_bucket, tx_slugs, tx_seq)| {
                advance_sequence(tx_seq, &bucket_name, id)?;
                let mut record = record.clone();

                if ns.is_primary() {
                    if let Some(previous) = tx_bucket.get(&id_key(id)[..])? {
                        if let Some(slug) = Record::from_bytes(&previous).map_err(abort)?.slug() {
                            SlugIndex::release(tx_slugs, slug, &target)?;
                        }
                    }
                    if let Some(candidate) = record.slug().map(str::to_string) {
                        let slug = SlugIndex::claim(tx_slugs, &candidate, &target)?;
                        record.set_slug(&slug);
                    }
                }

                let raw = record.to_bytes().map_err(abort)?;
                tx_bucket.insert(&id_key(id)[..], raw.clone())?;
                Ok(raw)
            });
        let raw = result?;

        debug!(namespace = %ns, id, "Imported record");
        self.after_write(&ns, id, raw, Consistency::Eventual);
        Ok(id)
    }

    fn get_raw(&self, bucket: &str, id: u64) -> ContentResult<Vec<u8>> {
        let tree = self
            .backend
            .bucket(bucket)?
            .ok_or_else(|| ContentError::NotFound(format!("bucket {}", bucket)))?;
        tree.get(&id_key(id)[..])?
            .map(|v| v.to_vec())
            .ok_or_else(|| ContentError::NotFound(format!("{}:{}", bucket, id)))
    }

    /// Every written variant is sent to search; only the primary one feeds the
    /// sorted index.
    fn after_write(&self, ns: &Namespace, id: u64, raw: Vec<u8>, consistency: Consistency) {
        self.search.notify_update(index_target(ns, id), raw);
        if ns.is_primary() {
            self.refresh(ns, consistency);
        }
    }

    fn refresh(&self, ns: &Namespace, consistency: Consistency) {
        match consistency {
            Consistency::Eventual => self.scheduler.request_refresh(ns),
            Consistency::Immediate => {
                if let Err(e) = self.scheduler.refresh_now(ns) {
                    warn!(namespace = %ns, "Sorted index refresh failed: {}", e);
                }
            }
        }
    }
}

/// Builds the updated record. `updated_at` is stamped when the caller did not
/// submit `updated` itself.
fn merge_onto(
    descriptor: &NamespaceDescriptor,
    existing: &Record,
    fields: &FieldMap,
    merge_existing: bool,
    updated_at: Option<i64>,
) -> ContentResult<Record> {
    let mut record = if merge_existing {
        existing.clone()
    } else {
        descriptor.zero()
    };
    descriptor.decode(&mut record, fields)?;

    for field in [ID_FIELD, UUID_FIELD, SLUG_FIELD] {
        match existing.get(field) {
            Some(value) => record.insert(field, value.clone()),
            None => {
                record.remove(field);
            }
        }
    }
    if record.timestamp() == 0 {
        record.set_timestamp(existing.timestamp());
    }
    if let Some(now) = updated_at {
        record.set_updated(now);
    }
    Ok(record)
}

fn next_sequence(tx: &TransactionalTree, bucket: &str) -> TxResult<u64> {
    let last = match tx.get(bucket.as_bytes())? {
        Some(raw) => decode_sequence(bucket, &raw).map_err(abort)?,
        None => 0,
    };
    let next = last + 1;
    tx.insert(bucket.as_bytes(), &next.to_be_bytes()[..])?;
    Ok(next)
}

fn advance_sequence(tx: &TransactionalTree, bucket: &str, id: u64) -> TxResult<()> {
    let last = match tx.get(bucket.as_bytes())? {
        Some(raw) => decode_sequence(bucket, &raw).map_err(abort)?,
        None => 0,
    };
    if id > last {
        tx.insert(bucket.as_bytes(), &id.to_be_bytes()[..])?;
    }
    Ok(())
}

fn abort<E: Into<ContentError>>(e: E) -> ConflictableTransactionError<ContentError> {
    ConflictableTransactionError::Abort(e.into())
}

/// `kind:id`, the form stored in the slug index and sent to search.
fn index_target(ns: &Namespace, id: u64) -> String {
    format!("{}:{}", ns.kind(), id)
}

fn parse_namespace(raw: &str) -> ContentResult<Namespace> {
    Namespace::parse(raw).map_err(ContentError::InvalidArgument)
}

/// Derived variants such as `__sorted` are rebuilt by the engine and never
/// written through the repository.
fn parse_writable_namespace(raw: &str) -> ContentResult<Namespace> {
    let ns = parse_namespace(raw)?;
    if !ns.is_writable() {
        return Err(ContentError::InvalidArgument(format!("namespace {} is not writable", raw)));
    }
    Ok(ns)
}

/// Ids are positive integers; `-1` is only meaningful to [`ContentRepository::set`].
pub fn parse_id(raw: &str) -> ContentResult<u64> {
    match raw.trim().parse::<i64>() {
        Ok(id) if id >= 1 => Ok(id as u64),
        _ => Err(ContentError::InvalidId(raw.to_string())),
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
