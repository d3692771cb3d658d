//! Kegs: versioned, optionally encrypted records in a remote database.
//!
//! A keg's payload is serialized to a JSON object, stamped with its own id
//! and type under `_sys`, and sealed with the database key (or the keg's
//! override key). On load the stamp is checked against the unencrypted record
//! metadata, so the server cannot swap one keg's ciphertext into another.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

use kegs_core::types::PropValue;
use kegs_core::{KegError, KegResult};
use kegs_crypto::{secret, SymmetricKey};

use crate::remote::{RawRecord, RecordUpdate, RemoteStore};

const SYS_FIELD: &str = "_sys";
const KEY_ID: &str = "0";

/// A keg database: its remote id and the key its kegs are sealed with.
#[derive(Debug, Clone)]
pub struct KegDb {
    pub id: String,
    key: SymmetricKey,
}

impl KegDb {
    pub fn new(id: impl Into<String>, key: SymmetricKey) -> Self {
        Self { id: id.into(), key }
    }

    pub fn key(&self) -> &SymmetricKey {
        &self.key
    }
}

/// Conversion between a keg's typed payload and its JSON object form.
pub trait KegPayload: Send + Sync {
    fn serialize_payload(&self) -> KegResult<Map<String, Value>>;
    fn deserialize_payload(&mut self, payload: Map<String, Value>) -> KegResult<()>;
}

/// Untyped payload: the JSON object itself.
impl KegPayload for Map<String, Value> {
    fn serialize_payload(&self) -> KegResult<Map<String, Value>> {
        Ok(self.clone())
    }

    fn deserialize_payload(&mut self, payload: Map<String, Value>) -> KegResult<()> {
        *self = payload;
        Ok(())
    }
}

pub struct Keg<P: KegPayload> {
    id: Option<String>,
    kind: String,
    version: u64,
    collection_version: u64,
    plaintext: bool,
    override_key: Option<SymmetricKey>,
    pub props: BTreeMap<String, PropValue>,
    pub payload: P,
}

impl<P: KegPayload> Keg<P> {
    pub fn new(kind: impl Into<String>, payload: P) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            version: 0,
            collection_version: 0,
            plaintext: false,
            override_key: None,
            props: BTreeMap::new(),
            payload,
        }
    }

    /// Handle to an existing remote keg, to be filled by `load`.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Store the payload unencrypted and without an anti-tamper stamp.
    pub fn plaintext(mut self) -> Self {
        self.plaintext = true;
        self
    }

    /// Seal with this key instead of the database key.
    pub fn with_override_key(mut self, key: SymmetricKey) -> Self {
        self.override_key = Some(key);
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn collection_version(&self) -> u64 {
        self.collection_version
    }

    pub fn is_plaintext(&self) -> bool {
        self.plaintext
    }

    /// Created remotely but never saved with a payload.
    pub fn is_empty(&self) -> bool {
        self.version <= 1
    }

    fn key<'a>(&'a self, db: &'a KegDb) -> &'a SymmetricKey {
        self.override_key.as_ref().unwrap_or(&db.key)
    }

    /// Create the remote record. A keg that already has an id is left alone.
    pub async fn create(&mut self, db: &KegDb, store: &dyn RemoteStore) -> KegResult<()> {
        if self.id.is_some() {
            return Ok(());
        }
        let created = store.create_record(&db.id, &self.kind).await?;
        debug!(db = %db.id, kind = %self.kind, id = %created.id, "created keg");

        self.id = Some(created.id);
        self.version = created.version;
        self.collection_version = created.collection_version;
        Ok(())
    }

    /// Save the current payload as the next version, creating the keg first
    /// if needed. On `VersionConflict` the local version is unchanged.
    pub async fn save(&mut self, db: &KegDb, store: &dyn RemoteStore) -> KegResult<()> {
        self.create(db, store).await?;
        let id = self
            .id
            .clone()
            .ok_or_else(|| KegError::Other("keg has no id after create".into()))?;

        let next_version = self.version + 1;
        let update = RecordUpdate {
            id: id.clone(),
            kind: self.kind.clone(),
            key_id: KEY_ID.to_string(),
            payload: self.seal_payload(db, &id)?,
            props: self.props.clone(),
            version: next_version,
        };

        let ack = store.update_record(&db.id, update).await?;
        self.version = next_version;
        self.collection_version = ack.collection_version;
        info!(db = %db.id, id = %id, version = next_version, "saved keg");
        Ok(())
    }

    /// Fetch the remote record and replace local state with it.
    pub async fn load(&mut self, db: &KegDb, store: &dyn RemoteStore) -> KegResult<()> {
        let id = self
            .id
            .clone()
            .ok_or_else(|| KegError::Other(format!("cannot load {} keg without an id", self.kind)))?;
        let record = store.get_record(&db.id, &id).await?;
        self.apply_record(db, record)
    }

    /// Rehydrate from a raw record (e.g. one delivered by a collection sync).
    ///
    /// A record whose stamp does not match fails with `TamperDetected` and
    /// leaves the keg untouched.
    pub fn apply_record(&mut self, db: &KegDb, record: RawRecord) -> KegResult<()> {
        if let Some(id) = &self.id {
            if *id != record.id {
                return Err(KegError::Other(format!(
                    "cannot rehydrate keg {id} with data from keg {}",
                    record.id
                )));
            }
        }

        if let Some(payload) = &record.payload {
            let mut map = self.open_payload(db, payload)?;
            if !self.plaintext {
                self.check_stamp(&mut map, &record)?;
            }
            self.payload.deserialize_payload(map)?;
        }

        self.id = Some(record.id);
        self.version = record.version;
        self.collection_version = record.collection_version;
        self.props = record.props;
        Ok(())
    }

    fn seal_payload(&self, db: &KegDb, id: &str) -> KegResult<Vec<u8>> {
        let mut map = self.payload.serialize_payload()?;
        if self.plaintext {
            return Ok(serde_json::to_vec(&map)?);
        }

        let mut stamp = Map::new();
        stamp.insert("kegId".into(), Value::String(id.to_string()));
        stamp.insert("type".into(), Value::String(self.kind.clone()));
        map.insert(SYS_FIELD.into(), Value::Object(stamp));

        let json = serde_json::to_string(&map)?;
        secret::seal_str(&json, self.key(db)).map_err(|e| KegError::Crypto(format!("{e:#}")))
    }

    fn open_payload(&self, db: &KegDb, payload: &[u8]) -> KegResult<Map<String, Value>> {
        let bytes = if self.plaintext {
            payload.to_vec()
        } else {
            secret::open(payload, self.key(db)).map_err(|e| KegError::Crypto(format!("{e:#}")))?
        };

        match serde_json::from_slice::<Value>(&bytes)? {
            Value::Object(map) => Ok(map),
            other => Err(KegError::Serialization(format!(
                "keg payload is not an object: {other}"
            ))),
        }
    }

    /// Compare the sealed `_sys` stamp with the unencrypted metadata and
    /// strip it from the payload.
    fn check_stamp(&self, map: &mut Map<String, Value>, record: &RawRecord) -> KegResult<()> {
        let stamp = map
            .remove(SYS_FIELD)
            .ok_or_else(|| KegError::TamperDetected(format!("keg {} has no _sys stamp", record.id)))?;

        let inner_id = stamp.get("kegId").and_then(Value::as_str);
        let inner_kind = stamp.get("type").and_then(Value::as_str);

        if inner_id != Some(record.id.as_str()) {
            return Err(KegError::TamperDetected(format!(
                "keg {} carries payload of keg {}",
                record.id,
                inner_id.unwrap_or("<none>")
            )));
        }
        if inner_kind != Some(record.kind.as_str()) || record.kind != self.kind {
            return Err(KegError::TamperDetected(format!(
                "keg {} of type {} carries payload of type {}",
                record.id,
                record.kind,
                inner_kind.unwrap_or("<none>")
            )));
        }
        Ok(())
    }
}
