//! Collaborator boundaries.
//!
//! The pipeline drives four external services — OCR, LLM extraction, the
//! output-profile store, and object storage — through the traits defined
//! here. Implementations are injected at [`Engine::start`](crate::Engine)
//! time; nothing in this crate holds a process-wide client. All calls are
//! blocking-with-timeout from the pipeline's perspective: OCR and extraction
//! calls carry the configured budget, and an implementation that exceeds it
//! should return [`ExtractError::Timeout`] rather than block forever.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;

use crate::error::{ExtractError, ProfileError};
use crate::profile::OutputProfile;
use crate::split::PageRange;

/// Text recognized from a contiguous page range of the source document.
#[derive(Debug, Clone)]
pub struct OcrText {
    pub text: String,
    /// Pages the engine actually processed; billed per page.
    pub page_count: u32,
}

/// Converts document pages into text/structure.
pub trait OcrEngine: Send + Sync {
    /// Total page count of the document. Used once per job, before
    /// splitting.
    fn page_count(&self, document: &[u8], timeout: Duration) -> Result<u32, ExtractError>;

    /// Recognizes the given page range. `pages` is 1-based inclusive.
    fn recognize(
        &self,
        document: &[u8],
        pages: PageRange,
        timeout: Duration,
    ) -> Result<OcrText, ExtractError>;
}

/// One extraction call: unit text plus the profile's prompt.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRequest<'a> {
    pub text: &'a str,
    pub prompt: &'a str,
    /// Caller-requested model, forwarded verbatim. The extractor reports
    /// the model it actually used.
    pub model_hint: Option<&'a str>,
    /// Budget for the underlying service call.
    pub timeout: Duration,
}

/// One structured entity as reported by the extractor, before type
/// validation. `page_no` is 1-based *within the unit*; consolidation maps
/// it back to the absolute page number.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub page_no: u32,
    pub fields: Vec<(String, serde_json::Value)>,
    pub confidence_score: Option<f64>,
}

/// Extractor output for one unit.
#[derive(Debug, Clone)]
pub struct RawExtraction {
    pub records: Vec<RawRecord>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Model the collaborator actually ran; prices are looked up by this
    /// name.
    pub model_used: String,
    /// Unit-level confidence, used for records that carry none of their
    /// own.
    pub confidence_score: f64,
}

/// Converts recognized text plus a prompt into structured records.
pub trait RecordExtractor: Send + Sync {
    fn extract(&self, request: &ExtractionRequest<'_>) -> Result<RawExtraction, ExtractError>;
}

/// Read-only lookup of output profiles. Per category there is at most one
/// profile per tenant and at most one default.
pub trait ProfileStore: Send + Sync {
    fn tenant_profile(
        &self,
        tenant_id: &str,
        category_id: u32,
    ) -> Result<Option<OutputProfile>, ProfileError>;

    fn default_profile(&self, category_id: u32) -> Result<Option<OutputProfile>, ProfileError>;
}

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("Object '{reference}' not found")]
    NotFound { reference: String },

    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Stores and retrieves opaque blobs by reference. Source documents are
/// downloaded from here; rendered outputs are uploaded here and their
/// references delivered to the caller.
pub trait ObjectStore: Send + Sync {
    fn download(&self, reference: &str) -> Result<Vec<u8>, ObjectStoreError>;

    /// Returns the reference under which the object is reachable.
    fn upload(
        &self,
        filename: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<String, ObjectStoreError>;
}

/// In-process object store. Backs tests and single-process deployments
/// where outputs are picked up from memory by the embedding application.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an object under an explicit reference, e.g. an uploaded
    /// source document.
    pub fn put(&self, reference: &str, content_type: &str, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(
            reference.to_string(),
            StoredObject {
                content_type: content_type.to_string(),
                bytes,
            },
        );
    }

    pub fn get(&self, reference: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(reference).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().unwrap().is_empty()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn download(&self, reference: &str) -> Result<Vec<u8>, ObjectStoreError> {
        self.objects
            .lock()
            .unwrap()
            .get(reference)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| ObjectStoreError::NotFound {
                reference: reference.to_string(),
            })
    }

    fn upload(
        &self,
        filename: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<String, ObjectStoreError> {
        let reference = format!("mem://{filename}");
        self.put(&reference, content_type, bytes.to_vec());
        Ok(reference)
    }
}

/// Fixed in-memory profile store, populated up front. Serves as the test
/// double and as the production store for deployments that ship profiles in
/// configuration instead of a database.
#[derive(Default)]
pub struct StaticProfileStore {
    tenants: HashMap<(String, u32), OutputProfile>,
    defaults: HashMap<u32, OutputProfile>,
}

impl StaticProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, tenant_id: &str, category_id: u32, profile: OutputProfile) -> Self {
        self.tenants
            .insert((tenant_id.to_string(), category_id), profile);
        self
    }

    pub fn with_default(mut self, category_id: u32, profile: OutputProfile) -> Self {
        self.defaults.insert(category_id, profile);
        self
    }

    /// Category ids with a default profile. Intake validates category ids
    /// against this set when the store is the static one.
    pub fn known_categories(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.defaults.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl ProfileStore for StaticProfileStore {
    fn tenant_profile(
        &self,
        tenant_id: &str,
        category_id: u32,
    ) -> Result<Option<OutputProfile>, ProfileError> {
        Ok(self
            .tenants
            .get(&(tenant_id.to_string(), category_id))
            .cloned())
    }

    fn default_profile(&self, category_id: u32) -> Result<Option<OutputProfile>, ProfileError> {
        Ok(self.defaults.get(&category_id).cloned())
    }
}
