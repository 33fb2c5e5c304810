#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;

use ember_core::{ExecutionMode, KernelKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TRACE_SCHEMA_VERSION: u32 = 1;
const MAX_TRACE_PAYLOAD_BYTES: usize = 1_048_576;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Policy,
    Prepare,
    Transform,
    CacheHit,
    CacheStore,
    Run,
    Trace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Session-scoped policy plus the ledger every dispatch decision lands in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    mode: ExecutionMode,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        let mut ledger = EvidenceLedger::new();
        ledger.record(EvidenceKind::Policy, format!("mode initialized to {mode}"));
        Self { mode, ledger }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
        self.ledger
            .record(EvidenceKind::Policy, format!("mode switched to {mode}"));
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }

    pub fn record_prepare(&mut self, op_type: &str, key: KernelKey, path: &str, fallback: bool) {
        self.ledger.record(
            EvidenceKind::Prepare,
            format!("op={op_type} key={key} path={path} fallback={fallback}"),
        );
    }

    pub fn record_transforms(&mut self, op_type: &str, count: u64) {
        if count > 0 {
            self.ledger.record(
                EvidenceKind::Transform,
                format!("op={op_type} transformed_inputs={count}"),
            );
        }
    }

    pub fn record_cache_activity(&mut self, op_type: &str, hits: u64, stores: u64) {
        if hits > 0 {
            self.ledger
                .record(EvidenceKind::CacheHit, format!("op={op_type} hits={hits}"));
        }
        if stores > 0 {
            self.ledger.record(
                EvidenceKind::CacheStore,
                format!("op={op_type} stores={stores}"),
            );
        }
    }

    pub fn record_run(&mut self, op_type: &str, key: KernelKey) {
        self.ledger
            .record(EvidenceKind::Run, format!("op={op_type} key={key}"));
    }

    pub fn record_trace_export(&mut self, events: usize, bytes: usize) {
        self.ledger.record(
            EvidenceKind::Trace,
            format!("exported events={events} bytes={bytes}"),
        );
    }

    pub fn record_trace_decode_failure<E>(&mut self, mode: &str, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.ledger.record(
            EvidenceKind::Trace,
            format!("trace decode failure mode={mode}: {error}"),
        );
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

// ── dispatch trace codec ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceMode {
    Strict,
    Hardened,
}

impl From<ExecutionMode> for TraceMode {
    fn from(mode: ExecutionMode) -> Self {
        match mode {
            ExecutionMode::Strict => Self::Strict,
            ExecutionMode::Hardened => Self::Hardened,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Strict,
    Hardened,
}

/// One dispatched operator as it appears in an exported trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceEvent {
    pub sequence: u64,
    pub op_type: String,
    pub kernel_key: String,
    pub path: String,
    pub fallback_used: bool,
    pub transforms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceEnvelope {
    pub schema_version: u32,
    pub mode: TraceMode,
    pub events: Vec<TraceEvent>,
    pub source_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    InvalidJson { diagnostic: String },
    UnknownField { field: String },
    VersionMismatch { expected: u32, found: u32 },
    ChecksumMismatch { expected: String, found: String },
    IncompatiblePayload { reason: String },
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson { diagnostic } => write!(f, "invalid json: {diagnostic}"),
            Self::UnknownField { field } => write!(f, "unknown field '{field}'"),
            Self::VersionMismatch { expected, found } => {
                write!(f, "schema version mismatch: expected={expected} found={found}")
            }
            Self::ChecksumMismatch { expected, found } => {
                write!(f, "checksum mismatch: expected={expected} found={found}")
            }
            Self::IncompatiblePayload { reason } => write!(f, "incompatible payload: {reason}"),
        }
    }
}

impl std::error::Error for TraceError {}

pub fn encode_trace(events: &[TraceEvent], mode: TraceMode) -> Result<String, TraceError> {
    let normalized = normalize_events(events);
    let source_hash = trace_hash(TRACE_SCHEMA_VERSION, mode, &normalized);

    let envelope = TraceEnvelope {
        schema_version: TRACE_SCHEMA_VERSION,
        mode,
        events: normalized,
        source_hash,
    };

    serde_json::to_string(&envelope).map_err(|error| TraceError::IncompatiblePayload {
        reason: format!("trace encoding failed: {error}"),
    })
}

pub fn decode_trace(input: &str, mode: DecodeMode) -> Result<TraceEnvelope, TraceError> {
    validate_payload_size(input)?;
    match mode {
        DecodeMode::Strict => decode_trace_strict(input),
        DecodeMode::Hardened => decode_trace_hardened(input),
    }
}

fn decode_trace_strict(input: &str) -> Result<TraceEnvelope, TraceError> {
    let envelope: TraceEnvelope = serde_json::from_str(input).map_err(|error| {
        if let Some(field) = extract_unknown_field(error.to_string().as_str()) {
            TraceError::UnknownField { field }
        } else {
            TraceError::InvalidJson { diagnostic: bounded(error.to_string().as_str(), 200) }
        }
    })?;
    validate_trace(&envelope)?;
    Ok(envelope)
}

fn decode_trace_hardened(input: &str) -> Result<TraceEnvelope, TraceError> {
    let raw: Value = serde_json::from_str(input).map_err(|error| TraceError::InvalidJson {
        diagnostic: bounded(
            format!("{error}; payload_prefix={} ", bounded(input.replace('\n', " ").as_str(), 96))
                .as_str(),
            220,
        ),
    })?;

    let obj = raw.as_object().ok_or_else(|| TraceError::IncompatiblePayload {
        reason: "top-level trace payload must be a JSON object".to_string(),
    })?;

    let allowed: BTreeSet<&str> = BTreeSet::from(["schema_version", "mode", "events", "source_hash"]);
    for key in obj.keys() {
        if !allowed.contains(key.as_str()) {
            return Err(TraceError::UnknownField { field: key.clone() });
        }
    }

    let envelope: TraceEnvelope =
        serde_json::from_value(raw).map_err(|error| TraceError::IncompatiblePayload {
            reason: bounded(error.to_string().as_str(), 200),
        })?;

    validate_trace(&envelope)?;
    Ok(envelope)
}

fn validate_payload_size(input: &str) -> Result<(), TraceError> {
    let actual = input.len();
    if actual > MAX_TRACE_PAYLOAD_BYTES {
        return Err(TraceError::IncompatiblePayload {
            reason: format!(
                "trace payload exceeds max bytes: actual={actual} max={MAX_TRACE_PAYLOAD_BYTES}"
            ),
        });
    }
    Ok(())
}

fn validate_trace(envelope: &TraceEnvelope) -> Result<(), TraceError> {
    if envelope.schema_version != TRACE_SCHEMA_VERSION {
        return Err(TraceError::VersionMismatch {
            expected: TRACE_SCHEMA_VERSION,
            found: envelope.schema_version,
        });
    }

    let normalized = normalize_events(&envelope.events);
    let expected = trace_hash(envelope.schema_version, envelope.mode, &normalized);
    if envelope.source_hash != expected {
        return Err(TraceError::ChecksumMismatch {
            expected,
            found: envelope.source_hash.clone(),
        });
    }

    Ok(())
}

fn normalize_events(events: &[TraceEvent]) -> Vec<TraceEvent> {
    let mut normalized = events.to_vec();
    normalized.sort_by_key(|event| event.sequence);
    normalized
}

/// FNV-1a over the canonical event fields, rendered as `det64:<hex>`.
#[derive(Debug)]
struct Det64(u64);

impl Det64 {
    fn new() -> Self {
        Self(0xcbf2_9ce4_8422_2325)
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= u64::from(*byte);
            self.0 = self.0.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }

    fn write_u64(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }

    fn write_u8(&mut self, value: u8) {
        self.write_bytes(&[value]);
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

fn trace_hash(schema_version: u32, mode: TraceMode, events: &[TraceEvent]) -> String {
    let mut hasher = Det64::new();
    hasher.write_u64(u64::from(schema_version));
    hasher.write_u8(match mode {
        TraceMode::Strict => 1,
        TraceMode::Hardened => 2,
    });
    for event in events {
        hasher.write_u64(event.sequence);
        hasher.write_bytes(event.op_type.as_bytes());
        hasher.write_bytes(event.kernel_key.as_bytes());
        hasher.write_bytes(event.path.as_bytes());
        hasher.write_u8(u8::from(event.fallback_used));
        hasher.write_u64(event.transforms);
    }
    format!("det64:{:016x}", hasher.finish())
}

fn extract_unknown_field(message: &str) -> Option<String> {
    // serde_json message shape: "unknown field `x`, expected ..."
    let marker = "unknown field `";
    let start = message.find(marker)? + marker.len();
    let tail = &message[start..];
    let end = tail.find('`')?;
    Some(tail[..end].to_string())
}

fn bounded(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        let mut boundary = max_len.min(input.len());
        while boundary > 0 && !input.is_char_boundary(boundary) {
            boundary -= 1;
        }
        format!("{}...", &input[..boundary])
    }
}
