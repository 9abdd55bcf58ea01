//! Mapping between annotations, instrumentation keys and prong slots.

use crate::annotation::{
    decode_annotation_serialization, serialize_annotation_id, set_up_annotation_radixes, value,
    DecodedAnnotation,
};
use crate::core::{
    AnnotationId, CompoundId, InstrumentationKey, Result, SerializedAnnotation, Settings,
    TuningForkError,
};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Translates serialized annotations and keys into compound ids.
pub trait IdProvider {
    /// Decode an annotation into an id already scaled by the key limit
    fn decode_annotation_serialization(&self, ser: &[u8]) -> Result<DecodedAnnotation>;

    /// `key_index + annotation_id`, registering `key` if it is new
    fn make_compound_id(
        &self,
        key: InstrumentationKey,
        annotation_id: AnnotationId,
    ) -> Result<CompoundId>;
}

/// Dense indices for instrumentation keys, handed out in first-seen order.
///
/// Lookups never lock. A slot holds a value outside the key range until its
/// key is stored, so a half-registered slot never matches key 0. Two threads
/// registering the same new key at the same time may get different indices,
/// so each thread should own its keys.
#[derive(Debug)]
pub struct InstrumentKeyRegistry {
    keys: Vec<AtomicU32>,
    next: AtomicUsize,
}

impl InstrumentKeyRegistry {
    /// Slot value before a key is stored; outside the key range
    const EMPTY: u32 = u32::MAX;

    /// Registry with room for `max_keys` distinct keys
    pub fn new(max_keys: usize) -> Self {
        Self {
            keys: (0..max_keys).map(|_| AtomicU32::new(Self::EMPTY)).collect(),
            next: AtomicUsize::new(0),
        }
    }

    /// Index of `key`, assigning the next free one if needed
    pub fn get_or_create(&self, key: InstrumentationKey) -> Result<usize> {
        let known = self.next.load(Ordering::Acquire).min(self.keys.len());
        if let Some(index) = self.keys[..known]
            .iter()
            .position(|k| k.load(Ordering::Acquire) == u32::from(key))
        {
            return Ok(index);
        }
        let next = self.next.fetch_add(1, Ordering::AcqRel);
        if next < self.keys.len() {
            self.keys[next].store(u32::from(key), Ordering::Release);
            return Ok(next);
        }
        self.next.fetch_sub(1, Ordering::AcqRel);
        tracing::warn!("Instrument key {} rejected, all {} slots taken", key, self.keys.len());
        Err(TuningForkError::InvalidInstrumentKey {
            key,
            max: self.keys.len(),
        })
    }

    /// Registered keys in index order, up to the first slot still being filled
    pub fn keys(&self) -> Vec<InstrumentationKey> {
        let known = self.next.load(Ordering::Acquire).min(self.keys.len());
        self.keys[..known]
            .iter()
            .map_while(|k| InstrumentationKey::try_from(k.load(Ordering::Acquire)).ok())
            .collect()
    }
}

/// Annotation radixes and key registry for one session.
#[derive(Debug)]
pub struct IdMapper {
    radix_mult: Vec<u32>,
    max_keys: u64,
    loading_index: Option<usize>,
    level_index: Option<usize>,
    registry: InstrumentKeyRegistry,
}

impl IdMapper {
    /// Radixes and key limit taken from `settings`
    pub fn new(settings: &Settings) -> Self {
        let strategy = &settings.aggregation_strategy;
        let max_keys = strategy.max_instrumentation_keys.max(1);
        Self {
            radix_mult: set_up_annotation_radixes(&strategy.annotation_enum_size),
            max_keys: u64::from(max_keys),
            loading_index: settings.loading_annotation_index,
            level_index: settings.level_annotation_index,
            registry: InstrumentKeyRegistry::new(max_keys as usize),
        }
    }

    /// Cumulative radix of each annotation field
    pub fn radix_mult(&self) -> &[u32] {
        &self.radix_mult
    }

    /// Prong slots needed for every key index and annotation
    pub fn num_prongs(&self) -> usize {
        let annotations = u64::from(self.radix_mult.last().copied().unwrap_or(1));
        (annotations * self.max_keys) as usize
    }

    /// Annotation bytes of the slot addressed by `id`
    pub fn serialize_id(&self, id: CompoundId) -> SerializedAnnotation {
        serialize_annotation_id(id / self.max_keys, &self.radix_mult)
    }

    /// True when the slot's loading field is above 1
    pub fn is_loading_id(&self, id: CompoundId) -> bool {
        let Some(index) = self.loading_index else {
            return false;
        };
        value(id / self.max_keys, index, &self.radix_mult).map_or(false, |v| v > 1)
    }

    /// Key indices handed out so far
    pub fn registry(&self) -> &InstrumentKeyRegistry {
        &self.registry
    }
}

impl IdProvider for IdMapper {
    fn decode_annotation_serialization(&self, ser: &[u8]) -> Result<DecodedAnnotation> {
        let decoded = decode_annotation_serialization(
            ser,
            &self.radix_mult,
            self.loading_index,
            self.level_index,
        )?;
        Ok(DecodedAnnotation {
            id: decoded.id * self.max_keys,
            loading: decoded.loading,
        })
    }

    fn make_compound_id(
        &self,
        key: InstrumentationKey,
        annotation_id: AnnotationId,
    ) -> Result<CompoundId> {
        let index = self.registry.get_or_create(key)?;
        Ok(index as CompoundId + annotation_id)
    }
}
