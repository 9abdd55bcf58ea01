//! Identifier types shared by the aggregation pipeline.

/// Identifies a tick point within a frame or a trace segment.
pub type InstrumentationKey = u16;

/// Mixed-radix encoding of an annotation, pre-multiplied by the instrument key limit.
pub type AnnotationId = u64;

/// `key_index + annotation_id`: the dense address of a prong slot.
pub type CompoundId = u64;

/// Sparse varint bytes of an annotation message.
pub type SerializedAnnotation = Vec<u8>;

/// Handle returned by `start_trace`, equal to the compound id being traced.
pub type TraceHandle = u64;

/// Instrumentation keys reserved for frame timing.
pub mod ikeys {
    use super::InstrumentationKey;

    /// First key available to games for their own timers.
    pub const USER_DEFINED_BASE: InstrumentationKey = 0;
    /// Time between consecutive frame submissions.
    pub const RAW_FRAME_TIME: InstrumentationKey = 64000;
    /// Frame time after swap pacing.
    pub const PACED_FRAME_TIME: InstrumentationKey = 64001;
    /// CPU time spent on a frame.
    pub const CPU_TIME: InstrumentationKey = 64002;
    /// GPU time spent on a frame.
    pub const GPU_TIME: InstrumentationKey = 64003;
}
