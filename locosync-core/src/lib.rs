mod codec;
mod model;
mod naming;
mod week;

pub use codec::{
    CodecError, SampleBatch, decode_object, decode_sample_batch, encode_object,
    encode_sample_batch,
};
pub use model::{
    ItemType, Note, ObjectKind, ParentRef, Place, RangeSummary, Sample, SyncObject, SyncStamp,
    Syncable, TimelineItem, Timestamp, needs_backup,
};
pub use naming::{FileRef, PLACEHOLDER_SUFFIX, ParsedPath};
pub use week::IsoWeek;
