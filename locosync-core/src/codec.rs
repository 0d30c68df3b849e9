use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ObjectKind, Sample, SyncObject};
use crate::week::IsoWeek;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid ISO week: {0}")]
    InvalidWeek(String),
    #[error("samples are stored in weekly batches, not as single objects")]
    SampleObject,
    #[error("sample {id} is dated outside of batch week {week}")]
    SampleOutsideWeek { id: uuid::Uuid, week: IsoWeek },
}

/// All samples of one ISO week; the unit of compression and re-upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    pub week: IsoWeek,
    pub samples: Vec<Sample>,
}

impl SampleBatch {
    pub fn new(week: IsoWeek, mut samples: Vec<Sample>) -> Self {
        samples.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
        Self { week, samples }
    }
}

pub fn encode_object(object: &SyncObject) -> Result<Vec<u8>, CodecError> {
    let mut out = match object {
        SyncObject::Place(place) => serde_json::to_vec_pretty(place)?,
        SyncObject::Note(note) => serde_json::to_vec_pretty(note)?,
        SyncObject::TimelineItem(item) => serde_json::to_vec_pretty(item)?,
        SyncObject::RangeSummary(summary) => serde_json::to_vec_pretty(summary)?,
        SyncObject::Sample(_) => return Err(CodecError::SampleObject),
    };
    out.push(b'\n');
    Ok(out)
}

pub fn decode_object(kind: ObjectKind, bytes: &[u8]) -> Result<SyncObject, CodecError> {
    Ok(match kind {
        ObjectKind::Place => SyncObject::Place(serde_json::from_slice(bytes)?),
        ObjectKind::Note => SyncObject::Note(serde_json::from_slice(bytes)?),
        ObjectKind::TimelineItem => SyncObject::TimelineItem(serde_json::from_slice(bytes)?),
        ObjectKind::RangeSummary => SyncObject::RangeSummary(serde_json::from_slice(bytes)?),
        ObjectKind::Sample => return Err(CodecError::SampleObject),
    })
}

pub fn encode_sample_batch(batch: &SampleBatch) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(batch)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Accepts gzip or plain JSON so hand-exported batches still import.
pub fn decode_sample_batch(bytes: &[u8]) -> Result<SampleBatch, CodecError> {
    let batch: SampleBatch = if bytes.starts_with(&GZIP_MAGIC) {
        let mut json = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut json)?;
        serde_json::from_slice(&json)?
    } else {
        serde_json::from_slice(bytes)?
    };
    if let Some(stray) = batch
        .samples
        .iter()
        .find(|sample| !batch.week.contains(sample.date))
    {
        return Err(CodecError::SampleOutsideWeek {
            id: stray.id,
            week: batch.week,
        });
    }
    Ok(batch)
}
