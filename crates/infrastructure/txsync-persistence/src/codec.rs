use serde::de::DeserializeOwned;
use serde::Serialize;
use txsync_core::TimeRange;

use crate::StorageError;

pub fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(record)?)
}

pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_ranges(ranges: &[TimeRange]) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(ranges)?)
}

pub fn decode_ranges(bytes: &[u8]) -> Result<Vec<TimeRange>, StorageError> {
    Ok(serde_json::from_slice(bytes)?)
}
