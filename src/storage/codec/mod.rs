mod index_page;

pub use index_page::*;

use crate::error::{VellumError, VellumResult};
use crate::storage::page::RecordId;

/// A decoded value plus the number of bytes consumed.
pub type DecodedData<T> = (T, usize);

pub struct CommonCodec;

impl CommonCodec {
    pub fn encode_u8(data: u8) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u8(bytes: &[u8]) -> VellumResult<DecodedData<u8>> {
        if bytes.is_empty() {
            return Err(VellumError::Internal(
                "bytes length 0 is less than 1".to_string(),
            ));
        }
        Ok((bytes[0], 1))
    }

    pub fn encode_u32(data: u32) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u32(bytes: &[u8]) -> VellumResult<DecodedData<u32>> {
        if bytes.len() < 4 {
            return Err(VellumError::Internal(format!(
                "bytes length {} is less than 4",
                bytes.len()
            )));
        }
        let data = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok((data, 4))
    }
}

pub struct RidCodec;

impl RidCodec {
    pub const SIZE: usize = 8;

    pub fn encode(rid: &RecordId) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend(CommonCodec::encode_u32(rid.page_id));
        bytes.extend(CommonCodec::encode_u32(rid.slot_num));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> VellumResult<DecodedData<RecordId>> {
        let mut left_bytes = bytes;

        let (page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let (slot_num, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        Ok((
            RecordId::new(page_id, slot_num),
            bytes.len() - left_bytes.len(),
        ))
    }
}
