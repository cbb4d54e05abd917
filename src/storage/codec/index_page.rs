use crate::buffer::PAGE_SIZE;
use crate::error::{VellumError, VellumResult};
use crate::storage::codec::{CommonCodec, DecodedData, RidCodec};
use crate::storage::comparator::KeySchema;
use crate::storage::page::{
    BPlusTreeHeaderPage, BPlusTreeInternalPage, BPlusTreeInternalPageHeader, BPlusTreeLeafPage,
    BPlusTreeLeafPageHeader, BPlusTreePage, BPlusTreePageType,
};

fn check_page_size(bytes: &[u8]) -> VellumResult<()> {
    if bytes.len() != PAGE_SIZE {
        return Err(VellumError::Storage(format!(
            "index page size is {} instead of {}",
            bytes.len(),
            PAGE_SIZE
        )));
    }
    Ok(())
}

fn decode_key(bytes: &[u8], key_size: usize) -> VellumResult<DecodedData<Vec<u8>>> {
    if bytes.len() < key_size {
        return Err(VellumError::Storage(format!(
            "bytes length {} is less than the key width {}",
            bytes.len(),
            key_size
        )));
    }
    Ok((bytes[..key_size].to_vec(), key_size))
}

pub struct BPlusTreeHeaderPageCodec;

impl BPlusTreeHeaderPageCodec {
    pub fn encode(page: &BPlusTreeHeaderPage) -> Vec<u8> {
        let mut bytes = CommonCodec::encode_u32(page.root_page_id);
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> VellumResult<DecodedData<BPlusTreeHeaderPage>> {
        check_page_size(bytes)?;
        let (root_page_id, offset) = CommonCodec::decode_u32(bytes)?;
        Ok((BPlusTreeHeaderPage { root_page_id }, offset))
    }
}

pub struct BPlusTreePageTypeCodec;

impl BPlusTreePageTypeCodec {
    pub fn encode(page_type: &BPlusTreePageType) -> Vec<u8> {
        match page_type {
            BPlusTreePageType::LeafPage => CommonCodec::encode_u8(1),
            BPlusTreePageType::InternalPage => CommonCodec::encode_u8(2),
        }
    }

    pub fn decode(bytes: &[u8]) -> VellumResult<DecodedData<BPlusTreePageType>> {
        let (flag, offset) = CommonCodec::decode_u8(bytes)?;
        match flag {
            1 => Ok((BPlusTreePageType::LeafPage, offset)),
            2 => Ok((BPlusTreePageType::InternalPage, offset)),
            _ => Err(VellumError::Storage(format!("invalid page type {}", flag))),
        }
    }
}

pub struct BPlusTreePageCodec;

impl BPlusTreePageCodec {
    pub fn encode(page: &BPlusTreePage) -> Vec<u8> {
        match page {
            BPlusTreePage::Leaf(page) => BPlusTreeLeafPageCodec::encode(page),
            BPlusTreePage::Internal(page) => BPlusTreeInternalPageCodec::encode(page),
        }
    }

    pub fn decode(bytes: &[u8], key_schema: KeySchema) -> VellumResult<DecodedData<BPlusTreePage>> {
        check_page_size(bytes)?;
        // peek the tag without consuming
        let (page_type, _) = BPlusTreePageTypeCodec::decode(bytes)?;
        match page_type {
            BPlusTreePageType::LeafPage => {
                let (page, offset) = BPlusTreeLeafPageCodec::decode(bytes, key_schema)?;
                Ok((BPlusTreePage::Leaf(page), offset))
            }
            BPlusTreePageType::InternalPage => {
                let (page, offset) = BPlusTreeInternalPageCodec::decode(bytes, key_schema)?;
                Ok((BPlusTreePage::Internal(page), offset))
            }
        }
    }
}

pub struct BPlusTreeLeafPageCodec;

impl BPlusTreeLeafPageCodec {
    pub fn encode(page: &BPlusTreeLeafPage) -> Vec<u8> {
        let key_size = page.key_schema.key_size;
        let mut bytes = BPlusTreeLeafPageHeaderCodec::encode(&page.header);
        for (key, rid) in page.array.iter() {
            debug_assert_eq!(key.len(), key_size);
            bytes.extend_from_slice(key);
            bytes.extend(RidCodec::encode(rid));
        }
        assert!(bytes.len() <= PAGE_SIZE);
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(
        bytes: &[u8],
        key_schema: KeySchema,
    ) -> VellumResult<DecodedData<BPlusTreeLeafPage>> {
        check_page_size(bytes)?;
        let (header, offset) = BPlusTreeLeafPageHeaderCodec::decode(bytes)?;
        if !matches!(header.page_type, BPlusTreePageType::LeafPage) {
            return Err(VellumError::Storage(
                "index page type must be leaf page".to_string(),
            ));
        }
        let mut left_bytes = &bytes[offset..];

        let mut array = Vec::with_capacity(header.current_size as usize);
        for _ in 0..header.current_size {
            let (key, offset) = decode_key(left_bytes, key_schema.key_size)?;
            left_bytes = &left_bytes[offset..];

            let (rid, offset) = RidCodec::decode(left_bytes)?;
            left_bytes = &left_bytes[offset..];

            array.push((key, rid));
        }

        Ok((
            BPlusTreeLeafPage {
                header,
                array,
                key_schema,
            },
            PAGE_SIZE,
        ))
    }
}

pub struct BPlusTreeInternalPageCodec;

impl BPlusTreeInternalPageCodec {
    pub fn encode(page: &BPlusTreeInternalPage) -> Vec<u8> {
        let key_size = page.key_schema.key_size;
        let mut bytes = BPlusTreeInternalPageHeaderCodec::encode(&page.header);
        for (index, (key, page_id)) in page.array.iter().enumerate() {
            // slot 0's key is a sentinel and is encoded as zeroes
            if index == 0 || key.len() != key_size {
                bytes.extend(vec![0u8; key_size]);
            } else {
                bytes.extend_from_slice(key);
            }
            bytes.extend(CommonCodec::encode_u32(*page_id));
        }
        assert!(bytes.len() <= PAGE_SIZE);
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(
        bytes: &[u8],
        key_schema: KeySchema,
    ) -> VellumResult<DecodedData<BPlusTreeInternalPage>> {
        check_page_size(bytes)?;
        let (header, offset) = BPlusTreeInternalPageHeaderCodec::decode(bytes)?;
        if !matches!(header.page_type, BPlusTreePageType::InternalPage) {
            return Err(VellumError::Storage(
                "index page type must be internal page".to_string(),
            ));
        }
        let mut left_bytes = &bytes[offset..];

        let mut array = Vec::with_capacity(header.current_size as usize);
        for _ in 0..header.current_size {
            let (key, offset) = decode_key(left_bytes, key_schema.key_size)?;
            left_bytes = &left_bytes[offset..];

            let (page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
            left_bytes = &left_bytes[offset..];

            array.push((key, page_id));
        }

        Ok((
            BPlusTreeInternalPage {
                header,
                array,
                key_schema,
            },
            PAGE_SIZE,
        ))
    }
}

pub struct BPlusTreeLeafPageHeaderCodec;

impl BPlusTreeLeafPageHeaderCodec {
    pub fn encode(header: &BPlusTreeLeafPageHeader) -> Vec<u8> {
        let mut bytes = BPlusTreePageTypeCodec::encode(&header.page_type);
        bytes.extend(CommonCodec::encode_u32(header.current_size));
        bytes.extend(CommonCodec::encode_u32(header.max_size));
        bytes.extend(CommonCodec::encode_u32(header.next_page_id));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> VellumResult<DecodedData<BPlusTreeLeafPageHeader>> {
        let mut left_bytes = bytes;

        let (page_type, offset) = BPlusTreePageTypeCodec::decode(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let (current_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let (max_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let (next_page_id, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        Ok((
            BPlusTreeLeafPageHeader {
                page_type,
                current_size,
                max_size,
                next_page_id,
            },
            bytes.len() - left_bytes.len(),
        ))
    }
}

pub struct BPlusTreeInternalPageHeaderCodec;

impl BPlusTreeInternalPageHeaderCodec {
    pub fn encode(header: &BPlusTreeInternalPageHeader) -> Vec<u8> {
        let mut bytes = BPlusTreePageTypeCodec::encode(&header.page_type);
        bytes.extend(CommonCodec::encode_u32(header.current_size));
        bytes.extend(CommonCodec::encode_u32(header.max_size));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> VellumResult<DecodedData<BPlusTreeInternalPageHeader>> {
        let mut left_bytes = bytes;

        let (page_type, offset) = BPlusTreePageTypeCodec::decode(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let (current_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let (max_size, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        Ok((
            BPlusTreeInternalPageHeader {
                page_type,
                current_size,
                max_size,
            },
            bytes.len() - left_bytes.len(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::comparator::{default_comparator, KeySchema};
    use crate::storage::page::{Key, RecordId};

    fn schema() -> KeySchema {
        KeySchema::new(4, default_comparator)
    }

    fn key(value: u32) -> Key {
        value.to_be_bytes().to_vec()
    }

    #[test]
    fn header_page_roundtrip() {
        let page = BPlusTreeHeaderPage { root_page_id: 42 };
        let encoded = BPlusTreeHeaderPageCodec::encode(&page);
        assert_eq!(encoded.len(), PAGE_SIZE);
        let (decoded, _) = BPlusTreeHeaderPageCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn leaf_page_roundtrip() {
        let mut leaf = BPlusTreeLeafPage::new(schema(), 10);
        leaf.insert(key(1), RecordId::new(1, 1));
        leaf.insert(key(2), RecordId::new(2, 2));
        leaf.header.next_page_id = 7;

        let encoded = BPlusTreeLeafPageCodec::encode(&leaf);
        let (decoded, _) = BPlusTreeLeafPageCodec::decode(&encoded, schema()).unwrap();
        assert_eq!(decoded.header, leaf.header);
        assert_eq!(decoded.array, leaf.array);
    }

    #[test]
    fn internal_page_roundtrip_zeroes_sentinel() {
        let mut internal = BPlusTreeInternalPage::new(schema(), 10);
        internal.batch_insert(vec![(Key::new(), 3), (key(5), 4), (key(9), 5)]);

        let encoded = BPlusTreeInternalPageCodec::encode(&internal);
        let (decoded, _) = BPlusTreeInternalPageCodec::decode(&encoded, schema()).unwrap();
        assert_eq!(decoded.header, internal.header);
        // sentinel decodes as zero bytes of the key width
        assert_eq!(decoded.key_at(0), &vec![0u8; 4]);
        assert_eq!(decoded.value_at(0), 3);
        assert_eq!(&decoded.array[1..], &internal.array[1..]);
    }

    #[test]
    fn tagged_decode_dispatches_on_page_type() {
        let leaf = BPlusTreeLeafPage::new(schema(), 10);
        let encoded = BPlusTreeLeafPageCodec::encode(&leaf);
        let (page, _) = BPlusTreePageCodec::decode(&encoded, schema()).unwrap();
        assert!(matches!(page, BPlusTreePage::Leaf(_)));

        let internal = BPlusTreeInternalPage::new(schema(), 10);
        let mut encoded = BPlusTreeInternalPageCodec::encode(&internal);
        let (page, _) = BPlusTreePageCodec::decode(&encoded, schema()).unwrap();
        assert!(matches!(page, BPlusTreePage::Internal(_)));

        encoded[0] = 9;
        assert!(BPlusTreePageCodec::decode(&encoded, schema()).is_err());

        // a zeroed page is not a valid node
        let zeroed = vec![0u8; PAGE_SIZE];
        assert!(BPlusTreePageCodec::decode(&zeroed, schema()).is_err());
    }
}
