use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::Result;
use crate::errcorrupt;

/// Byte size of the `u32 total_len` prefix framing every record.
pub const LENGTH_PREFIX_SIZE: usize = 4;

// total_len + key_len + value_len fields
const FIXED_OVERHEAD: usize = 12;

/// One (key, value) pair as it is written to a segment file.
///
/// On disk a record is self-delimiting:
///
/// ```text
/// [u32 total_len][u32 key_len][key bytes][u32 value_len][value bytes]
/// ```
///
/// All integers are little-endian and `total_len` counts the whole record,
/// its own four bytes included. The prefix lets recovery frame records
/// while streaming and lets readers size a single bounded read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: String,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// The encoded byte length of this entry, without producing the bytes.
    /// The writer uses this to decide rotation before allocating anything.
    pub fn encoded_len(&self) -> u64 {
        (FIXED_OVERHEAD + self.key.len() + self.value.len()) as u64
    }

    /// Encodes the entry into a freshly allocated record.
    pub fn encode(&self) -> Vec<u8> {
        let total = FIXED_OVERHEAD + self.key.len() + self.value.len();
        let mut buf = Vec::with_capacity(total);
        buf.write_u32::<LittleEndian>(total as u32).unwrap();
        buf.write_u32::<LittleEndian>(self.key.len() as u32).unwrap();
        buf.extend_from_slice(self.key.as_bytes());
        buf.write_u32::<LittleEndian>(self.value.len() as u32).unwrap();
        buf.extend_from_slice(self.value.as_bytes());
        buf
    }

    /// Decodes one record from the front of `buf`.
    ///
    /// Fails when any length field would read past the slice or when the
    /// total length disagrees with the sum of the inner fields.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FIXED_OVERHEAD {
            return errcorrupt!("record shorter than {FIXED_OVERHEAD} bytes");
        }

        let total = LittleEndian::read_u32(&buf[0..4]) as usize;
        if total < FIXED_OVERHEAD {
            return errcorrupt!("record length {total} below minimum");
        }
        if total > buf.len() {
            return errcorrupt!(
                "record length {total} exceeds {} available bytes",
                buf.len()
            );
        }

        let key_len = LittleEndian::read_u32(&buf[4..8]) as usize;
        if LENGTH_PREFIX_SIZE + 4 + key_len + 4 > total {
            return errcorrupt!("key length {key_len} overruns record of {total} bytes");
        }

        let key_end = 8 + key_len;
        let value_len = LittleEndian::read_u32(&buf[key_end..key_end + 4]) as usize;
        if FIXED_OVERHEAD + key_len + value_len != total {
            return errcorrupt!(
                "length fields disagree: total {total}, key {key_len}, value {value_len}"
            );
        }

        let key = std::str::from_utf8(&buf[8..key_end])
            .map_err(|e| crate::Error::CorruptRecord(format!("key is not UTF-8: {e}")))?;
        let value = std::str::from_utf8(&buf[key_end + 4..total])
            .map_err(|e| crate::Error::CorruptRecord(format!("value is not UTF-8: {e}")))?;

        Ok(Self::new(key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_encode_decode_round_trip() {
        let cases = [
            Entry::new("alpha", "1"),
            Entry::new("k", ""),
            Entry::new("ключ", "значение"),
            Entry::new("emoji-🌋", "🔥🔥"),
            Entry::new("long", "v".repeat(10_000)),
        ];

        for entry in cases {
            let buf = entry.encode();
            assert_eq!(buf.len() as u64, entry.encoded_len());
            let decoded = Entry::decode(&buf).expect("Failed to decode");
            assert_eq!(decoded, entry);
        }
    }

    #[test]
    fn test_decode_from_longer_buffer() {
        // Streams carry more than one record; decode must stop at total_len.
        let mut buf = Entry::new("a", "1").encode();
        let second = Entry::new("b", "2").encode();
        buf.extend_from_slice(&second);

        let decoded = Entry::decode(&buf).expect("Failed to decode");
        assert_eq!(decoded, Entry::new("a", "1"));
    }

    #[test]
    fn test_decode_truncated_record() {
        let buf = Entry::new("key1", "value1").encode();
        let result = Entry::decode(&buf[..buf.len() - 1]);
        assert!(matches!(result, Err(Error::CorruptRecord(_))));
    }

    #[test]
    fn test_decode_short_buffer() {
        assert!(matches!(
            Entry::decode(&[0x01, 0x02]),
            Err(Error::CorruptRecord(_))
        ));
    }

    #[test]
    fn test_decode_disagreeing_lengths() {
        let mut buf = Entry::new("key1", "value1").encode();
        // Shrink the inner value length so the field sum no longer matches.
        let value_len_offset = 8 + "key1".len();
        buf[value_len_offset] -= 1;
        assert!(matches!(
            Entry::decode(&buf),
            Err(Error::CorruptRecord(_))
        ));
    }

    #[test]
    fn test_decode_oversized_key_length() {
        let mut buf = Entry::new("key1", "value1").encode();
        buf[4] = 0xff;
        buf[5] = 0xff;
        assert!(matches!(
            Entry::decode(&buf),
            Err(Error::CorruptRecord(_))
        ));
    }

    #[test]
    fn test_decode_non_utf8_value() {
        let mut buf = Entry::new("key1", "vvvv").encode();
        let value_start = buf.len() - 4;
        buf[value_start] = 0xff;
        buf[value_start + 1] = 0xfe;
        assert!(matches!(
            Entry::decode(&buf),
            Err(Error::CorruptRecord(_))
        ));
    }
}
