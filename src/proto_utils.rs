/// 只有长于该值的查询才会生成压缩指针变体
const MIN_COMPRESSIBLE_LEN: usize = 16;

/// 压缩指针：高两位 0b11，偏移 0x004（指向报头 QDCOUNT 字段）
const COMPRESSION_POINTER: [u8; 2] = [0xC0, 0x04];

/// Transaction ID of a raw message, if it has one.
#[inline]
pub fn message_id(packet: &[u8]) -> Option<u16> {
    let bytes = packet.get(..2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// 覆写报文前两个字节（事务 ID），返回原 ID / Overwrite the transaction ID, returning the previous one
#[inline]
pub fn rewrite_id(packet: &mut [u8], id: u16) -> Option<u16> {
    let old = message_id(packet)?;
    packet[..2].copy_from_slice(&id.to_be_bytes());
    Some(old)
}

/// 为发往国外上游的查询构造带压缩指针的变体
/// Build the query variant sent to foreign upstreams: the terminating zero of
/// the first question name is replaced by a pointer to offset 4. The QDCOUNT
/// high byte there is zero, so the name still ends at the root and the
/// variant is one byte longer than the original.
///
/// Returns `None` when the packet is too short, the name already ends in a
/// pointer, or no terminating zero is found before the last four bytes; the
/// caller then sends the original packet everywhere.
pub fn compression_variant(packet: &[u8]) -> Option<Vec<u8>> {
    let len = packet.len();
    if len <= MIN_COMPRESSIBLE_LEN {
        return None;
    }

    // 1. Walk labels of the first QNAME (header is 12 bytes)
    let mut pos = 12;
    let end = loop {
        if pos >= len - 4 {
            return None;
        }
        let label = packet[pos];
        if label & 0xC0 != 0 {
            return None;
        }
        if label == 0 {
            break pos;
        }
        pos += 1 + label as usize;
    };

    // 2. The pointer ends the name by itself, so it takes the zero byte's place
    let mut out = Vec::with_capacity(len + 1);
    out.extend_from_slice(&packet[..end]);
    out.extend_from_slice(&COMPRESSION_POINTER);
    out.extend_from_slice(&packet[end + 1..]);
    Some(out)
}
